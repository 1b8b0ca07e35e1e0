//! On-disk entry storage
//!
//! Entries live at `<root>/<first 2 hex digits>/<HEX>`. New content is staged
//! in a temp file in the cache root and renamed into place, so an entry path
//! only ever shows complete content. Neither type here locks; callers hold the
//! cache lock around every call.

pub mod file_store;
pub mod staging;

pub use file_store::{
    ContentAddressableFileStore, EntryIdentity, StoredEntry, DEFAULT_FAILED_SUFFIX,
};
pub use staging::{OrphanedTempFileCleanup, TempFileStaging, TEMP_SUFFIX};
