//! Gate between a build and its local cache.
//!
//! The host asks the controller, not the service: a disabled cache misses on
//! every load without touching the disk, and a cache without push only
//! serves what is already there.

use std::io::{Read, Write};
use std::path::Path;

use build_cache_key::HashKey;
use tracing::debug;

use crate::config::BuildCacheConfig;
use crate::error::{BoxError, CacheResult};
use crate::service::{Fetched, LocalCacheOptions, LocalCacheService};

/// Why a store did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The local cache is disabled
    Disabled,
    /// Push is off
    ReadOnly,
}

/// Outcome of a store request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Skipped(SkipReason),
}

/// Applies the enabled and push settings in front of a [`LocalCacheService`].
#[derive(Debug)]
pub struct BuildCacheController {
    local: Option<LocalCacheService>,
    push: bool,
}

impl BuildCacheController {
    /// Open the cache `config` describes. A disabled cache opens nothing.
    pub fn open(config: &BuildCacheConfig) -> CacheResult<Self> {
        if !config.enabled {
            debug!("local build cache disabled");
            return Ok(Self::new(None, false));
        }

        let local = LocalCacheService::open(LocalCacheOptions::from_config(config))?;
        Ok(Self::new(Some(local), config.push))
    }

    pub fn new(local: Option<LocalCacheService>, push: bool) -> Self {
        Self { local, push }
    }

    pub fn is_enabled(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_push_enabled(&self) -> bool {
        self.local.is_some() && self.push
    }

    pub fn local(&self) -> Option<&LocalCacheService> {
        self.local.as_ref()
    }

    /// See [`LocalCacheService::load`]. Always a miss when disabled.
    pub fn load<T, E, F>(&self, key: &HashKey, reader: F) -> CacheResult<Option<T>>
    where
        F: FnOnce(&mut dyn Read) -> Result<T, E>,
        E: Into<BoxError>,
    {
        match &self.local {
            Some(local) => local.load(key, reader),
            None => Ok(None),
        }
    }

    pub fn fetch(&self, key: &HashKey) -> Fetched {
        match &self.local {
            Some(local) => local.fetch(key),
            None => Fetched::NotFound,
        }
    }

    /// See [`LocalCacheService::store`]. `writer` is not called when the
    /// store is skipped.
    pub fn store<E, F>(&self, key: &HashKey, writer: F) -> CacheResult<StoreOutcome>
    where
        F: FnOnce(&mut dyn Write) -> Result<(), E>,
        E: Into<BoxError>,
    {
        let local = match self.store_target() {
            Ok(local) => local,
            Err(reason) => return Ok(StoreOutcome::Skipped(reason)),
        };
        local.store(key, writer)?;
        Ok(StoreOutcome::Stored)
    }

    pub fn store_locally(&self, key: &HashKey, file: &Path) -> CacheResult<StoreOutcome> {
        let local = match self.store_target() {
            Ok(local) => local,
            Err(reason) => return Ok(StoreOutcome::Skipped(reason)),
        };
        local.store_locally(key, file)?;
        Ok(StoreOutcome::Stored)
    }

    pub fn close(&self) -> CacheResult<()> {
        match &self.local {
            Some(local) => local.close(),
            None => Ok(()),
        }
    }

    fn store_target(&self) -> Result<&LocalCacheService, SkipReason> {
        match &self.local {
            None => Err(SkipReason::Disabled),
            Some(_) if !self.push => Err(SkipReason::ReadOnly),
            Some(local) => Ok(local),
        }
    }
}
