//! Single-writer leases over the cache store.
//!
//! A lease is a cache key with a TTL acting as a single-writer token: if the
//! key is absent (or expired) the set-if-absent write wins; otherwise the
//! caller backs off. Dropping a guard without releasing leaves the TTL to
//! expire the lease.

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct Lease;

impl Lease {
    /// Acquire the named lease or fail with `LeaseUnavailable`.
    pub async fn acquire(
        cache: Arc<dyn CacheStore>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<LeaseGuard> {
        let key = key.into();
        let holder = Uuid::new_v4().to_string();
        let won = cache.set_if_absent(&key, holder.clone(), ttl).await?;
        if !won {
            return Err(Error::lease_unavailable(key));
        }
        Ok(LeaseGuard { cache, key, holder })
    }
}

pub struct LeaseGuard {
    cache: Arc<dyn CacheStore>,
    key: String,
    holder: String,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease early. Only removes the key if this guard still
    /// holds it.
    pub async fn release(self) -> Result<()> {
        if self.cache.get_raw(&self.key).await?.as_deref() == Some(self.holder.as_str()) {
            self.cache.remove(&self.key).await?;
        }
        Ok(())
    }
}
