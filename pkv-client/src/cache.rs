//! # Cache Adapter
//!
//! Purpose: A generic key/value cache capability with optional expiry,
//! implemented for `PkvClient` purely on top of the two command primitives.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use pkv_common::PkvResult;

use crate::client::PkvClient;

/// Minimal async cache surface.
pub trait Cache {
    /// Value for `key`, or `None` when absent.
    fn get(&self, key: &[u8]) -> impl Future<Output = PkvResult<Option<Bytes>>> + Send;

    /// Stores `value`; `ttl` of `None` means no expiry.
    fn set(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> impl Future<Output = PkvResult<()>> + Send;

    /// Resets the expiry of an existing key. Returns false when it is absent.
    fn refresh(&self, key: &[u8], ttl: Duration) -> impl Future<Output = PkvResult<bool>> + Send;

    /// Deletes `key`. Returns false when it was absent.
    fn remove(&self, key: &[u8]) -> impl Future<Output = PkvResult<bool>> + Send;
}

impl Cache for PkvClient {
    async fn get(&self, key: &[u8]) -> PkvResult<Option<Bytes>> {
        PkvClient::get(self, key).await
    }

    async fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> PkvResult<()> {
        match ttl {
            Some(ttl) => self.set_with_ttl(key, value, ttl).await,
            None => PkvClient::set(self, key, value).await,
        }
    }

    async fn refresh(&self, key: &[u8], ttl: Duration) -> PkvResult<bool> {
        self.expire(key, ttl).await
    }

    async fn remove(&self, key: &[u8]) -> PkvResult<bool> {
        self.del(key).await
    }
}
