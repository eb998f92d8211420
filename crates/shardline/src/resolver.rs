//! Backend directory seam.
//!
//! Resolution maps a stable cookie to a live backend descriptor. The
//! directory is external to this core; the client only needs the async
//! seam plus a static implementation for fixed deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;

use shardwire::{BackendInfo, CookieId};

use crate::error::ResolverError;

/// Asynchronous cookie-to-backend resolution.
#[async_trait]
pub trait BackendInfoResolver: Send + Sync {
    /// Resolve `cookie` to a live backend descriptor.
    ///
    /// May take arbitrarily long; the connection's timer regime bounds how
    /// long the client waits before retrying with backoff.
    async fn resolve(&self, cookie: CookieId) -> Result<BackendInfo, ResolverError>;
}

/// Resolver backed by a fixed cookie-to-backend table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    backends: HashMap<CookieId, BackendInfo>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, cookie: CookieId, info: BackendInfo) -> Self {
        self.backends.insert(cookie, info);
        self
    }
}

#[async_trait]
impl BackendInfoResolver for StaticResolver {
    async fn resolve(&self, cookie: CookieId) -> Result<BackendInfo, ResolverError> {
        self.backends
            .get(&cookie)
            .cloned()
            .ok_or(ResolverError::UnknownCookie(cookie))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardwire::AbiVersion;

    #[tokio::test]
    async fn static_resolver_lookup() {
        let info = BackendInfo::new("actor://member-1/shard-2", "shard-2", AbiVersion::V2, 10);
        let resolver = StaticResolver::new().with_backend(CookieId(2), info.clone());

        assert_eq!(resolver.resolve(CookieId(2)).await.unwrap(), info);
        assert_eq!(
            resolver.resolve(CookieId(9)).await.unwrap_err(),
            ResolverError::UnknownCookie(CookieId(9))
        );
    }
}
