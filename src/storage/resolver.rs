//! Turning storage policies into live backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::policy::{BackendConfig, StoragePolicy};
use super::{LocalBackend, ObjectStoreBackend, OneDriveBackend, SftpBackend, StorageBackend};
use crate::Result;

/// Resolves a policy record into a backend handle.
///
/// Injected into the file service so tests and embedders can substitute
/// their own backends.
pub trait BackendResolver: Send + Sync {
    /// Build (or fetch) the backend for `policy`.
    fn resolve(&self, policy: &StoragePolicy) -> Result<Arc<dyn StorageBackend>>;
}

struct CachedBackend {
    policy_type: String,
    config: String,
    backend: Arc<dyn StorageBackend>,
}

/// The standard resolver over the built-in backend variants.
pub struct PolicyResolver {
    http: reqwest::Client,
    cache: Option<Mutex<HashMap<i64, CachedBackend>>>,
}

impl PolicyResolver {
    /// A resolver that builds a fresh backend on every call.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: None,
        }
    }

    /// A resolver that keeps one backend per policy id and rebuilds it when
    /// the policy's type or configuration changes.
    pub fn pooled() -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: Some(Mutex::new(HashMap::new())),
        }
    }

    /// Build a backend from a decoded configuration.
    pub fn build(&self, config: BackendConfig) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match config {
            BackendConfig::Local(c) => Arc::new(LocalBackend::new(c.root)),
            BackendConfig::S3(c) => Arc::new(ObjectStoreBackend::s3(&c)?),
            BackendConfig::Oss(c) => Arc::new(ObjectStoreBackend::oss(&c)?),
            BackendConfig::Cos(c) => Arc::new(ObjectStoreBackend::cos(&c)?),
            BackendConfig::Sftp(c) => Arc::new(SftpBackend::new(c)),
            BackendConfig::OneDrive(c) => Arc::new(OneDriveBackend::new(c, self.http.clone())),
        };
        Ok(backend)
    }

    /// Drop any cached backend for `policy_id`.
    pub fn invalidate(&self, policy_id: i64) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.remove(&policy_id);
        }
    }
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendResolver for PolicyResolver {
    fn resolve(&self, policy: &StoragePolicy) -> Result<Arc<dyn StorageBackend>> {
        let Some(cache) = &self.cache else {
            return self.build(policy.backend_config()?);
        };

        let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&policy.id) {
            if cached.policy_type == policy.policy_type && cached.config == policy.config {
                return Ok(Arc::clone(&cached.backend));
            }
        }

        let backend = self.build(policy.backend_config()?)?;
        debug!(
            policy_id = policy.id,
            kind = backend.kind(),
            "built storage backend"
        );
        cache.insert(
            policy.id,
            CachedBackend {
                policy_type: policy.policy_type.clone(),
                config: policy.config.clone(),
                backend: Arc::clone(&backend),
            },
        );
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HoardError;
    use chrono::Utc;

    fn policy(id: i64, policy_type: &str, config: &str) -> StoragePolicy {
        StoragePolicy {
            id,
            name: format!("p{id}"),
            policy_type: policy_type.to_string(),
            config: config.to_string(),
            is_default: false,
            status: 1,
            base_url: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_local() {
        let resolver = PolicyResolver::new();
        let backend = resolver
            .resolve(&policy(1, "local", r#"{"root": "/tmp/hoard"}"#))
            .unwrap();
        assert_eq!(backend.kind(), "local");
    }

    #[test]
    fn test_resolve_unknown_type() {
        let resolver = PolicyResolver::new();
        let result = resolver.resolve(&policy(1, "floppy", "{}"));
        assert!(matches!(result, Err(HoardError::UnsupportedPolicyType(_))));
    }

    #[test]
    fn test_resolve_shape_mismatch() {
        let resolver = PolicyResolver::new();
        let result = resolver.resolve(&policy(1, "s3", r#"{"root": "/tmp"}"#));
        assert!(matches!(result, Err(HoardError::InvalidPolicyConfig(_))));
    }

    #[test]
    fn test_fresh_resolver_builds_each_time() {
        let resolver = PolicyResolver::new();
        let p = policy(1, "local", r#"{"root": "/tmp/a"}"#);
        let a = resolver.resolve(&p).unwrap();
        let b = resolver.resolve(&p).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_pooled_resolver_reuses_and_rebuilds() {
        let resolver = PolicyResolver::pooled();
        let p = policy(1, "local", r#"{"root": "/tmp/a"}"#);

        let a = resolver.resolve(&p).unwrap();
        let b = resolver.resolve(&p).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let changed = policy(1, "local", r#"{"root": "/tmp/b"}"#);
        let c = resolver.resolve(&changed).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        resolver.invalidate(1);
        let d = resolver.resolve(&changed).unwrap();
        assert!(!Arc::ptr_eq(&c, &d));
    }
}
