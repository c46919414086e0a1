//! Scheme → provider table
//!
//! One registry per flow. Registration order is the priority rule: the last
//! provider registered for a scheme serves it, so a stage loaded later can
//! replace a built-in provider for the schemes it names.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::error::{TransferError, TransferResult};
use super::{FileProvider, HttpProvider, TransferProvider};

/// Transfer provider registry for a flow
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn TransferProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `file`, `http` and `https` providers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_builtin();
        registry
    }

    fn register_builtin(&mut self) {
        let file: Arc<dyn TransferProvider> = Arc::new(FileProvider::new());
        self.register(file.schemes(), file);

        let http: Arc<dyn TransferProvider> = Arc::new(HttpProvider::new());
        self.register(http.schemes(), http);
    }

    /// Register `provider` for `schemes`; replaces any earlier registration
    pub fn register<I, S>(&mut self, schemes: I, provider: Arc<dyn TransferProvider>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for scheme in schemes {
            let scheme = scheme.into().to_ascii_lowercase();
            if let Some(previous) = self.providers.insert(scheme.clone(), provider.clone()) {
                debug!(
                    scheme = %scheme,
                    previous = previous.name(),
                    provider = provider.name(),
                    "transfer provider replaced"
                );
            }
        }
    }

    /// Provider serving `scheme`
    pub fn resolve(&self, scheme: &str) -> TransferResult<Arc<dyn TransferProvider>> {
        self.providers
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransferError::NoProvider {
                scheme: scheme.to_string(),
            })
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.providers.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Scheme → provider name, sorted by scheme
    pub fn table(&self) -> BTreeMap<String, String> {
        self.providers
            .iter()
            .map(|(scheme, p)| (scheme.clone(), p.name().to_string()))
            .collect()
    }

    /// Each distinct registered provider once
    pub fn providers(&self) -> Vec<Arc<dyn TransferProvider>> {
        let mut unique: Vec<Arc<dyn TransferProvider>> = Vec::new();
        for provider in self.providers.values() {
            if !unique.iter().any(|p| Arc::ptr_eq(p, provider)) {
                unique.push(provider.clone());
            }
        }
        unique
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("schemes", &self.table())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferRequest;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl TransferProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn schemes(&self) -> Vec<String> {
            vec!["sftp".into()]
        }

        async fn get(&self, _request: &TransferRequest<'_>) -> TransferResult<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_builtin_schemes() {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.resolve("file").unwrap().name(), "file");
        assert_eq!(registry.resolve("http").unwrap().name(), "http");
        assert_eq!(registry.resolve("HTTPS").unwrap().name(), "http");
        assert_eq!(registry.providers().len(), 2);
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = ProviderRegistry::with_builtin();
        registry.register(["sftp"], Arc::new(Named("first")));
        registry.register(["sftp", "http"], Arc::new(Named("second")));

        assert_eq!(registry.resolve("sftp").unwrap().name(), "second");
        assert_eq!(registry.resolve("http").unwrap().name(), "second");
        assert_eq!(registry.resolve("https").unwrap().name(), "http");
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve("gopher"),
            Err(TransferError::NoProvider { .. })
        ));
    }
}
