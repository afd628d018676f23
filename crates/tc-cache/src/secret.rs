use zeroize::Zeroizing;

/// Supplies the passphrase used to derive the cache encryption key
///
/// Consulted only when the OS keyring has no key for the cache directory.
#[async_trait::async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns None if no passphrase is available
    async fn get_passphrase(&self, prompt: &str) -> Option<Zeroizing<String>>;
}

/// Keyring-only operation; never yields a passphrase
#[derive(Debug, Clone, Default)]
pub struct NoSecretProvider;

#[async_trait::async_trait]
impl SecretProvider for NoSecretProvider {
    async fn get_passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        None
    }
}

/// Fixed passphrase, for tests and headless deployments
#[derive(Debug, Clone)]
pub struct StaticSecretProvider {
    secret: Zeroizing<String>,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }
}

#[async_trait::async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        Some(self.secret.clone())
    }
}
