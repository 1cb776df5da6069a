use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::AppError;
use crate::source::{Credentials, SourceRef};
use crate::traits::CredentialStore;

/// Default prefix for keys read from the environment.
pub const DEFAULT_KEY_PREFIX: &str = "REAPER_KEY_";

/// In-memory key store that can be edited while jobs are running.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    keys: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut keys = self.keys.write().unwrap_or_else(|p| p.into_inner());
        keys.insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        let mut keys = self.keys.write().unwrap_or_else(|p| p.into_inner());
        keys.remove(name)
    }

    fn get(&self, name: &str) -> Option<String> {
        let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
        keys.get(name).cloned()
    }
}

impl CredentialStore for StaticKeyStore {
    async fn resolve(&self, source: &SourceRef) -> Result<Credentials, AppError> {
        let Some(key) = source.key.as_deref() else {
            return Ok(Credentials::none());
        };
        self.get(key)
            .map(Credentials::api_key)
            .ok_or_else(|| AppError::MissingCredential(key.to_string()))
    }
}

/// Reads API keys from environment variables.
///
/// A source with key `weather-api` resolves `REAPER_KEY_WEATHER_API`.
#[derive(Debug, Clone)]
pub struct EnvKeyStore {
    prefix: String,
}

impl Default for EnvKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvKeyStore {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable consulted for a key name.
    pub fn var_name(&self, key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl CredentialStore for EnvKeyStore {
    async fn resolve(&self, source: &SourceRef) -> Result<Credentials, AppError> {
        let Some(key) = source.key.as_deref() else {
            return Ok(Credentials::none());
        };
        let var = self.var_name(key);
        match std::env::var(&var) {
            Ok(value) if !value.trim().is_empty() => Ok(Credentials::api_key(value)),
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                Err(AppError::MissingCredential(key.to_string()))
            }
            Err(e) => Err(AppError::CredentialError(format!("{var}: {e}"))),
        }
    }
}
