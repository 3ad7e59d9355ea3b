use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::LibraryId;

/// Errors raised while building a library's provider registry. Fatal for the
/// affected provider only: they are logged, recorded per integration id, and
/// the library continues with the providers that did register.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("unknown authentication protocol: `{0}`")]
    UnknownProtocol(String),
    #[error("library already has a basic authentication provider")]
    DuplicateBasicProvider,
    #[error("bearer provider name already registered: `{0}`")]
    DuplicateBearerProvider(String),
    #[error("no bearer token signing secret could be resolved: `{0}`")]
    MissingSigningSecret(String),
    #[error("invalid setting `{key}`: `{reason}`")]
    InvalidSetting { key: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_setting(key: &str, reason: impl ToString) -> Self {
        Self::InvalidSetting {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Setting keys shared between the configuration store and the providers.
pub mod keys {
    pub const IDENTIFIER_REGULAR_EXPRESSION: &str = "identifier_regular_expression";
    pub const IDENTIFIER_MAX_LENGTH: &str = "identifier_maximum_length";
    pub const PASSWORD_REGULAR_EXPRESSION: &str = "password_regular_expression";
    pub const PASSWORD_MAX_LENGTH: &str = "password_maximum_length";
    pub const PASSWORD_KEYBOARD: &str = "password_keyboard";

    pub const IDENTIFIER_RESTRICTION_TYPE: &str = "library_identifier_restriction_type";
    pub const IDENTIFIER_RESTRICTION_FIELD: &str = "library_identifier_field";
    pub const IDENTIFIER_RESTRICTION_VALUE: &str = "library_identifier_restriction";

    pub const TEST_IDENTIFIER: &str = "test_identifier";
    pub const TEST_PASSWORD: &str = "test_password";
    pub const TEST_NEIGHBORHOOD: &str = "test_neighborhood";

    pub const PROVIDER_NAME: &str = "provider_name";
    pub const OAUTH_CLIENT_ID: &str = "oauth_client_id";
    pub const OAUTH_CLIENT_SECRET: &str = "oauth_client_secret";
    pub const OAUTH_AUTHENTICATE_URL: &str = "oauth_authenticate_url";
    pub const OAUTH_TOKEN_URL: &str = "oauth_token_url";
    pub const OAUTH_PROFILE_URL: &str = "oauth_profile_url";
    pub const OAUTH_CALLBACK_URL: &str = "oauth_callback_url";
    pub const TOKEN_EXPIRATION_DAYS: &str = "token_expiration_days";

    /// Sitewide key under which the bearer signing secret is stored.
    pub const BEARER_TOKEN_SIGNING_SECRET: &str = "bearer_token_signing_secret";
}

/// Flat string key/value settings at one configuration level.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsMap(HashMap<String, String>);

impl SettingsMap {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SettingsMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One configured authentication integration for a library.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationConfig {
    pub id: String,
    /// Protocol string resolved against the static provider registry.
    pub protocol: String,
    #[serde(default)]
    pub settings: SettingsMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    pub library_id: LibraryId,
    pub short_name: String,
    #[serde(default)]
    pub settings: SettingsMap,
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

/// The full authentication configuration for the site.
///
/// Resolved settings fall back integration -> library -> sitewide. A
/// configuration change rebuilds this value (and every registry built from
/// it) wholesale; nothing here is mutated in place after construction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfiguration {
    #[serde(default)]
    pub sitewide: SettingsMap,
    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

impl AuthConfiguration {
    pub fn library(&self, short_name: &str) -> Option<&LibraryConfig> {
        self.libraries.iter().find(|l| l.short_name == short_name)
    }

    /// Resolves a setting with the three-level fallback.
    pub fn setting<'a>(
        &'a self,
        library: &'a LibraryConfig,
        integration: Option<&'a IntegrationConfig>,
        key: &str,
    ) -> Option<&'a str> {
        integration
            .and_then(|i| i.settings.get(key))
            .or_else(|| library.settings.get(key))
            .or_else(|| self.sitewide.get(key))
    }
}

/// Source of the sitewide bearer-token signing secret.
///
/// The secret is generated the first time any library needs it and reused
/// thereafter; a real deployment persists it next to the rest of the
/// sitewide configuration.
pub trait SigningSecretSource {
    fn get_or_create(&self, key: &str) -> Result<String, ConfigurationError>;
}

/// In-process secret source: generates a secret per key on first use. Used by
/// the CLI and tests; deployments provide a persistent implementation.
#[derive(Default)]
pub struct GeneratedSecretSource {
    secrets: Mutex<HashMap<String, String>>,
}

impl SigningSecretSource for GeneratedSecretSource {
    fn get_or_create(&self, key: &str) -> Result<String, ConfigurationError> {
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| ConfigurationError::MissingSigningSecret("poisoned lock".to_string()))?;
        Ok(secrets
            .entry(key.to_string())
            .or_insert_with(|| {
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            })
            .clone())
    }
}
