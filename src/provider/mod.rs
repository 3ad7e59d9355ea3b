use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::AuthenticationError;
use crate::config::{AuthConfiguration, ConfigurationError, IntegrationConfig, LibraryConfig, keys};
use crate::http_client::HttpClientError;
use crate::restriction::{LibraryIdentifierRestriction, RestrictionField, RestrictionKind};
use crate::store::{Credential, Patron, PatronStore};

pub mod basic;
pub mod oauth;

/// Sentinel issuer used in bearer envelopes that wrap a basic-as-bearer
/// token, routing them back to the library's basic provider.
pub const BASIC_TOKEN_ISSUER: &str = "basic-token";

/// Network or protocol failure talking to a source of truth or OAuth
/// provider. Never retried inside this subsystem; retry policy, if any,
/// belongs to the HTTP client collaborator.
#[derive(Error, Debug)]
pub enum RemoteServiceError {
    #[error("http transport error: `{0}`")]
    Transport(String),
    #[error("remote service returned status `{0}`: `{1}`")]
    Response(u16, String),
    #[error("unable to deserialize remote response: `{0}`")]
    Deserialize(String),
}

impl From<HttpClientError> for RemoteServiceError {
    fn from(value: HttpClientError) -> Self {
        match value {
            HttpClientError::TransportError(msg) => RemoteServiceError::Transport(msg),
            HttpClientError::InvalidResponse(msg) => RemoteServiceError::Deserialize(msg),
        }
    }
}

/// A username/password pair, the first of the two inbound credential shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: Option<String>,
}

/// Provider validating a credential pair against a remote source of truth.
pub trait BasicAuthenticator {
    /// Provider label: the credential data source and the challenge realm.
    fn label(&self) -> &str;

    /// Validates the pair and resolves it to a patron. `Ok(None)` is the
    /// expected wrong-credentials outcome, not an error.
    fn authenticated_patron(
        &self,
        store: &dyn PatronStore,
        credentials: &BasicCredentials,
    ) -> Result<Option<Patron>, AuthenticationError>;

    /// Validates a previously issued basic-as-bearer provider token.
    fn authenticated_patron_for_token(
        &self,
        store: &dyn PatronStore,
        provider_token: &str,
    ) -> Result<Option<Patron>, AuthenticationError>;

    /// Exchanges an already-authenticated patron for a short-lived provider
    /// token, so later requests can present a bearer envelope instead of
    /// resending the password.
    fn issue_token(
        &self,
        store: &dyn PatronStore,
        patron: &Patron,
    ) -> Result<Credential, AuthenticationError>;
}

/// Provider running an OAuth-style token dance against a remote authorization
/// server. SAML plug-ins expose this same capability with protocol-specific
/// internals behind their own collaborator.
pub trait BearerAuthenticator {
    /// Unique name within the bearer-provider set of one library; tags every
    /// envelope this provider's tokens are wrapped in.
    fn name(&self) -> &str;

    /// The redirect URL sending the patron to the remote authorization
    /// endpoint.
    fn external_authenticate_url(
        &self,
        state: &oauth::DanceState,
    ) -> Result<Url, AuthenticationError>;

    /// Completes the dance for an authorization code: token exchange, patron
    /// resolution, credential persistence.
    fn oauth_callback(
        &self,
        store: &dyn PatronStore,
        code: &str,
    ) -> Result<Option<oauth::OAuthCallback>, AuthenticationError>;

    /// Resolves a previously issued provider token back to its patron.
    fn authenticated_patron(
        &self,
        store: &dyn PatronStore,
        provider_token: &str,
    ) -> Result<Option<Patron>, AuthenticationError>;
}

/// The static registry of provider implementations. An integration's
/// protocol string resolves here at registry-build time; unknown strings are
/// a per-integration configuration error, not a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderProtocol {
    /// Basic auth validated against locally configured test credentials.
    Simple,
    /// OAuth authorization-code dance against a remote provider.
    OAuth,
}

impl FromStr for ProviderProtocol {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(ProviderProtocol::Simple),
            "oauth" => Ok(ProviderProtocol::OAuth),
            other => Err(ConfigurationError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Parses the per-library identifier restriction from integration settings.
pub(crate) fn restriction_from_config(
    config: &AuthConfiguration,
    library: &LibraryConfig,
    integration: &IntegrationConfig,
) -> Result<LibraryIdentifierRestriction, ConfigurationError> {
    let kind_setting = config
        .setting(library, Some(integration), keys::IDENTIFIER_RESTRICTION_TYPE)
        .unwrap_or("none");
    let value = config
        .setting(library, Some(integration), keys::IDENTIFIER_RESTRICTION_VALUE)
        .unwrap_or_default();
    let field = config
        .setting(library, Some(integration), keys::IDENTIFIER_RESTRICTION_FIELD)
        .map(RestrictionField::parse)
        .unwrap_or_default();

    let kind = match kind_setting {
        "none" => RestrictionKind::None,
        "prefix" => RestrictionKind::Prefix(value.to_string()),
        "string" => RestrictionKind::String(value.to_string()),
        "regex" => RestrictionKind::Regex(regex::Regex::new(value).map_err(|e| {
            ConfigurationError::invalid_setting(keys::IDENTIFIER_RESTRICTION_VALUE, e)
        })?),
        "list" => RestrictionKind::list_from_setting(value),
        other => {
            return Err(ConfigurationError::invalid_setting(
                keys::IDENTIFIER_RESTRICTION_TYPE,
                format!("unknown restriction type `{other}`"),
            ));
        }
    };
    Ok(LibraryIdentifierRestriction::new(kind, field))
}
