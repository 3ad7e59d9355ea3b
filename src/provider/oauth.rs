use chrono::{DateTime, Duration, Utc};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method, Request};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use url::form_urlencoded;

use crate::config::{AuthConfiguration, ConfigurationError, IntegrationConfig, LibraryConfig, keys};
use crate::http_client::HttpClient;
use crate::identity::{BlockReason, PatronIdentity, parse_fines};
use crate::provider::{BearerAuthenticator, RemoteServiceError, restriction_from_config};
use crate::restriction::{LibraryIdentifierRestriction, RestrictionOutcome};
use crate::store::{Credential, Patron, PatronStore};
use crate::{AuthenticationError, LibraryId};

/// Credential kind under which OAuth access tokens are persisted.
pub const OAUTH_TOKEN_TYPE: &str = "OAuth Access Token";

pub const DEFAULT_TOKEN_EXPIRATION_DAYS: i64 = 42;

/// Opaque state blob round-tripped through the remote authorization server,
/// carried URL-encoded in the redirect and echoed back on the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanceState {
    pub provider: String,
    pub redirect_uri: String,
}

impl DanceState {
    pub fn encode(&self) -> Result<String, AuthenticationError> {
        serde_json::to_string(self)
            .map_err(|e| AuthenticationError::InvalidCallbackParameters(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, AuthenticationError> {
        serde_json::from_str(raw)
            .map_err(|e| AuthenticationError::InvalidCallbackParameters(e.to_string()))
    }
}

/// Response to the authorization-code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenExchangeResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// The two remote calls of the dance, behind a seam so providers can be
/// tested without a live authorization server.
pub trait OAuthClient {
    fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenExchangeResponse, RemoteServiceError>;

    /// Fetches the patron profile for an access token. `Ok(None)` means the
    /// token was not accepted.
    fn fetch_identity(
        &self,
        access_token: &str,
    ) -> Result<Option<PatronIdentity>, RemoteServiceError>;
}

/// Profile document shape served by the provider's profile endpoint.
#[derive(Debug, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    permanent_id: Option<String>,
    #[serde(default)]
    authorization_identifiers: Option<Vec<String>>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    personal_name: Option<String>,
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    authorization_expires: Option<DateTime<Utc>>,
    #[serde(default)]
    external_type: Option<String>,
    #[serde(default)]
    fines: Option<String>,
    #[serde(default)]
    block_reason: Option<BlockReason>,
    #[serde(default)]
    library_identifier: Option<String>,
}

impl From<ProfileDocument> for PatronIdentity {
    fn from(doc: ProfileDocument) -> Self {
        let mut identity = PatronIdentity::default();
        identity.permanent_id = doc.permanent_id.into();
        if let Some(identifiers) = doc.authorization_identifiers {
            identity.set_authorization_identifiers(identifiers);
        }
        identity.username = doc.username.into();
        identity.personal_name = doc.personal_name.into();
        identity.email_address = doc.email_address.into();
        identity.authorization_expires = doc.authorization_expires.into();
        identity.external_type = doc.external_type.into();
        identity.fines = doc.fines.as_deref().and_then(parse_fines).into();
        identity.block_reason = doc.block_reason.into();
        identity.library_identifier = doc.library_identifier.into();
        identity
    }
}

/// HTTP implementation of the dance against a standard authorization server.
pub struct HttpOAuthClient<C> {
    token_url: Url,
    profile_url: Url,
    client_id: String,
    client_secret: String,
    http: C,
}

impl<C: HttpClient> HttpOAuthClient<C> {
    pub fn new(
        token_url: Url,
        profile_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: C,
    ) -> Self {
        Self {
            token_url,
            profile_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http,
        }
    }
}

fn response_error(status: u16, body: &[u8]) -> RemoteServiceError {
    RemoteServiceError::Response(status, String::from_utf8_lossy(body).into_owned())
}

impl<C: HttpClient> OAuthClient for HttpOAuthClient<C> {
    fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenExchangeResponse, RemoteServiceError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("code", code)
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", &self.client_secret)
            .append_pair("redirect_uri", redirect_uri)
            .finish();

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.token_url.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(body.into_bytes())
            .map_err(|e| RemoteServiceError::Transport(e.to_string()))?;

        let response = self.http.send(request)?;
        if !response.status().is_success() {
            return Err(response_error(response.status().as_u16(), response.body()));
        }
        serde_json::from_slice(response.body())
            .map_err(|e| RemoteServiceError::Deserialize(e.to_string()))
    }

    fn fetch_identity(
        &self,
        access_token: &str,
    ) -> Result<Option<PatronIdentity>, RemoteServiceError> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|e| RemoteServiceError::Transport(e.to_string()))?;
        bearer.set_sensitive(true);

        let request = Request::builder()
            .method(Method::GET)
            .uri(self.profile_url.as_str())
            .header(AUTHORIZATION, bearer)
            .header(ACCEPT, "application/json")
            .body(Vec::new())
            .map_err(|e| RemoteServiceError::Transport(e.to_string()))?;

        let response = self.http.send(request)?;
        if response.status().as_u16() == 401 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(response_error(response.status().as_u16(), response.body()));
        }
        let document: ProfileDocument = serde_json::from_slice(response.body())
            .map_err(|e| RemoteServiceError::Deserialize(e.to_string()))?;
        Ok(Some(document.into()))
    }
}

/// Everything the orchestrator needs after a completed dance.
#[derive(Debug)]
pub struct OAuthCallback {
    pub credential: Credential,
    pub patron: Patron,
    pub identity: PatronIdentity,
}

/// OAuth authorization-code provider for one library.
pub struct OAuthProvider<C> {
    name: String,
    library_id: LibraryId,
    authenticate_url: Url,
    client_id: String,
    callback_url: String,
    restriction: LibraryIdentifierRestriction,
    token_expiration: Duration,
    client: C,
}

fn required_setting<'a>(
    config: &'a AuthConfiguration,
    library: &'a LibraryConfig,
    integration: &'a IntegrationConfig,
    key: &str,
) -> Result<&'a str, ConfigurationError> {
    config
        .setting(library, Some(integration), key)
        .ok_or_else(|| ConfigurationError::invalid_setting(key, "missing"))
}

fn setting_url(
    config: &AuthConfiguration,
    library: &LibraryConfig,
    integration: &IntegrationConfig,
    key: &str,
) -> Result<Url, ConfigurationError> {
    Url::parse(required_setting(config, library, integration, key)?)
        .map_err(|e| ConfigurationError::invalid_setting(key, e))
}

impl<C: OAuthClient> OAuthProvider<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        library_id: LibraryId,
        authenticate_url: Url,
        client_id: impl Into<String>,
        callback_url: impl Into<String>,
        restriction: LibraryIdentifierRestriction,
        token_expiration: Duration,
        client: C,
    ) -> Self {
        Self {
            name: name.into(),
            library_id,
            authenticate_url,
            client_id: client_id.into(),
            callback_url: callback_url.into(),
            restriction,
            token_expiration,
            client,
        }
    }

    /// Reorders the identifier list so the restriction-matching identifier is
    /// primary, or rejects when no identifier belongs to this library.
    fn select_identifier(&self, identity: &mut PatronIdentity) -> Result<(), AuthenticationError> {
        if !self.restriction.is_configured() {
            return Ok(());
        }
        let identifiers = identity.authorization_identifiers().to_vec();
        let matching = identifiers
            .iter()
            .position(|id| self.restriction.enforce(id, identity) == RestrictionOutcome::Pass);
        match matching {
            Some(0) => Ok(()),
            Some(index) => {
                let mut reordered = identifiers;
                let winner = reordered.remove(index);
                reordered.insert(0, winner);
                identity.set_authorization_identifiers(reordered);
                Ok(())
            }
            None => Err(AuthenticationError::PatronOfAnotherLibrary),
        }
    }
}

impl<C: OAuthClient> BearerAuthenticator for OAuthProvider<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn external_authenticate_url(
        &self,
        state: &DanceState,
    ) -> Result<Url, AuthenticationError> {
        let mut url = self.authenticate_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("state", &state.encode()?);
        Ok(url)
    }

    fn oauth_callback(
        &self,
        store: &dyn PatronStore,
        code: &str,
    ) -> Result<Option<OAuthCallback>, AuthenticationError> {
        let exchange = self.client.exchange_code(code, &self.callback_url)?;
        let Some(mut identity) = self.client.fetch_identity(&exchange.access_token)? else {
            return Ok(None);
        };

        self.select_identifier(&mut identity)?;

        let (patron, is_new) = identity.get_or_create_patron(store, &self.library_id)?;
        if is_new {
            debug!(provider = %self.name, "created a new patron from an OAuth profile");
        }
        let credential = store.create_temporary_credential(
            &self.name,
            OAUTH_TOKEN_TYPE,
            &patron,
            self.token_expiration,
            exchange.access_token,
        )?;
        Ok(Some(OAuthCallback {
            credential,
            patron,
            identity,
        }))
    }

    fn authenticated_patron(
        &self,
        store: &dyn PatronStore,
        provider_token: &str,
    ) -> Result<Option<Patron>, AuthenticationError> {
        let Some(credential) =
            store.lookup_credential_by_token(&self.name, OAUTH_TOKEN_TYPE, provider_token)?
        else {
            return Ok(None);
        };
        if credential.is_expired() {
            return Ok(None);
        }
        Ok(store.patron_by_id(credential.patron_id)?)
    }
}

impl<C: HttpClient> OAuthProvider<HttpOAuthClient<C>> {
    /// Builds the provider and its HTTP dance client from integration
    /// settings.
    pub fn from_config(
        config: &AuthConfiguration,
        library: &LibraryConfig,
        integration: &IntegrationConfig,
        http: C,
    ) -> Result<Self, ConfigurationError> {
        let name = config
            .setting(library, Some(integration), keys::PROVIDER_NAME)
            .unwrap_or(&integration.id)
            .to_string();
        let client_id =
            required_setting(config, library, integration, keys::OAUTH_CLIENT_ID)?.to_string();
        let client_secret =
            required_setting(config, library, integration, keys::OAUTH_CLIENT_SECRET)?.to_string();
        let callback_url =
            required_setting(config, library, integration, keys::OAUTH_CALLBACK_URL)?.to_string();
        let authenticate_url =
            setting_url(config, library, integration, keys::OAUTH_AUTHENTICATE_URL)?;
        let token_url = setting_url(config, library, integration, keys::OAUTH_TOKEN_URL)?;
        let profile_url = setting_url(config, library, integration, keys::OAUTH_PROFILE_URL)?;
        let token_expiration = config
            .setting(library, Some(integration), keys::TOKEN_EXPIRATION_DAYS)
            .map(|days| {
                days.parse::<i64>()
                    .map_err(|e| ConfigurationError::invalid_setting(keys::TOKEN_EXPIRATION_DAYS, e))
            })
            .transpose()?
            .unwrap_or(DEFAULT_TOKEN_EXPIRATION_DAYS);

        let client = HttpOAuthClient::new(token_url, profile_url, client_id.clone(), client_secret, http);
        Ok(OAuthProvider::new(
            name,
            library.library_id.clone(),
            authenticate_url,
            client_id,
            callback_url,
            restriction_from_config(config, library, integration)?,
            Duration::days(token_expiration),
            client,
        ))
    }
}
