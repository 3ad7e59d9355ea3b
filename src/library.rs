use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use crate::bearer_token::{BearerEnvelope, BearerTokenError, TokenSigner};
use crate::config::{
    AuthConfiguration, ConfigurationError, LibraryConfig, SigningSecretSource, keys,
};
use crate::http_client::HttpClient;
use crate::provider::basic::{BasicAuthProvider, BasicAuthSettings, SimpleSourceOfTruth};
use crate::provider::oauth::OAuthProvider;
use crate::provider::{
    BASIC_TOKEN_ISSUER, BasicAuthenticator, BasicCredentials, BearerAuthenticator,
    ProviderProtocol,
};
use crate::store::{Patron, PatronStore};
use crate::{AuthenticationError, LibraryId};

const DEFAULT_REALM: &str = "Library card";

/// The two inbound credential shapes, parsed from the Authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationHeader {
    Basic(BasicCredentials),
    Token(String),
}

impl AuthorizationHeader {
    /// Parses a raw header value. A `Basic <base64>` value that fails to
    /// decode is kept as an opaque token so dispatch can still reject it.
    pub fn parse(raw: &str) -> Self {
        if let Some(encoded) = strip_prefix_ignore_case(raw, "Basic ")
            && let Ok(decoded) = BASE64.decode(encoded.trim())
            && let Ok(text) = String::from_utf8(decoded)
        {
            let (username, password) = match text.split_once(':') {
                Some((username, password)) => (username.to_string(), Some(password.to_string())),
                None => (text, None),
            };
            return AuthorizationHeader::Basic(BasicCredentials { username, password });
        }
        AuthorizationHeader::Token(raw.to_string())
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &value[prefix.len()..])
}

/// Provider registry and credential dispatcher for one library.
///
/// Built once per configuration load and read-only afterwards; a
/// configuration change rebuilds the whole registry rather than mutating it
/// in place.
pub struct LibraryAuthenticator {
    library_id: LibraryId,
    short_name: String,
    basic: Option<Box<dyn BasicAuthenticator>>,
    bearer: HashMap<String, Box<dyn BearerAuthenticator>>,
    token_signer: Option<TokenSigner>,
    registration_errors: HashMap<String, ConfigurationError>,
}

impl std::fmt::Debug for LibraryAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryAuthenticator")
            .field("library_id", &self.library_id)
            .field("short_name", &self.short_name)
            .finish_non_exhaustive()
    }
}

impl LibraryAuthenticator {
    pub fn new(library_id: LibraryId, short_name: impl Into<String>) -> Self {
        Self {
            library_id,
            short_name: short_name.into(),
            basic: None,
            bearer: HashMap::new(),
            token_signer: None,
            registration_errors: HashMap::new(),
        }
    }

    /// Builds the registry for one configured library. Per-integration
    /// failures are logged and recorded; the library continues with the
    /// providers that did register. Only a missing signing secret with bearer
    /// providers present fails the whole build.
    pub fn from_config<C>(
        config: &AuthConfiguration,
        library: &LibraryConfig,
        secrets: &dyn SigningSecretSource,
        http: C,
    ) -> Result<Self, ConfigurationError>
    where
        C: HttpClient + Clone + 'static,
    {
        let mut authenticator =
            Self::new(library.library_id.clone(), library.short_name.clone());

        for integration in &library.integrations {
            let result = authenticator.register_integration(config, library, integration, &http);
            if let Err(error) = result {
                warn!(
                    library = %library.short_name,
                    integration = %integration.id,
                    %error,
                    "authentication provider failed to register"
                );
                authenticator
                    .registration_errors
                    .insert(integration.id.clone(), error);
            }
        }

        if authenticator.basic.is_some() || !authenticator.bearer.is_empty() {
            match secrets.get_or_create(keys::BEARER_TOKEN_SIGNING_SECRET) {
                Ok(secret) => authenticator.token_signer = Some(TokenSigner::new(&secret)),
                Err(error) if authenticator.bearer.is_empty() => {
                    // Basic auth still works without the bearer exchange.
                    warn!(
                        library = %library.short_name,
                        %error,
                        "no signing secret; basic-as-bearer tokens disabled"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Ok(authenticator)
    }

    fn register_integration<C>(
        &mut self,
        config: &AuthConfiguration,
        library: &LibraryConfig,
        integration: &crate::config::IntegrationConfig,
        http: &C,
    ) -> Result<(), ConfigurationError>
    where
        C: HttpClient + Clone + 'static,
    {
        match integration.protocol.parse::<ProviderProtocol>()? {
            ProviderProtocol::Simple => {
                let label = config
                    .setting(library, Some(integration), keys::PROVIDER_NAME)
                    .unwrap_or(&integration.id)
                    .to_string();
                let settings = BasicAuthSettings::from_config(config, library, integration)?;
                let source = SimpleSourceOfTruth::from_config(config, library, integration)?;
                self.register_basic(Box::new(BasicAuthProvider::new(
                    label,
                    library.library_id.clone(),
                    settings,
                    source,
                )))
            }
            ProviderProtocol::OAuth => {
                let provider =
                    OAuthProvider::from_config(config, library, integration, http.clone())?;
                self.register_bearer(Box::new(provider))
            }
        }
    }

    pub fn register_basic(
        &mut self,
        provider: Box<dyn BasicAuthenticator>,
    ) -> Result<(), ConfigurationError> {
        if self.basic.is_some() {
            return Err(ConfigurationError::DuplicateBasicProvider);
        }
        debug!(library = %self.short_name, provider = provider.label(), "registered basic provider");
        self.basic = Some(provider);
        Ok(())
    }

    pub fn register_bearer(
        &mut self,
        provider: Box<dyn BearerAuthenticator>,
    ) -> Result<(), ConfigurationError> {
        let name = provider.name().to_string();
        if self.bearer.contains_key(&name) {
            return Err(ConfigurationError::DuplicateBearerProvider(name));
        }
        debug!(library = %self.short_name, provider = %name, "registered bearer provider");
        self.bearer.insert(name, provider);
        Ok(())
    }

    pub fn library_id(&self) -> &LibraryId {
        &self.library_id
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Registration failures by integration id, for operator reporting.
    pub fn registration_errors(&self) -> &HashMap<String, ConfigurationError> {
        &self.registration_errors
    }

    pub fn basic_provider(&self) -> Option<&dyn BasicAuthenticator> {
        self.basic.as_deref()
    }

    /// The named bearer provider, for the redirect/callback orchestration.
    pub fn bearer_provider(&self, name: &str) -> Option<&dyn BearerAuthenticator> {
        self.bearer.get(name).map(Box::as_ref)
    }

    pub fn bearer_provider_names(&self) -> impl Iterator<Item = &str> {
        self.bearer.keys().map(String::as_str)
    }

    /// Resolves an inbound credential to a patron.
    ///
    /// Envelope decode is best-effort: a string that fails to verify is not
    /// a hard failure, it just cannot take the envelope-routed branches.
    pub fn authenticated_patron(
        &self,
        store: &dyn PatronStore,
        header: &AuthorizationHeader,
    ) -> Result<Option<Patron>, AuthenticationError> {
        let envelope = match header {
            AuthorizationHeader::Basic(credentials) => {
                if let Some(basic) = &self.basic {
                    return basic.authenticated_patron(store, credentials);
                }
                return Err(AuthenticationError::UnsupportedAuthenticationMechanism);
            }
            AuthorizationHeader::Token(raw) => {
                let compact = strip_prefix_ignore_case(raw, "Bearer ").unwrap_or(raw);
                let envelope = self
                    .token_signer
                    .as_ref()
                    .and_then(|signer| signer.decode(compact.trim()).ok());

                if let Some(envelope) = &envelope
                    && envelope.issuer == BASIC_TOKEN_ISSUER
                    && let Some(basic) = &self.basic
                {
                    return basic.authenticated_patron_for_token(store, &envelope.token);
                }
                if !raw.to_ascii_lowercase().contains("bearer") {
                    return Err(AuthenticationError::UnsupportedAuthenticationMechanism);
                }
                envelope
            }
        };

        let envelope = envelope.ok_or_else(|| {
            AuthenticationError::UnknownProvider("unverifiable bearer token".to_string())
        })?;
        let provider = self
            .bearer
            .get(&envelope.issuer)
            .ok_or_else(|| AuthenticationError::UnknownProvider(envelope.issuer.clone()))?;
        provider.authenticated_patron(store, &envelope.token)
    }

    /// Wraps a provider token in this library's signed bearer envelope.
    pub fn create_bearer_token(
        &self,
        provider_name: &str,
        provider_token: &str,
    ) -> Result<String, AuthenticationError> {
        let signer = self.token_signer.as_ref().ok_or_else(|| {
            AuthenticationError::BearerToken(BearerTokenError::Encode(
                "no signing secret configured".to_string(),
            ))
        })?;
        Ok(signer.encode(provider_name, provider_token)?)
    }

    pub fn decode_bearer_token(
        &self,
        compact: &str,
    ) -> Result<BearerEnvelope, AuthenticationError> {
        let signer = self.token_signer.as_ref().ok_or_else(|| {
            AuthenticationError::BearerToken(BearerTokenError::Decode(
                "no signing secret configured".to_string(),
            ))
        })?;
        Ok(signer.decode(compact)?)
    }

    /// The challenge sent with a 401 response.
    pub fn www_authenticate_header(&self) -> String {
        let realm = self
            .basic
            .as_ref()
            .map(|provider| provider.label())
            .unwrap_or(DEFAULT_REALM);
        format!("Basic realm=\"{realm}\"")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::GeneratedSecretSource;
    use crate::http_client::HttpClientError;
    use crate::provider::test::{MockBasicAuthenticator, MockBearerAuthenticator};
    use crate::store::test::MemoryPatronStore;
    use crate::store::{Patron, PatronKey};

    /// Closure-based client for builds that never reach the network.
    pub(crate) fn unreachable_http()
    -> fn(http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, HttpClientError> {
        |_| panic!("no HTTP call expected")
    }

    fn basic_mock(label: &'static str) -> MockBasicAuthenticator {
        let mut mock = MockBasicAuthenticator::new();
        mock.expect_label().return_const(label.to_string());
        mock
    }

    fn bearer_mock(name: &'static str) -> MockBearerAuthenticator {
        let mut mock = MockBearerAuthenticator::new();
        mock.expect_name().return_const(name.to_string());
        mock
    }

    fn authenticator_with_signer() -> LibraryAuthenticator {
        let mut authenticator = LibraryAuthenticator::new("lib".to_string(), "main");
        authenticator.token_signer = Some(TokenSigner::new("test-secret"));
        authenticator
    }

    fn sample_patron() -> Patron {
        Patron::new(
            &"lib".to_string(),
            &PatronKey::Username("user".to_string()),
        )
    }

    #[test]
    fn header_parsing_round_trips_basic_credentials() {
        let encoded = BASE64.encode("reader:sw0rdfish");
        let header = AuthorizationHeader::parse(&format!("Basic {encoded}"));
        assert_eq!(
            header,
            AuthorizationHeader::Basic(BasicCredentials {
                username: "reader".to_string(),
                password: Some("sw0rdfish".to_string()),
            })
        );

        // Password may itself contain a colon; only the first one splits.
        let encoded = BASE64.encode("reader:pass:word");
        assert_eq!(
            AuthorizationHeader::parse(&format!("basic {encoded}")),
            AuthorizationHeader::Basic(BasicCredentials {
                username: "reader".to_string(),
                password: Some("pass:word".to_string()),
            })
        );
    }

    #[test]
    fn header_parsing_keeps_other_values_opaque() {
        assert_eq!(
            AuthorizationHeader::parse("Bearer abc.def.ghi"),
            AuthorizationHeader::Token("Bearer abc.def.ghi".to_string())
        );
        // Undecodable Basic payload stays a token.
        assert_eq!(
            AuthorizationHeader::parse("Basic %%%"),
            AuthorizationHeader::Token("Basic %%%".to_string())
        );
    }

    #[test]
    fn second_basic_provider_is_rejected() {
        let mut authenticator = LibraryAuthenticator::new("lib".to_string(), "main");
        authenticator
            .register_basic(Box::new(basic_mock("first")))
            .unwrap();
        let result = authenticator.register_basic(Box::new(basic_mock("second")));
        assert_matches!(
            result.unwrap_err(),
            ConfigurationError::DuplicateBasicProvider
        );
    }

    #[test]
    fn bearer_name_collision_is_rejected() {
        let mut authenticator = LibraryAuthenticator::new("lib".to_string(), "main");
        authenticator
            .register_bearer(Box::new(bearer_mock("sso")))
            .unwrap();
        let result = authenticator.register_bearer(Box::new(bearer_mock("sso")));
        assert_matches!(
            result.unwrap_err(),
            ConfigurationError::DuplicateBearerProvider(name) if name == "sso"
        );
    }

    #[test]
    fn one_basic_and_one_bearer_coexist() {
        let mut authenticator = LibraryAuthenticator::new("lib".to_string(), "main");
        authenticator
            .register_basic(Box::new(basic_mock("ils")))
            .unwrap();
        authenticator
            .register_bearer(Box::new(bearer_mock("sso")))
            .unwrap();
        assert!(authenticator.basic_provider().is_some());
        assert!(authenticator.bearer_provider("sso").is_some());
    }

    #[test]
    fn basic_credentials_dispatch_to_the_basic_provider() {
        let mut basic = basic_mock("ils");
        let patron = sample_patron();
        let expected_id = patron.id;
        basic
            .expect_authenticated_patron()
            .once()
            .withf(|_, credentials| credentials.username == "reader")
            .return_once(move |_, _| Ok(Some(patron)));

        let mut authenticator = authenticator_with_signer();
        authenticator.register_basic(Box::new(basic)).unwrap();

        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Basic(BasicCredentials {
            username: "reader".to_string(),
            password: Some("pw".to_string()),
        });
        let resolved = authenticator
            .authenticated_patron(&store, &header)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, expected_id);
    }

    #[test]
    fn basic_credentials_without_a_basic_provider_are_unsupported() {
        let authenticator = authenticator_with_signer();
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Basic(BasicCredentials {
            username: "reader".to_string(),
            password: None,
        });
        assert_matches!(
            authenticator.authenticated_patron(&store, &header).unwrap_err(),
            AuthenticationError::UnsupportedAuthenticationMechanism
        );
    }

    #[test]
    fn basic_as_bearer_envelope_routes_to_the_basic_provider() {
        let mut basic = basic_mock("ils");
        let patron = sample_patron();
        basic
            .expect_authenticated_patron_for_token()
            .once()
            .withf(|_, token| token == "inner-token")
            .return_once(move |_, _| Ok(Some(patron)));

        let mut authenticator = authenticator_with_signer();
        authenticator.register_basic(Box::new(basic)).unwrap();

        let compact = authenticator
            .create_bearer_token(BASIC_TOKEN_ISSUER, "inner-token")
            .unwrap();
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Token(format!("Bearer {compact}"));
        assert!(
            authenticator
                .authenticated_patron(&store, &header)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn bearer_envelope_routes_to_its_named_provider() {
        let mut bearer = bearer_mock("sso");
        let patron = sample_patron();
        bearer
            .expect_authenticated_patron()
            .once()
            .withf(|_, token| token == "access-1")
            .return_once(move |_, _| Ok(Some(patron)));

        let mut authenticator = authenticator_with_signer();
        authenticator.register_bearer(Box::new(bearer)).unwrap();

        let compact = authenticator.create_bearer_token("sso", "access-1").unwrap();
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Token(format!("Bearer {compact}"));
        assert!(
            authenticator
                .authenticated_patron(&store, &header)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn unregistered_issuer_is_an_unknown_provider() {
        let authenticator = authenticator_with_signer();
        let compact = authenticator
            .create_bearer_token("never-registered", "token")
            .unwrap();
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Token(format!("Bearer {compact}"));
        assert_matches!(
            authenticator.authenticated_patron(&store, &header).unwrap_err(),
            AuthenticationError::UnknownProvider(name) if name == "never-registered"
        );
    }

    #[test]
    fn unverifiable_bearer_string_is_an_unknown_provider() {
        let authenticator = authenticator_with_signer();
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Token("Bearer not.a.real-envelope".to_string());
        assert_matches!(
            authenticator.authenticated_patron(&store, &header).unwrap_err(),
            AuthenticationError::UnknownProvider(_)
        );
    }

    #[test]
    fn non_bearer_garbage_is_unsupported() {
        let authenticator = authenticator_with_signer();
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::Token("Digest qop=auth".to_string());
        assert_matches!(
            authenticator.authenticated_patron(&store, &header).unwrap_err(),
            AuthenticationError::UnsupportedAuthenticationMechanism
        );
    }

    #[test]
    fn envelope_round_trips_through_the_library_signer() {
        let authenticator = authenticator_with_signer();
        let compact = authenticator.create_bearer_token("sso", "access-1").unwrap();
        let envelope = authenticator.decode_bearer_token(&compact).unwrap();
        assert_eq!(envelope.issuer, "sso");
        assert_eq!(envelope.token, "access-1");
    }

    #[test]
    fn challenge_uses_the_basic_provider_realm() {
        let mut authenticator = LibraryAuthenticator::new("lib".to_string(), "main");
        assert_eq!(
            authenticator.www_authenticate_header(),
            "Basic realm=\"Library card\""
        );
        authenticator
            .register_basic(Box::new(basic_mock("Campus ILS")))
            .unwrap();
        assert_eq!(
            authenticator.www_authenticate_header(),
            "Basic realm=\"Campus ILS\""
        );
    }

    fn simple_library_config() -> (AuthConfiguration, String) {
        let json = r#"{
            "libraries": [{
                "library_id": "lib-1",
                "short_name": "main",
                "integrations": [{
                    "id": "simple-1",
                    "protocol": "simple",
                    "settings": {"test_identifier": "25001", "test_password": "pw"}
                }, {
                    "id": "mystery-1",
                    "protocol": "api.dynamic.module",
                    "settings": {}
                }]
            }]
        }"#;
        (serde_json::from_str(json).unwrap(), "main".to_string())
    }

    #[test]
    fn build_registers_working_providers_and_records_failures() {
        let (config, short_name) = simple_library_config();
        let library = config.library(&short_name).unwrap();
        let secrets = GeneratedSecretSource::default();

        let authenticator =
            LibraryAuthenticator::from_config(&config, library, &secrets, unreachable_http())
                .unwrap();

        assert!(authenticator.basic_provider().is_some());
        assert_eq!(authenticator.registration_errors().len(), 1);
        assert_matches!(
            authenticator.registration_errors().get("mystery-1").unwrap(),
            ConfigurationError::UnknownProtocol(_)
        );

        // The built basic provider authenticates the configured credentials.
        let store = MemoryPatronStore::default();
        let header = AuthorizationHeader::parse(&format!(
            "Basic {}",
            BASE64.encode("25001:pw")
        ));
        let patron = authenticator
            .authenticated_patron(&store, &header)
            .unwrap()
            .unwrap();
        assert_eq!(patron.authorization_identifier.as_deref(), Some("25001"));
    }

    struct NoSecretSource;

    impl SigningSecretSource for NoSecretSource {
        fn get_or_create(&self, key: &str) -> Result<String, ConfigurationError> {
            Err(ConfigurationError::MissingSigningSecret(key.to_string()))
        }
    }

    #[test]
    fn missing_secret_is_fatal_only_with_bearer_providers() {
        let json = r#"{
            "libraries": [{
                "library_id": "lib-1",
                "short_name": "main",
                "integrations": [{
                    "id": "sso-1",
                    "protocol": "oauth",
                    "settings": {
                        "oauth_client_id": "client-1",
                        "oauth_client_secret": "s3cret",
                        "oauth_authenticate_url": "https://sso.example.org/authorize",
                        "oauth_token_url": "https://sso.example.org/token",
                        "oauth_profile_url": "https://sso.example.org/profile",
                        "oauth_callback_url": "https://circ.example.org/oauth_callback"
                    }
                }]
            }]
        }"#;
        let config: AuthConfiguration = serde_json::from_str(json).unwrap();
        let library = config.library("main").unwrap();

        let result =
            LibraryAuthenticator::from_config(&config, library, &NoSecretSource, unreachable_http());
        assert_matches!(
            result.unwrap_err(),
            ConfigurationError::MissingSigningSecret(_)
        );

        // A basic-only library degrades instead of failing.
        let (config, short_name) = simple_library_config();
        let library = config.library(&short_name).unwrap();
        let authenticator =
            LibraryAuthenticator::from_config(&config, library, &NoSecretSource, unreachable_http())
                .unwrap();
        assert!(authenticator.basic_provider().is_some());
        assert!(authenticator.token_signer.is_none());
    }
}
