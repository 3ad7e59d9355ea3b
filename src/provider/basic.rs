use chrono::Duration;
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use crate::config::{AuthConfiguration, ConfigurationError, IntegrationConfig, LibraryConfig, keys};
use crate::identity::{FieldUpdate, PatronIdentity};
use crate::provider::{
    BasicAuthenticator, BasicCredentials, RemoteServiceError, restriction_from_config,
};
use crate::restriction::{LibraryIdentifierRestriction, RestrictionOutcome};
use crate::store::{Credential, Patron, PatronStore};
use crate::{AuthenticationError, LibraryId};

/// Credential kind under which minted basic-as-bearer tokens are persisted.
pub const BASIC_TOKEN_TYPE: &str = "Basic Auth Token";

const TOKEN_DURATION_MINUTES: i64 = 60;
/// A token with more validity than this left is reused instead of refreshed.
const TOKEN_REUSE_THRESHOLD_MINUTES: i64 = 59;

/// The remote ILS or identity system a basic provider validates against.
///
/// Both calls are blocking network I/O, bounded by the HTTP client's timeout.
/// `Ok(None)` means the remote rejected the credentials or knows no such
/// patron.
pub trait SourceOfTruth {
    fn remote_authenticate(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Option<PatronIdentity>, RemoteServiceError>;

    /// Fetches the authoritative full record for a partial identity hint.
    fn remote_patron_lookup(
        &self,
        identity: &PatronIdentity,
    ) -> Result<Option<PatronIdentity>, RemoteServiceError>;
}

/// What kind of password input the remote system expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordKeyboard {
    #[default]
    Full,
    /// The remote system authenticates on identifier alone; a supplied
    /// password is a validation failure.
    NoInput,
}

impl PasswordKeyboard {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("none") {
            PasswordKeyboard::NoInput
        } else {
            PasswordKeyboard::Full
        }
    }
}

/// Local validation rules applied before any remote call is made.
#[derive(Debug, Default)]
pub struct BasicAuthSettings {
    pub identifier_regex: Option<Regex>,
    pub identifier_max_length: Option<usize>,
    pub password_regex: Option<Regex>,
    pub password_max_length: Option<usize>,
    pub keyboard: PasswordKeyboard,
    pub restriction: LibraryIdentifierRestriction,
}

fn parse_regex(value: Option<&str>, key: &str) -> Result<Option<Regex>, ConfigurationError> {
    value
        .map(|v| Regex::new(v).map_err(|e| ConfigurationError::invalid_setting(key, e)))
        .transpose()
}

fn parse_length(value: Option<&str>, key: &str) -> Result<Option<usize>, ConfigurationError> {
    value
        .map(|v| {
            v.parse::<usize>()
                .map_err(|e| ConfigurationError::invalid_setting(key, e))
        })
        .transpose()
}

impl BasicAuthSettings {
    pub fn from_config(
        config: &AuthConfiguration,
        library: &LibraryConfig,
        integration: &IntegrationConfig,
    ) -> Result<Self, ConfigurationError> {
        let setting = |key| config.setting(library, Some(integration), key);
        Ok(Self {
            identifier_regex: parse_regex(
                setting(keys::IDENTIFIER_REGULAR_EXPRESSION),
                keys::IDENTIFIER_REGULAR_EXPRESSION,
            )?,
            identifier_max_length: parse_length(
                setting(keys::IDENTIFIER_MAX_LENGTH),
                keys::IDENTIFIER_MAX_LENGTH,
            )?,
            password_regex: parse_regex(
                setting(keys::PASSWORD_REGULAR_EXPRESSION),
                keys::PASSWORD_REGULAR_EXPRESSION,
            )?,
            password_max_length: parse_length(
                setting(keys::PASSWORD_MAX_LENGTH),
                keys::PASSWORD_MAX_LENGTH,
            )?,
            keyboard: setting(keys::PASSWORD_KEYBOARD)
                .map(PasswordKeyboard::parse)
                .unwrap_or_default(),
            restriction: restriction_from_config(config, library, integration)?,
        })
    }
}

/// Validates a username/password pair against a remote source of truth and
/// reconciles the reported identity with the persisted patron record.
pub struct BasicAuthProvider<S> {
    label: String,
    library_id: LibraryId,
    settings: BasicAuthSettings,
    source: S,
}

impl<S: SourceOfTruth> BasicAuthProvider<S> {
    pub fn new(
        label: impl Into<String>,
        library_id: LibraryId,
        settings: BasicAuthSettings,
        source: S,
    ) -> Self {
        Self {
            label: label.into(),
            library_id,
            settings,
            source,
        }
    }

    /// Local validation before any remote call. Rejections here are silent
    /// "no match" outcomes, indistinguishable from a remote rejection.
    fn server_side_validation(&self, credentials: &BasicCredentials) -> bool {
        let identifier = credentials.username.as_str();
        if identifier.is_empty() {
            return false;
        }
        if let Some(max) = self.settings.identifier_max_length
            && identifier.chars().count() > max
        {
            return false;
        }
        if let Some(regex) = &self.settings.identifier_regex
            && !regex.is_match(identifier)
        {
            return false;
        }

        let password = credentials.password.as_deref().filter(|p| !p.is_empty());
        if self.settings.keyboard == PasswordKeyboard::NoInput {
            return password.is_none();
        }
        if let Some(password) = password {
            if let Some(max) = self.settings.password_max_length
                && password.chars().count() > max
            {
                return false;
            }
            if let Some(regex) = &self.settings.password_regex
                && !regex.is_match(password)
            {
                return false;
            }
        }
        true
    }

    /// Enforces the identifier restriction, completing the identity via a
    /// remote lookup when the comparison field only exists on the full record.
    fn enforce_restriction(
        &self,
        raw_identifier: &str,
        identity: &mut PatronIdentity,
    ) -> Result<bool, AuthenticationError> {
        let outcome = match self.settings.restriction.enforce(raw_identifier, identity) {
            RestrictionOutcome::NeedsCompleteIdentity => {
                match self.source.remote_patron_lookup(identity) {
                    Ok(Some(complete)) => {
                        *identity = complete;
                        self.settings.restriction.enforce(raw_identifier, identity)
                    }
                    Ok(None) => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
            }
            outcome => outcome,
        };
        match outcome {
            RestrictionOutcome::Pass => Ok(true),
            _ => Err(AuthenticationError::PatronOfAnotherLibrary),
        }
    }

    /// Local lookup chain. The fallback order is load-bearing: it decides
    /// which row wins when several partial matches exist.
    fn local_patron_lookup(
        &self,
        store: &dyn PatronStore,
        identity: &PatronIdentity,
        raw_username: &str,
    ) -> Result<Option<Patron>, AuthenticationError> {
        if let Some(permanent_id) = identity.permanent_id.value()
            && let Some(patron) =
                store.patron_by_external_identifier(&self.library_id, permanent_id)?
        {
            return Ok(Some(patron));
        }
        if let Some(username) = identity.username.value()
            && let Some(patron) = store.patron_by_username(&self.library_id, username)?
        {
            return Ok(Some(patron));
        }
        if let Some(identifier) = identity.authorization_identifier()
            && let Some(patron) =
                store.patron_by_authorization_identifier(&self.library_id, identifier)?
        {
            return Ok(Some(patron));
        }
        Ok(store.patron_by_authorization_identifier_or_username(&self.library_id, raw_username)?)
    }

    fn merge_and_save(
        &self,
        store: &dyn PatronStore,
        identity: &PatronIdentity,
        mut patron: Patron,
    ) -> Result<Patron, AuthenticationError> {
        identity.apply(&mut patron);
        store.save_patron(&patron)?;
        Ok(patron)
    }
}

impl<S: SourceOfTruth> BasicAuthenticator for BasicAuthProvider<S> {
    fn label(&self) -> &str {
        &self.label
    }

    fn authenticated_patron(
        &self,
        store: &dyn PatronStore,
        credentials: &BasicCredentials,
    ) -> Result<Option<Patron>, AuthenticationError> {
        if !self.server_side_validation(credentials) {
            return Ok(None);
        }

        let Some(mut identity) = self
            .source
            .remote_authenticate(&credentials.username, credentials.password.as_deref())?
        else {
            return Ok(None);
        };

        if !self.enforce_restriction(&credentials.username, &mut identity)? {
            return Ok(None);
        }

        if let Some(patron) = self.local_patron_lookup(store, &identity, &credentials.username)?
            && (identity.complete || !patron.needs_external_sync())
        {
            return Ok(Some(self.merge_and_save(store, &identity, patron)?));
        }

        // Either no local row or a stale one with only a partial hint: get
        // the authoritative record, then retry the lookup before creating.
        if !identity.complete {
            match self.source.remote_patron_lookup(&identity)? {
                Some(complete) => identity = complete,
                None => return Ok(None),
            }
        }
        if let Some(patron) = self.local_patron_lookup(store, &identity, &credentials.username)? {
            return Ok(Some(self.merge_and_save(store, &identity, patron)?));
        }
        let (patron, _) = identity.get_or_create_patron(store, &self.library_id)?;
        Ok(Some(patron))
    }

    fn authenticated_patron_for_token(
        &self,
        store: &dyn PatronStore,
        provider_token: &str,
    ) -> Result<Option<Patron>, AuthenticationError> {
        let Some(credential) =
            store.lookup_credential_by_token(&self.label, BASIC_TOKEN_TYPE, provider_token)?
        else {
            return Ok(None);
        };
        if credential.is_expired() {
            return Ok(None);
        }
        Ok(store.patron_by_id(credential.patron_id)?)
    }

    fn issue_token(
        &self,
        store: &dyn PatronStore,
        patron: &Patron,
    ) -> Result<Credential, AuthenticationError> {
        if let Some(existing) = store.lookup_credential(&self.label, BASIC_TOKEN_TYPE, patron)?
            && existing
                .remaining_validity()
                .is_some_and(|left| left > Duration::minutes(TOKEN_REUSE_THRESHOLD_MINUTES))
        {
            return Ok(existing);
        }
        debug!(provider = %self.label, "minting a fresh basic-as-bearer token");
        let value = Uuid::new_v4().simple().to_string();
        Ok(store.create_temporary_credential(
            &self.label,
            BASIC_TOKEN_TYPE,
            patron,
            Duration::minutes(TOKEN_DURATION_MINUTES),
            value,
        )?)
    }
}

/// Source of truth backed by locally configured test credentials, so a
/// library can run a basic provider without any remote system.
pub struct SimpleSourceOfTruth {
    test_identifier: String,
    test_password: Option<String>,
    neighborhood: Option<String>,
}

impl SimpleSourceOfTruth {
    pub fn from_config(
        config: &AuthConfiguration,
        library: &LibraryConfig,
        integration: &IntegrationConfig,
    ) -> Result<Self, ConfigurationError> {
        let test_identifier = config
            .setting(library, Some(integration), keys::TEST_IDENTIFIER)
            .ok_or_else(|| {
                ConfigurationError::invalid_setting(keys::TEST_IDENTIFIER, "missing")
            })?;
        Ok(Self {
            test_identifier: test_identifier.to_string(),
            test_password: config
                .setting(library, Some(integration), keys::TEST_PASSWORD)
                .map(str::to_string),
            neighborhood: config
                .setting(library, Some(integration), keys::TEST_NEIGHBORHOOD)
                .map(str::to_string),
        })
    }

    fn identity(&self) -> PatronIdentity {
        let mut identity = PatronIdentity::default();
        identity.permanent_id = FieldUpdate::Value(self.test_identifier.clone());
        identity.username = FieldUpdate::Value(self.test_identifier.clone());
        identity.set_authorization_identifier(self.test_identifier.clone());
        if let Some(neighborhood) = &self.neighborhood {
            identity.neighborhood = FieldUpdate::Value(neighborhood.clone());
            identity.cached_neighborhood = FieldUpdate::Value(neighborhood.clone());
        }
        identity
    }
}

impl SourceOfTruth for SimpleSourceOfTruth {
    fn remote_authenticate(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Option<PatronIdentity>, RemoteServiceError> {
        let password_ok = match &self.test_password {
            Some(expected) => password == Some(expected.as_str()),
            None => password.is_none_or(str::is_empty),
        };
        if username == self.test_identifier && password_ok {
            Ok(Some(self.identity()))
        } else {
            Ok(None)
        }
    }

    fn remote_patron_lookup(
        &self,
        identity: &PatronIdentity,
    ) -> Result<Option<PatronIdentity>, RemoteServiceError> {
        let known = identity.username.value().map(String::as_str) == Some(&self.test_identifier)
            || identity.authorization_identifier() == Some(&self.test_identifier);
        Ok(known.then(|| self.identity()))
    }
}
