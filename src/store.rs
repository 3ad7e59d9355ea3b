use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::LibraryId;
use crate::identity::BlockReason;

/// Hours of staleness after which a patron's ILS data must be refreshed.
pub const MAX_SYNC_AGE_HOURS: i64 = 12;

/// Hours a cached neighborhood stays usable before it is considered stale.
pub const CACHED_NEIGHBORHOOD_TTL_HOURS: i64 = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another request created the same patron row first. Callers retry the
    /// lookup; the row is guaranteed to exist afterwards.
    #[error("uniqueness constraint violated")]
    UniquenessConflict,
    #[error("storage backend error: `{0}`")]
    Backend(String),
}

/// The identity key used to find or create a patron row within a library.
///
/// Precedence among these is decided by the caller; see
/// [`PatronIdentity::get_or_create_patron`](crate::identity::PatronIdentity::get_or_create_patron).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatronKey {
    ExternalIdentifier(String),
    Username(String),
    AuthorizationIdentifier(String),
}

/// A persisted patron row, owned by the storage collaborator.
///
/// This subsystem never mutates a `Patron` directly; every write goes through
/// [`PatronIdentity::apply`](crate::identity::PatronIdentity::apply). There is
/// deliberately no personal-name or email field here: those are client-facing
/// values that are never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Patron {
    pub id: Uuid,
    pub library_id: LibraryId,
    /// The permanent, opaque identifier assigned by the source of truth.
    pub external_identifier: Option<String>,
    pub username: Option<String>,
    pub authorization_identifier: Option<String>,
    pub authorization_expires: Option<DateTime<Utc>>,
    pub external_type: Option<String>,
    pub fines: Option<BigDecimal>,
    pub block_reason: Option<BlockReason>,
    /// When the source of truth last confirmed this row in full. `None` means
    /// the next authentication must perform a complete remote sync.
    pub last_external_sync: Option<DateTime<Utc>>,
    pub cached_neighborhood: Option<String>,
    pub neighborhood_cached_at: Option<DateTime<Utc>>,
}

impl Patron {
    /// A blank row for the given library, keyed by `key`.
    pub fn new(library_id: &LibraryId, key: &PatronKey) -> Self {
        let mut patron = Self {
            id: Uuid::now_v7(),
            library_id: library_id.clone(),
            external_identifier: None,
            username: None,
            authorization_identifier: None,
            authorization_expires: None,
            external_type: None,
            fines: None,
            block_reason: None,
            last_external_sync: None,
            cached_neighborhood: None,
            neighborhood_cached_at: None,
        };
        match key {
            PatronKey::ExternalIdentifier(v) => patron.external_identifier = Some(v.clone()),
            PatronKey::Username(v) => patron.username = Some(v.clone()),
            PatronKey::AuthorizationIdentifier(v) => {
                patron.authorization_identifier = Some(v.clone())
            }
        }
        patron
    }

    pub fn needs_external_sync(&self) -> bool {
        match self.last_external_sync {
            None => true,
            Some(synced) => Utc::now() - synced > Duration::hours(MAX_SYNC_AGE_HOURS),
        }
    }

    /// The cached neighborhood, if it is still within its TTL.
    pub fn neighborhood(&self) -> Option<&str> {
        let cached_at = self.neighborhood_cached_at?;
        if Utc::now() - cached_at > Duration::hours(CACHED_NEIGHBORHOOD_TTL_HOURS) {
            return None;
        }
        self.cached_neighborhood.as_deref()
    }
}

/// A persisted token belonging to a patron, e.g. an OAuth access token or a
/// minted basic-auth token. The bearer envelope wrapping one of these is
/// stateless; expiry is enforced here.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub id: Uuid,
    pub data_source: String,
    pub token_type: String,
    pub patron_id: Uuid,
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|expires| expires <= Utc::now())
    }

    /// Time left before expiry. `None` for non-expiring or already expired
    /// credentials.
    pub fn remaining_validity(&self) -> Option<Duration> {
        let expires = self.expires?;
        let remaining = expires - Utc::now();
        (remaining > Duration::zero()).then_some(remaining)
    }
}

/// Contract with the persisted patron/credential store.
///
/// `find_or_create_patron` must not produce two rows for the same
/// `(library_id, key)` under concurrent calls: either the backend enforces a
/// unique constraint and reports [`StoreError::UniquenessConflict`] on the
/// losing side, or it performs an equivalent atomic compare-and-swap.
pub trait PatronStore {
    fn find_or_create_patron(
        &self,
        library_id: &LibraryId,
        key: &PatronKey,
    ) -> Result<(Patron, bool), StoreError>;

    fn patron_by_id(&self, id: Uuid) -> Result<Option<Patron>, StoreError>;

    fn patron_by_external_identifier(
        &self,
        library_id: &LibraryId,
        external_identifier: &str,
    ) -> Result<Option<Patron>, StoreError>;

    fn patron_by_username(
        &self,
        library_id: &LibraryId,
        username: &str,
    ) -> Result<Option<Patron>, StoreError>;

    fn patron_by_authorization_identifier(
        &self,
        library_id: &LibraryId,
        authorization_identifier: &str,
    ) -> Result<Option<Patron>, StoreError>;

    /// Matches a patron whose authorization identifier *or* username equals
    /// `value`. Last resort of the local lookup chain.
    fn patron_by_authorization_identifier_or_username(
        &self,
        library_id: &LibraryId,
        value: &str,
    ) -> Result<Option<Patron>, StoreError>;

    fn save_patron(&self, patron: &Patron) -> Result<(), StoreError>;

    fn lookup_credential(
        &self,
        data_source: &str,
        token_type: &str,
        patron: &Patron,
    ) -> Result<Option<Credential>, StoreError>;

    fn lookup_credential_by_token(
        &self,
        data_source: &str,
        token_type: &str,
        value: &str,
    ) -> Result<Option<Credential>, StoreError>;

    fn create_temporary_credential(
        &self,
        data_source: &str,
        token_type: &str,
        patron: &Patron,
        duration: Duration,
        value: String,
    ) -> Result<Credential, StoreError>;
}
