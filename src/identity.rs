use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Patron, PatronKey, PatronStore, StoreError};
use crate::{AuthenticationError, LibraryId};

/// Tri-state field update carried by a [`PatronIdentity`].
///
/// `Unspecified` means the remote source had no opinion and the persisted
/// value is left alone; `Clear` means the remote source explicitly reported
/// the field as empty; `Value` overwrites.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldUpdate<T> {
    #[default]
    Unspecified,
    Clear,
    Value(T),
}

impl<T: Clone> FieldUpdate<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            FieldUpdate::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, FieldUpdate::Unspecified)
    }

    /// Writes this update onto a persisted field.
    pub fn apply_to(&self, target: &mut Option<T>) {
        match self {
            FieldUpdate::Unspecified => {}
            FieldUpdate::Clear => *target = None,
            FieldUpdate::Value(v) => *target = Some(v.clone()),
        }
    }
}

impl<T> From<Option<T>> for FieldUpdate<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldUpdate::Value(v),
            None => FieldUpdate::Unspecified,
        }
    }
}

/// Why the source of truth is blocking a patron from borrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Unknown,
    CardReportedLost,
    ExcessiveFines,
    ExcessiveFees,
    NoBorrowingPrivileges,
    TooManyLoans,
    TooManyRenewals,
    TooManyOverdue,
    TooManyLost,
    TooManyItemsBilled,
    RecallOverdue,
}

/// Ordered, non-empty list of identifiers the source of truth considers valid
/// for one patron. The first element is the primary identifier by convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationIdentifiers(Vec<String>);

impl AuthorizationIdentifiers {
    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    pub fn all(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.iter().any(|i| i == identifier)
    }
}

impl From<String> for AuthorizationIdentifiers {
    fn from(identifier: String) -> Self {
        Self(vec![identifier])
    }
}

impl From<&str> for AuthorizationIdentifiers {
    fn from(identifier: &str) -> Self {
        Self(vec![identifier.to_string()])
    }
}

/// Everything known about a patron as reported by a remote source of truth.
///
/// Transient; rebuilt on every authentication attempt, then merged into the
/// persisted [`Patron`] via [`apply`](Self::apply). `personal_name` and
/// `email_address` are client-facing only and are never persisted, which is
/// why `Patron` has no such fields at all.
#[derive(Debug, Clone, PartialEq)]
pub struct PatronIdentity {
    pub permanent_id: FieldUpdate<String>,
    authorization_identifier: FieldUpdate<AuthorizationIdentifiers>,
    pub username: FieldUpdate<String>,
    pub personal_name: FieldUpdate<String>,
    pub email_address: FieldUpdate<String>,
    pub authorization_expires: FieldUpdate<DateTime<Utc>>,
    pub external_type: FieldUpdate<String>,
    pub fines: FieldUpdate<BigDecimal>,
    pub block_reason: FieldUpdate<BlockReason>,
    /// Opaque field matched against the library's identifier restriction.
    pub library_identifier: FieldUpdate<String>,
    /// Request-scoped; never persisted as-is.
    pub neighborhood: FieldUpdate<String>,
    /// Persistable variant of `neighborhood`, cached on the patron row.
    pub cached_neighborhood: FieldUpdate<String>,
    /// Whether this is the authoritative full record from the source of
    /// truth, as opposed to a partial hint assembled locally.
    pub complete: bool,
}

impl Default for PatronIdentity {
    fn default() -> Self {
        Self {
            permanent_id: FieldUpdate::Unspecified,
            authorization_identifier: FieldUpdate::Unspecified,
            username: FieldUpdate::Unspecified,
            personal_name: FieldUpdate::Unspecified,
            email_address: FieldUpdate::Unspecified,
            authorization_expires: FieldUpdate::Unspecified,
            external_type: FieldUpdate::Unspecified,
            fines: FieldUpdate::Unspecified,
            block_reason: FieldUpdate::Unspecified,
            library_identifier: FieldUpdate::Unspecified,
            neighborhood: FieldUpdate::Unspecified,
            cached_neighborhood: FieldUpdate::Unspecified,
            complete: true,
        }
    }
}

impl PatronIdentity {
    /// A partial identity hint, e.g. one assembled from raw credentials
    /// before the source of truth has been consulted.
    pub fn partial() -> Self {
        Self {
            complete: false,
            ..Self::default()
        }
    }

    /// Sets the full identifier list. The first element becomes the primary
    /// identifier; an empty list is an explicit clear.
    pub fn set_authorization_identifiers(&mut self, identifiers: Vec<String>) {
        self.authorization_identifier = if identifiers.is_empty() {
            FieldUpdate::Clear
        } else {
            FieldUpdate::Value(AuthorizationIdentifiers(identifiers))
        };
    }

    /// Sets a single identifier, i.e. a singleton list.
    pub fn set_authorization_identifier(&mut self, identifier: impl Into<String>) {
        self.set_authorization_identifiers(vec![identifier.into()]);
    }

    pub fn clear_authorization_identifier(&mut self) {
        self.authorization_identifier = FieldUpdate::Clear;
    }

    /// The primary authorization identifier, always `all()[0]` when set.
    pub fn authorization_identifier(&self) -> Option<&str> {
        self.authorization_identifier.value().map(|ids| ids.primary())
    }

    pub fn authorization_identifiers(&self) -> &[String] {
        self.authorization_identifier
            .value()
            .map(|ids| ids.all())
            .unwrap_or(&[])
    }

    /// The neighborhood to report to the client for this request, regardless
    /// of whether it came fresh from the remote or from the patron cache.
    pub fn effective_neighborhood(&self) -> Option<&str> {
        self.neighborhood
            .value()
            .or_else(|| self.cached_neighborhood.value())
            .map(String::as_str)
    }

    /// Merges this identity into a persisted patron row.
    ///
    /// Every specified field is written except the client-facing ones.
    /// Authorization-identifier handling is asymmetric: a complete record's
    /// identifier list is authoritative, while a partial record may only fill
    /// in a missing identifier. When two partial views disagree and cannot be
    /// reconciled locally, the patron is marked for a forced resync by
    /// clearing `last_external_sync`.
    pub fn apply(&self, patron: &mut Patron) {
        self.permanent_id.apply_to(&mut patron.external_identifier);
        self.username.apply_to(&mut patron.username);
        self.authorization_expires
            .apply_to(&mut patron.authorization_expires);
        self.external_type.apply_to(&mut patron.external_type);
        self.fines.apply_to(&mut patron.fines);
        self.block_reason.apply_to(&mut patron.block_reason);
        match &self.cached_neighborhood {
            FieldUpdate::Unspecified => {}
            FieldUpdate::Clear => {
                patron.cached_neighborhood = None;
                patron.neighborhood_cached_at = None;
            }
            FieldUpdate::Value(neighborhood) => {
                patron.cached_neighborhood = Some(neighborhood.clone());
                patron.neighborhood_cached_at = Some(Utc::now());
            }
        }

        if self.complete {
            match &self.authorization_identifier {
                FieldUpdate::Unspecified => {}
                FieldUpdate::Clear => patron.authorization_identifier = None,
                FieldUpdate::Value(identifiers) => {
                    // The remote list is authoritative: keep the persisted
                    // identifier only while it is still on the list.
                    let still_valid = patron
                        .authorization_identifier
                        .as_deref()
                        .is_some_and(|current| identifiers.contains(current));
                    if !still_valid {
                        patron.authorization_identifier =
                            Some(identifiers.primary().to_string());
                    }
                }
            }
            patron.last_external_sync = Some(Utc::now());
        } else if let FieldUpdate::Value(identifiers) = &self.authorization_identifier {
            let primary = identifiers.primary();
            if patron.authorization_identifier.as_deref() != Some(primary) {
                if patron.authorization_identifier.is_none() {
                    // Nothing persisted yet; set provisionally.
                    patron.authorization_identifier = Some(primary.to_string());
                } else if patron.username.as_deref() == Some(primary) {
                    // The identifier doubles as the username; not an actual
                    // change.
                } else {
                    // Two partial views disagree; force a full resync.
                    patron.last_external_sync = None;
                }
            }
        }
    }

    /// The key this identity would be stored under, by precedence:
    /// permanent id, then username, then authorization identifier.
    pub fn patron_key(&self) -> Option<PatronKey> {
        if let Some(permanent_id) = self.permanent_id.value() {
            return Some(PatronKey::ExternalIdentifier(permanent_id.clone()));
        }
        if let Some(username) = self.username.value() {
            return Some(PatronKey::Username(username.clone()));
        }
        self.authorization_identifier()
            .map(|id| PatronKey::AuthorizationIdentifier(id.to_string()))
    }

    /// Looks up or creates the patron row for this identity and immediately
    /// merges the identity into it, so a fresh row is in sync within the same
    /// unit of work.
    ///
    /// A concurrent request creating the same row surfaces as a
    /// [`StoreError::UniquenessConflict`]; one retry is enough since the row
    /// is then guaranteed to exist.
    pub fn get_or_create_patron(
        &self,
        store: &dyn PatronStore,
        library_id: &LibraryId,
    ) -> Result<(Patron, bool), AuthenticationError> {
        let key = self
            .patron_key()
            .ok_or(AuthenticationError::CannotCreateLocalPatron)?;
        let (mut patron, is_new) = match store.find_or_create_patron(library_id, &key) {
            Err(StoreError::UniquenessConflict) => store.find_or_create_patron(library_id, &key)?,
            other => other?,
        };
        self.apply(&mut patron);
        store.save_patron(&patron)?;
        Ok((patron, is_new))
    }
}

/// Parses a fine amount as reported by an ILS, stripping currency decoration:
/// `"$1.27"`, `"1.27 USD"` and `"USD 1.27"` all come out as `1.27`.
pub fn parse_fines(raw: &str) -> Option<BigDecimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::Duration;
    use mockall::predicate::eq;
    use rstest::rstest;

    use super::*;
    use crate::store::test::MockPatronStore;

    fn blank_patron() -> Patron {
        Patron::new(
            &"lib".to_string(),
            &PatronKey::Username("placeholder".to_string()),
        )
    }

    #[test]
    fn primary_identifier_is_first_of_list() {
        let mut identity = PatronIdentity::default();
        identity.set_authorization_identifiers(vec!["25001".to_string(), "77002".to_string()]);
        assert_eq!(identity.authorization_identifier(), Some("25001"));
        assert_eq!(
            identity.authorization_identifiers(),
            &["25001".to_string(), "77002".to_string()]
        );
    }

    #[test]
    fn single_identifier_becomes_singleton_list() {
        let mut identity = PatronIdentity::default();
        identity.set_authorization_identifier("25001");
        assert_eq!(identity.authorization_identifiers(), &["25001".to_string()]);
    }

    #[test]
    fn empty_list_is_an_explicit_clear() {
        let mut identity = PatronIdentity::default();
        identity.set_authorization_identifiers(vec![]);
        assert_eq!(identity.authorization_identifier(), None);

        let mut patron = blank_patron();
        patron.authorization_identifier = Some("25001".to_string());
        identity.apply(&mut patron);
        assert_eq!(patron.authorization_identifier, None);
    }

    #[test]
    fn apply_writes_specified_fields_and_skips_unspecified() {
        let mut identity = PatronIdentity::default();
        identity.permanent_id = FieldUpdate::Value("pid-1".to_string());
        identity.external_type = FieldUpdate::Value("adult".to_string());
        identity.fines = FieldUpdate::Value(parse_fines("$1.27").unwrap());
        identity.block_reason = FieldUpdate::Value(BlockReason::ExcessiveFines);

        let mut patron = blank_patron();
        patron.username = Some("keep-me".to_string());
        identity.apply(&mut patron);

        assert_eq!(patron.external_identifier.as_deref(), Some("pid-1"));
        assert_eq!(patron.external_type.as_deref(), Some("adult"));
        assert_eq!(patron.fines, parse_fines("1.27"));
        assert_eq!(patron.block_reason, Some(BlockReason::ExcessiveFines));
        // Unspecified username left alone.
        assert_eq!(patron.username.as_deref(), Some("keep-me"));
        // Complete record stamps the sync time.
        assert!(patron.last_external_sync.is_some());
    }

    #[test]
    fn apply_clear_empties_persisted_value() {
        let mut identity = PatronIdentity::default();
        identity.external_type = FieldUpdate::Clear;

        let mut patron = blank_patron();
        patron.external_type = Some("juvenile".to_string());
        identity.apply(&mut patron);
        assert_eq!(patron.external_type, None);
    }

    #[test]
    fn complete_identity_replaces_identifier_missing_from_remote_list() {
        let mut identity = PatronIdentity::default();
        identity.set_authorization_identifiers(vec!["new-1".to_string(), "new-2".to_string()]);

        let mut patron = blank_patron();
        patron.authorization_identifier = Some("revoked".to_string());
        identity.apply(&mut patron);
        assert_eq!(patron.authorization_identifier.as_deref(), Some("new-1"));
    }

    #[test]
    fn complete_identity_keeps_identifier_still_on_remote_list() {
        let mut identity = PatronIdentity::default();
        identity.set_authorization_identifiers(vec!["new-1".to_string(), "current".to_string()]);

        let mut patron = blank_patron();
        patron.authorization_identifier = Some("current".to_string());
        identity.apply(&mut patron);
        assert_eq!(patron.authorization_identifier.as_deref(), Some("current"));
    }

    #[test]
    fn partial_identity_fills_missing_identifier() {
        let mut identity = PatronIdentity::partial();
        identity.set_authorization_identifier("25001");

        let mut patron = blank_patron();
        identity.apply(&mut patron);
        assert_eq!(patron.authorization_identifier.as_deref(), Some("25001"));
        // Partial records never stamp a sync time.
        assert_eq!(patron.last_external_sync, None);
    }

    #[test]
    fn partial_identity_matching_username_is_not_a_change() {
        let mut identity = PatronIdentity::partial();
        identity.set_authorization_identifier("user-1");

        let mut patron = blank_patron();
        patron.authorization_identifier = Some("barcode-1".to_string());
        patron.username = Some("user-1".to_string());
        patron.last_external_sync = Some(Utc::now());
        identity.apply(&mut patron);

        assert_eq!(patron.authorization_identifier.as_deref(), Some("barcode-1"));
        assert!(patron.last_external_sync.is_some());
    }

    #[test]
    fn conflicting_partial_views_force_resync() {
        let mut identity = PatronIdentity::partial();
        identity.set_authorization_identifier("other-barcode");

        let mut patron = blank_patron();
        patron.authorization_identifier = Some("barcode-1".to_string());
        patron.username = Some("user-1".to_string());
        patron.last_external_sync = Some(Utc::now());
        identity.apply(&mut patron);

        assert_eq!(patron.authorization_identifier.as_deref(), Some("barcode-1"));
        assert_eq!(patron.last_external_sync, None);
    }

    #[test]
    fn apply_is_idempotent_for_complete_identities() {
        let mut identity = PatronIdentity::default();
        identity.permanent_id = FieldUpdate::Value("pid-1".to_string());
        identity.username = FieldUpdate::Value("user-1".to_string());
        identity.set_authorization_identifiers(vec!["25001".to_string()]);
        identity.fines = FieldUpdate::Value(parse_fines("2.50").unwrap());

        let mut patron = blank_patron();
        identity.apply(&mut patron);
        let mut again = patron.clone();
        identity.apply(&mut again);

        assert_eq!(again.external_identifier, patron.external_identifier);
        assert_eq!(again.username, patron.username);
        assert_eq!(
            again.authorization_identifier,
            patron.authorization_identifier
        );
        assert_eq!(again.fines, patron.fines);
    }

    #[test]
    fn neighborhood_is_cached_with_timestamp() {
        let mut identity = PatronIdentity::default();
        identity.cached_neighborhood = FieldUpdate::Value("Uptown".to_string());

        let mut patron = blank_patron();
        identity.apply(&mut patron);
        assert_eq!(patron.cached_neighborhood.as_deref(), Some("Uptown"));
        assert!(patron.neighborhood_cached_at.is_some());
    }

    #[test]
    fn effective_neighborhood_prefers_request_scoped_value() {
        let mut identity = PatronIdentity::default();
        identity.cached_neighborhood = FieldUpdate::Value("Cached".to_string());
        assert_eq!(identity.effective_neighborhood(), Some("Cached"));

        identity.neighborhood = FieldUpdate::Value("Fresh".to_string());
        assert_eq!(identity.effective_neighborhood(), Some("Fresh"));
    }

    #[test]
    fn patron_key_precedence() {
        let mut identity = PatronIdentity::default();
        identity.set_authorization_identifier("25001");
        assert_eq!(
            identity.patron_key(),
            Some(PatronKey::AuthorizationIdentifier("25001".to_string()))
        );

        identity.username = FieldUpdate::Value("user-1".to_string());
        assert_eq!(
            identity.patron_key(),
            Some(PatronKey::Username("user-1".to_string()))
        );

        identity.permanent_id = FieldUpdate::Value("pid-1".to_string());
        assert_eq!(
            identity.patron_key(),
            Some(PatronKey::ExternalIdentifier("pid-1".to_string()))
        );
    }

    #[test]
    fn get_or_create_without_any_key_fails() {
        let store = MockPatronStore::new();
        let identity = PatronIdentity::default();
        let result = identity.get_or_create_patron(&store, &"lib".to_string());
        assert_matches!(
            result.unwrap_err(),
            AuthenticationError::CannotCreateLocalPatron
        );
    }

    #[test]
    fn get_or_create_applies_identity_to_fresh_row() {
        let library = "lib".to_string();
        let mut identity = PatronIdentity::default();
        identity.permanent_id = FieldUpdate::Value("pid-1".to_string());
        identity.set_authorization_identifier("25001");

        let mut store = MockPatronStore::new();
        let key = PatronKey::ExternalIdentifier("pid-1".to_string());
        store
            .expect_find_or_create_patron()
            .once()
            .with(eq(library.clone()), eq(key.clone()))
            .returning(move |library_id, key| Ok((Patron::new(library_id, key), true)));
        store
            .expect_save_patron()
            .once()
            .withf(|patron| patron.authorization_identifier.as_deref() == Some("25001"))
            .returning(|_| Ok(()));

        let (patron, is_new) = identity.get_or_create_patron(&store, &library).unwrap();
        assert!(is_new);
        assert_eq!(patron.external_identifier.as_deref(), Some("pid-1"));
        assert_eq!(patron.authorization_identifier.as_deref(), Some("25001"));
    }

    #[test]
    fn get_or_create_retries_once_on_uniqueness_conflict() {
        let library = "lib".to_string();
        let mut identity = PatronIdentity::default();
        identity.username = FieldUpdate::Value("user-1".to_string());

        let mut store = MockPatronStore::new();
        let mut attempts = 0;
        store
            .expect_find_or_create_patron()
            .times(2)
            .returning(move |library_id, key| {
                attempts += 1;
                if attempts == 1 {
                    Err(StoreError::UniquenessConflict)
                } else {
                    Ok((Patron::new(library_id, key), false))
                }
            });
        store.expect_save_patron().once().returning(|_| Ok(()));

        let (patron, is_new) = identity.get_or_create_patron(&store, &library).unwrap();
        assert!(!is_new);
        assert_eq!(patron.username.as_deref(), Some("user-1"));
    }

    #[test]
    fn concurrent_get_or_create_produces_one_row() {
        use std::sync::Arc;

        use crate::store::test::MemoryPatronStore;

        let store = Arc::new(MemoryPatronStore::default());
        let library = "lib".to_string();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let library = library.clone();
                std::thread::spawn(move || {
                    let mut identity = PatronIdentity::default();
                    identity.username = FieldUpdate::Value("user-1".to_string());
                    identity.get_or_create_patron(store.as_ref(), &library)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(store.patron_count(), 1);
    }

    #[rstest]
    #[case("$1.27", Some("1.27"))]
    #[case("1.27 USD", Some("1.27"))]
    #[case("USD 1.27", Some("1.27"))]
    #[case("0", Some("0"))]
    #[case("-3.00", Some("-3.00"))]
    #[case("no fines", None)]
    fn fines_parsing(#[case] raw: &str, #[case] expected: Option<&str>) {
        let expected = expected.map(|v| BigDecimal::from_str(v).unwrap());
        assert_eq!(parse_fines(raw), expected);
    }

    #[test]
    fn authorization_expiry_applies() {
        let expires = Utc::now() + Duration::days(30);
        let mut identity = PatronIdentity::default();
        identity.authorization_expires = FieldUpdate::Value(expires);

        let mut patron = blank_patron();
        identity.apply(&mut patron);
        assert_eq!(patron.authorization_expires, Some(expires));
    }
}
