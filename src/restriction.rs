use regex::Regex;

use crate::identity::PatronIdentity;

/// Which identity field the restriction is matched against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RestrictionField {
    /// The raw identifier the patron authenticated with.
    #[default]
    Barcode,
    /// A named field reported by the source of truth, carried on
    /// [`PatronIdentity::library_identifier`].
    Named(String),
}

impl RestrictionField {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("barcode") {
            RestrictionField::Barcode
        } else {
            RestrictionField::Named(value.to_string())
        }
    }
}

/// The rule deciding whether an identifier belongs to this library.
#[derive(Debug, Clone, Default)]
pub enum RestrictionKind {
    #[default]
    None,
    Prefix(String),
    String(String),
    Regex(Regex),
    List(Vec<String>),
}

impl RestrictionKind {
    /// Builds a `List` restriction from a comma-separated setting value,
    /// trimming each entry.
    pub fn list_from_setting(value: &str) -> Self {
        RestrictionKind::List(
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Outcome of enforcing a restriction against a patron identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionOutcome {
    Pass,
    /// The identity resolves but belongs to another library.
    Blocked,
    /// The comparison field is only present on the complete remote record;
    /// the caller must perform a remote lookup and enforce again.
    NeedsCompleteIdentity,
}

/// Per-library rule determining whether an otherwise-valid identifier belongs
/// to this library, for ILS systems shared across libraries.
#[derive(Debug, Clone, Default)]
pub struct LibraryIdentifierRestriction {
    pub kind: RestrictionKind,
    pub field: RestrictionField,
}

impl LibraryIdentifierRestriction {
    pub fn new(kind: RestrictionKind, field: RestrictionField) -> Self {
        Self { kind, field }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self.kind, RestrictionKind::None)
    }

    /// Pure predicate: does `field_value` satisfy this restriction?
    ///
    /// No restriction configured always passes; a configured restriction
    /// with the field missing always fails.
    pub fn matches(&self, field_value: Option<&str>) -> bool {
        let field_value = match (&self.kind, field_value) {
            (RestrictionKind::None, _) => return true,
            (_, None | Some("")) => return false,
            (_, Some(v)) => v,
        };
        match &self.kind {
            RestrictionKind::None => true,
            RestrictionKind::Prefix(prefix) => field_value.starts_with(prefix.as_str()),
            RestrictionKind::String(expected) => field_value == expected,
            RestrictionKind::Regex(regex) => regex.is_match(field_value),
            RestrictionKind::List(values) => values.iter().any(|v| v == field_value),
        }
    }

    /// Enforces this restriction for an identity authenticating with
    /// `identifier`.
    ///
    /// Pure: when the comparison field lives on the remote record and the
    /// identity at hand is only a partial hint, this returns
    /// [`RestrictionOutcome::NeedsCompleteIdentity`] and the caller performs
    /// the blocking remote lookup before enforcing again. A patron already
    /// persisted for this library short-circuits this check entirely; that
    /// path never reaches here.
    pub fn enforce(&self, identifier: &str, identity: &PatronIdentity) -> RestrictionOutcome {
        if !self.is_configured() {
            return RestrictionOutcome::Pass;
        }
        let field_value = match &self.field {
            RestrictionField::Barcode => Some(identifier),
            RestrictionField::Named(_) => {
                if identity.library_identifier.is_unspecified() && !identity.complete {
                    return RestrictionOutcome::NeedsCompleteIdentity;
                }
                identity.library_identifier.value().map(String::as_str)
            }
        };
        if self.matches(field_value) {
            RestrictionOutcome::Pass
        } else {
            RestrictionOutcome::Blocked
        }
    }
}
