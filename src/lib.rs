//! Patron authentication and identity reconciliation for a library
//! circulation backend.
//!
//! An opaque inbound credential (an HTTP Basic pair, an OAuth authorization
//! code, or a signed bearer envelope) is turned into a verified,
//! library-scoped patron identity. Each library configures its own set of
//! authentication providers; the remote ILS or identity server behind each
//! provider stays an opaque source of truth behind a narrow trait.

pub mod authenticator;
pub mod bearer_token;
pub mod config;
pub mod http;
pub mod http_client;
pub mod identity;
pub mod library;
pub mod provider;
pub mod restriction;
pub mod store;

use thiserror::Error;

use crate::bearer_token::BearerTokenError;
use crate::provider::RemoteServiceError;
use crate::store::StoreError;

/// Identifier for a library, as stored alongside every patron row.
pub type LibraryId = String;

/// Request-time failures of the authentication subsystem.
///
/// Expected negative outcomes (wrong password, unknown token) are not errors;
/// they surface as `Ok(None)` from the provider entry points. Everything here
/// is returned to the caller for translation into a protocol-facing response,
/// never logged and swallowed.
#[derive(Error, Debug)]
pub enum AuthenticationError {
    /// Network or protocol failure talking to the source of truth. Retryable
    /// by the user; never auto-retried inside this subsystem.
    #[error("remote service error: `{0}`")]
    RemoteService(#[from] RemoteServiceError),
    /// The identity resolved but fails this library's identifier restriction.
    #[error("patron belongs to another library")]
    PatronOfAnotherLibrary,
    /// A bearer envelope named a provider this library never registered.
    #[error("unknown authentication provider: `{0}`")]
    UnknownProvider(String),
    /// The credential shape matched no registered provider.
    #[error("unsupported authentication mechanism")]
    UnsupportedAuthenticationMechanism,
    /// The OAuth callback arrived without a usable `code`/`state` pair.
    #[error("invalid OAuth callback parameters: `{0}`")]
    InvalidCallbackParameters(String),
    /// No `LibraryAuthenticator` exists for the requested short name.
    #[error("no such library: `{0}`")]
    LibraryNotFound(String),
    /// The remote identity carried no key usable to find or create a patron.
    #[error("remote identity has no identifying information")]
    CannotCreateLocalPatron,
    /// Signing or verifying a bearer envelope failed outside of dispatch.
    /// During dispatch a decode failure is "credentials not understood" and
    /// falls through to the other branches instead of surfacing here.
    #[error("bearer token error: `{0}`")]
    BearerToken(#[from] BearerTokenError),
    #[error("patron store error: `{0}`")]
    Store(#[from] StoreError),
}
