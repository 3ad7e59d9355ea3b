use std::collections::HashMap;

use tracing::error;

use crate::bearer_token::BearerEnvelope;
use crate::config::{AuthConfiguration, SigningSecretSource};
use crate::http_client::HttpClient;
use crate::library::{AuthorizationHeader, LibraryAuthenticator};
use crate::store::{Patron, PatronStore};
use crate::AuthenticationError;

/// Top-level router: resolves a library short name to its registry and
/// forwards every call there.
///
/// Built wholesale from the configuration; a configuration change builds a
/// replacement rather than mutating this one, so concurrent requests never
/// observe a partially updated registry set.
pub struct Authenticator {
    libraries: HashMap<String, LibraryAuthenticator>,
}

impl Authenticator {
    pub fn from_config<C>(
        config: &AuthConfiguration,
        secrets: &dyn SigningSecretSource,
        http: C,
    ) -> Self
    where
        C: HttpClient + Clone + 'static,
    {
        let mut libraries = HashMap::new();
        for library in &config.libraries {
            match LibraryAuthenticator::from_config(config, library, secrets, http.clone()) {
                Ok(authenticator) => {
                    libraries.insert(library.short_name.clone(), authenticator);
                }
                Err(err) => {
                    error!(
                        library = %library.short_name,
                        error = %err,
                        "library authenticator could not be built; library skipped"
                    );
                }
            }
        }
        Self { libraries }
    }

    pub fn library_authenticator(
        &self,
        short_name: &str,
    ) -> Result<&LibraryAuthenticator, AuthenticationError> {
        self.libraries
            .get(short_name)
            .ok_or_else(|| AuthenticationError::LibraryNotFound(short_name.to_string()))
    }

    pub fn authenticated_patron(
        &self,
        short_name: &str,
        store: &dyn PatronStore,
        header: &AuthorizationHeader,
    ) -> Result<Option<Patron>, AuthenticationError> {
        self.library_authenticator(short_name)?
            .authenticated_patron(store, header)
    }

    pub fn create_bearer_token(
        &self,
        short_name: &str,
        provider_name: &str,
        provider_token: &str,
    ) -> Result<String, AuthenticationError> {
        self.library_authenticator(short_name)?
            .create_bearer_token(provider_name, provider_token)
    }

    pub fn decode_bearer_token(
        &self,
        short_name: &str,
        compact: &str,
    ) -> Result<BearerEnvelope, AuthenticationError> {
        self.library_authenticator(short_name)?
            .decode_bearer_token(compact)
    }

    pub fn www_authenticate_header(
        &self,
        short_name: &str,
    ) -> Result<String, AuthenticationError> {
        Ok(self
            .library_authenticator(short_name)?
            .www_authenticate_header())
    }
}
