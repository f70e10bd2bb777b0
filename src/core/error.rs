//! Error types for registration and endpoint validation.

use crate::data_connector::RegistryError;

/// Why an endpoint URL was refused at registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {url}")]
    Malformed { url: String },

    #[error("Unsupported URL scheme '{scheme}', expected http or https")]
    UnsupportedScheme { scheme: String },

    #[error("URL has no host: {url}")]
    MissingHost { url: String },

    #[error("Query strings are not allowed in endpoint URLs: {url}")]
    QueryNotAllowed { url: String },

    #[error("Credentials in URL are not allowed")]
    EmbeddedCredentials,

    #[error("Endpoint host is not allowed: {host}")]
    BlockedHost { host: String },

    #[error("Endpoint port is not allowed: {port}")]
    BlockedPort { port: u16 },
}

/// Registration and admin update failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),

    #[error("Model name must not be empty")]
    InvalidModelName,

    #[error("Server not found: {registration_id}")]
    NotFound { registration_id: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_error_display() {
        let error = UrlValidationError::UnsupportedScheme {
            scheme: "ftp".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Unsupported URL scheme 'ftp', expected http or https"
        );

        let error = UrlValidationError::BlockedHost {
            host: "localhost".to_string(),
        };
        assert_eq!(error.to_string(), "Endpoint host is not allowed: localhost");
    }

    #[test]
    fn test_registration_error_is_transparent_over_url_error() {
        let error: RegistrationError = UrlValidationError::BlockedPort { port: 22 }.into();
        assert_eq!(error.to_string(), "Endpoint port is not allowed: 22");
        assert!(matches!(error, RegistrationError::InvalidUrl(_)));
    }

    #[test]
    fn test_registry_error_conversion() {
        let error: RegistrationError = RegistryError::Storage("pool exhausted".to_string()).into();
        assert_eq!(error.to_string(), "Storage error: pool exhausted");
    }
}
