//! Error types for the broker

use thiserror::Error;

/// Main error type for broker operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Outbound HTTP error (cluster creator, service registry)
    #[error("upstream http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or incomplete request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown service, plan or instance
    #[error("not found: {0}")]
    NotFound(String),

    /// Catalog name collision
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tenant cluster quota reached
    #[error("clusters quota exceeded, max allowed is {0}")]
    QuotaExceeded(usize),

    /// Catalog file or placeholder substitution problem
    #[error("template error: {0}")]
    Template(String),

    /// Upstream collaborator misbehaved (cluster creator, registry)
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Target no longer exists
    #[error("gone: {0}")]
    Gone(String),

    /// Authentication failure
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Broker configuration problem
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid-request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create an upstream error with the given message
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create a gone error with the given message
    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = Error::not_found("no such plan by id: P9");
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains("P9"));

        let err = Error::conflict("service with name redis already exists");
        assert!(err.to_string().contains("already exists"));

        let err = Error::QuotaExceeded(5);
        assert!(err.to_string().contains("max allowed is 5"));
    }

    #[test]
    fn constructors_accept_str_and_string() {
        let name = "etcd-cluster";
        let err = Error::template(format!("unparsable manifest for {name}"));
        assert!(err.to_string().contains("etcd-cluster"));

        let err = Error::upstream("creator returned 500");
        assert!(err.to_string().contains("creator returned 500"));
    }
}
