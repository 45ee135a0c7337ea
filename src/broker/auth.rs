//! Authentication middleware
//!
//! Two realms guard the API: the service-broker routes use basic auth with
//! the credentials the platform registered the broker under, the platform
//! operation routes use JWT bearer tokens issued by the platform's identity
//! service and require the `console.admin` scope. Authentication failures
//! short-circuit before any broker state is touched.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;

use super::{ApiError, BrokerContext};

/// Scope a JWT must carry to use the platform routes
const REQUIRED_SCOPE: &str = "console.admin";

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    scope: Vec<String>,
}

/// Basic-auth guard for the `/v2` service-broker realm
pub async fn basic_auth(
    State(ctx): State<BrokerContext>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = bearer_header(&request)?;
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| Error::Unauthorized("basic auth required".into()))?;

    let decoded = BASE64
        .decode(encoded)
        .map_err(|_| Error::Unauthorized("malformed basic auth header".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::Unauthorized("malformed basic auth header".into()))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| Error::Unauthorized("malformed basic auth header".into()))?;

    if user != ctx.settings.auth_user || pass != ctx.settings.auth_pass {
        debug!(user, "basic auth rejected");
        return Err(Error::Unauthorized("bad credentials".into()).into());
    }
    Ok(next.run(request).await)
}

/// JWT bearer guard for the `/rest` platform realm
pub async fn jwt_auth(
    State(ctx): State<BrokerContext>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = ctx
        .jwt_key
        .as_ref()
        .ok_or_else(|| Error::Unauthorized("jwt verification not configured".into()))?;

    let header = bearer_header(&request)?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| Error::Unauthorized("bearer token required".into()))?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<Claims>(token, key, &validation)
        .map_err(|e| Error::Unauthorized(format!("token rejected: {e}")))?;

    if !data.claims.scope.iter().any(|s| s == REQUIRED_SCOPE) {
        debug!(scopes = ?data.claims.scope, "token lacks required scope");
        return Err(Error::Unauthorized(format!("scope {REQUIRED_SCOPE} required")).into());
    }
    Ok(next.run(request).await)
}

fn bearer_header(request: &Request) -> Result<&str, ApiError> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(Error::Unauthorized("authorization header missing".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    // middleware behavior is covered end-to-end in tests/broker_api.rs; the
    // unit here pins the header parsing helpers

    #[test]
    fn basic_header_roundtrip() {
        let encoded = BASE64.encode("admin:secret");
        let decoded = BASE64.decode(encoded).unwrap();
        let decoded = String::from_utf8(decoded).unwrap();
        let (user, pass) = decoded.split_once(':').unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "secret");
    }

    #[test]
    fn password_may_contain_colons() {
        let decoded = "admin:se:cr:et";
        let (user, pass) = decoded.split_once(':').unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "se:cr:et");
    }
}
