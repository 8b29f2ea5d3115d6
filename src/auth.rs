use crate::{errors::AppError, models::Identity, AppState};
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use std::sync::Arc;

/// The authenticated caller. Rejects the request with 401 when the bearer
/// token is missing or unknown.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

/// The caller if a valid bearer token was sent, otherwise an anonymous request.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<Identity>);

fn bearer_token(parts: &Parts) -> Result<Option<&str>, AppError> {
    let Some(value) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AppError::Unauthorized("Malformed Authorization header".to_string()))?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(Some(token.trim()))
        }
        _ => Err(AppError::Unauthorized("Expected a Bearer token".to_string())),
    }
}

async fn resolve(parts: &Parts, state: &AppState) -> Result<Option<Identity>, AppError> {
    let Some(token) = bearer_token(parts)? else {
        return Ok(None);
    };
    match state.identity.resolve(token).await? {
        Some(identity) => Ok(Some(identity)),
        None => {
            tracing::debug!("Rejected unknown or expired session token");
            Err(AppError::Unauthorized("Invalid or expired session".to_string()))
        }
    }
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        resolve(parts, state)
            .await?
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))
    }
}

impl FromRequestParts<Arc<AppState>> for MaybeAuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthUser(anonymous_on_error(resolve(parts, state).await)))
    }
}

/// Public routes serve a caller whose token cannot be resolved as anonymous.
/// Session store failures are logged at `warn` before falling back.
fn anonymous_on_error(resolved: Result<Option<Identity>, AppError>) -> Option<Identity> {
    match resolved {
        Ok(identity) => identity,
        Err(AppError::Unauthorized(reason)) => {
            tracing::debug!(%reason, "Ignoring unusable credentials on a public route");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed; serving the request anonymously");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RepoError;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token(&parts(None)).unwrap(), None);
        assert_eq!(bearer_token(&parts(Some("Bearer abc"))).unwrap(), Some("abc"));
        assert_eq!(bearer_token(&parts(Some("bearer  abc "))).unwrap(), Some("abc"));
        assert!(matches!(
            bearer_token(&parts(Some("Basic abc"))),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(bearer_token(&parts(Some("Bearer "))), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn public_routes_fall_back_to_anonymous() {
        let alice = Identity {
            user_id: "u-alice".into(),
            username: "alice".into(),
        };
        assert_eq!(anonymous_on_error(Ok(Some(alice.clone()))), Some(alice));
        assert_eq!(anonymous_on_error(Ok(None)), None);
        assert_eq!(anonymous_on_error(Err(AppError::Unauthorized("expired".into()))), None);
        let outage = AppError::RepositoryError(RepoError::BackendError(anyhow::anyhow!("sessions table unreachable")));
        assert_eq!(anonymous_on_error(Err(outage)), None);
    }
}
