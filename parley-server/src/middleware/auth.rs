use std::str::FromStr;

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderName, request::Parts},
    middleware::Next,
    response::Response,
};
use shared::config::server::Config;
use tracing::debug;
use uuid::Uuid;

use crate::{
    http::error::ApiError,
    middleware::request_context::RequestContext,
};

/// Name of the header a trusted upstream fills with the verified user id.
#[derive(Clone, Debug)]
pub struct AuthState {
    header: HeaderName,
}

impl AuthState {
    pub fn from_config(config: &Config) -> Self {
        let header = HeaderName::from_str(&config.auth.user_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-user-id"));
        Self { header }
    }
}

/// Attach the caller's user id to the request context; reject requests
/// without a usable one.
pub async fn require_user(
    State(state): State<AuthState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = user_id_from(req.headers(), &state.header)
        .ok_or_else(|| ApiError::unauthorized("missing or invalid user identity"))?;

    match req.extensions_mut().get_mut::<RequestContext>() {
        Some(context) => context.user_id = Some(user_id),
        None => {
            req.extensions_mut().insert(RequestContext {
                request_id: String::new(),
                user_id: Some(user_id),
            });
        }
    }

    debug!(user_id = %user_id, path = req.uri().path(), "authenticated request");
    Ok(next.run(req).await)
}

fn user_id_from(headers: &HeaderMap, header: &HeaderName) -> Option<Uuid> {
    headers
        .get(header)?
        .to_str()
        .ok()
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

/// The authenticated caller, as established by [`require_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .and_then(|context| context.user_id)
            .map(AuthUser)
            .ok_or_else(|| ApiError::unauthorized("missing user identity"))
    }
}
