use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};
use shared::config::server::Config;

/// Per-request facts shared with handlers through request extensions.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    /// Set by the auth middleware from the trusted identity header.
    pub user_id: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub struct RequestIdState {
    header: HeaderName,
}

impl RequestIdState {
    pub fn from_config(config: &Config) -> Self {
        let header = HeaderName::from_str(&config.server.request_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-request-id"));
        Self { header }
    }
}

pub async fn assign_request_id(
    State(state): State<RequestIdState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let request_id = extract_request_id(request.headers(), &state.header)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let value = HeaderValue::from_str(&request_id)
        .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?;

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        user_id: None,
    });
    request.headers_mut().insert(state.header.clone(), value.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(state.header, value);
    Ok(response)
}

fn extract_request_id(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_request_ids_are_ignored() {
        let header = HeaderName::from_static("x-request-id");
        let mut headers = HeaderMap::new();
        assert_eq!(extract_request_id(&headers, &header), None);

        headers.insert(header.clone(), HeaderValue::from_static("   "));
        assert_eq!(extract_request_id(&headers, &header), None);

        headers.insert(header.clone(), HeaderValue::from_static(" req-7 "));
        assert_eq!(extract_request_id(&headers, &header), Some("req-7".into()));
    }

    #[test]
    fn invalid_configured_header_falls_back() {
        let mut config = Config::default();
        config.server.request_id_header = "not a header".into();
        assert_eq!(
            RequestIdState::from_config(&config).header.as_str(),
            "x-request-id"
        );
    }
}
