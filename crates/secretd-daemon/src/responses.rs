//! Response and request plumbing for the HTTP surface.

use std::collections::HashMap;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use secretd_core::error::{Error, ErrorBody};
use secretd_core::operation::Range;
use serde::de::DeserializeOwned;

/// Wrapper carrying a core error onto the wire as
/// `{"error": {"status": ..., "message": ...}}` with the matching HTTP
/// status, plus a `Retry-After` header for rate-limit rejections.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(ErrorBody::from(&self.0))).into_response();
        if let Error::RateLimited { retry_after } = self.0 {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// Parses a JSON request body, mapping failures to a 400.
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::BadRequest(format!("failed to parse body - {e}")))
}

/// Parses the `from`/`to` query parameters into a half-open range.
pub fn parse_range(query: &HashMap<String, String>) -> Result<Range, Error> {
    let default = Range::default();
    Ok(Range {
        from: parse_bound(query, "from", default.from)?,
        to: parse_bound(query, "to", default.to)?,
    })
}

fn parse_bound(query: &HashMap<String, String>, name: &str, default: u32) -> Result<u32, Error> {
    match query.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::BadRequest(format!("failed to parse '{name}' - {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_defaults_and_parses() {
        let empty = HashMap::new();
        assert_eq!(parse_range(&empty).unwrap(), Range { from: 0, to: 10 });

        let mut query = HashMap::new();
        query.insert("from".to_string(), "2".to_string());
        query.insert("to".to_string(), "7".to_string());
        assert_eq!(parse_range(&query).unwrap(), Range { from: 2, to: 7 });
    }

    #[test]
    fn non_numeric_bound_is_bad_request() {
        let mut query = HashMap::new();
        query.insert("from".to_string(), "many".to_string());
        let err = parse_range(&query).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)), "{err:?}");
        assert!(err.to_string().contains("'from'"));
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = ApiError(Error::RateLimited { retry_after: 60 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from(60u64)
        );
    }
}
