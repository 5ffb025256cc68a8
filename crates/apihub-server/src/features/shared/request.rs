//! Caller identity and path parameter parsing

use apihub_common::error::ApiError;
use apihub_common::types::ApiType;
use axum::http::HeaderMap;

/// Header carrying the id of the acting user
pub const USER_HEADER: &str = "x-user-id";

/// Recorded when a request carries no user header
pub const ANONYMOUS_USER: &str = "anonymous";

/// Acting user of a request
pub fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// `rest` or `graphql` from a path segment
pub fn parse_api_type(raw: &str) -> Result<ApiType, ApiError> {
    raw.parse().map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_user_from_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), ANONYMOUS_USER);

        headers.insert(USER_HEADER, HeaderValue::from_static("  alice "));
        assert_eq!(user_id(&headers), "alice");

        headers.insert(USER_HEADER, HeaderValue::from_static(""));
        assert_eq!(user_id(&headers), ANONYMOUS_USER);
    }

    #[test]
    fn test_api_type_segment() {
        assert_eq!(parse_api_type("graphql").unwrap(), ApiType::Graphql);
        let err = parse_api_type("soap").unwrap_err();
        assert_eq!(err.code, "InvalidValue");
    }
}
