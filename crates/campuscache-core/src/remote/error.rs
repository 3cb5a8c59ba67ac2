use serde::Deserialize;
use thiserror::Error;

/// Failure reported by the REST backend.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized - session may be expired")]
    Unauthorized,

    /// Usually a row-level security rejection
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unknown resource: {0}")]
    NotFound(String),

    #[error("Rejected by a constraint: {0}")]
    Conflict(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid request (status {status}): {message}")]
    InvalidRequest { status: u16, message: String },
}

/// Maximum length of a response body quoted in an error
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body returned by PostgREST.
#[derive(Deserialize)]
struct PostgrestError {
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    hint: Option<String>,
}

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = describe_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            status => ApiError::InvalidRequest { status, message },
        }
    }

    /// Worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited | ApiError::ServerError(_))
    }
}

/// Prefer the structured PostgREST message; fall back to the raw body,
/// truncated on a character boundary.
fn describe_body(body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<PostgrestError>(body) {
        let mut message = match err.code {
            Some(code) => format!("{} ({})", err.message, code),
            None => err.message,
        };
        if let Some(hint) = err.hint {
            message.push_str(&format!(", hint: {}", hint));
        }
        return message;
    }

    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            ApiError::ServerError(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, "bad filter"),
            ApiError::InvalidRequest { status: 400, ref message } if message == "bad filter"
        ));
    }

    #[test]
    fn test_postgrest_body_is_decoded() {
        let body = r#"{"message":"new row violates row-level security policy","code":"42501","hint":null}"#;
        let err = ApiError::from_status(StatusCode::FORBIDDEN, body);
        assert_eq!(
            err.to_string(),
            "Access denied: new row violates row-level security policy (42501)"
        );

        let body = r#"{"message":"duplicate key","code":"23505","hint":"use upsert"}"#;
        let err = ApiError::from_status(StatusCode::CONFLICT, body);
        assert!(err.to_string().ends_with("(23505), hint: use upsert"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limits_and_server_errors_are_retried() {
        assert!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(!ApiError::from_status(StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!ApiError::from_status(StatusCode::NOT_FOUND, "").is_retryable());
    }

    #[test]
    fn test_long_body_is_truncated_on_char_boundary() {
        let accented = "é".repeat(MAX_ERROR_BODY_LENGTH);
        let message = describe_body(&accented);
        assert!(message.contains(&format!("{} total bytes", accented.len())));

        let plain = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        assert!(describe_body(&plain).starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
    }
}
