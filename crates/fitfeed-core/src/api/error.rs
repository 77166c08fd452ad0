use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Message fragments the API uses for authentication failures that do not
/// carry an `UNAUTHENTICATED` extension code.
const UNAUTHENTICATED_MARKERS: [&str; 2] = ["Unauthorized", "Invalid token"];

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Classify a GraphQL error entry. Authentication failures become
    /// `Unauthorized`, everything else is passed through as `GraphQl`.
    pub fn from_graphql(message: &str, code: Option<&str>) -> Self {
        if is_unauthenticated(message, code) {
            ApiError::Unauthorized
        } else {
            ApiError::GraphQl(Self::truncate_body(message))
        }
    }

    /// True when the server rejected the request's credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

fn is_unauthenticated(message: &str, code: Option<&str>) -> bool {
    code == Some("UNAUTHENTICATED") || UNAUTHENTICATED_MARKERS.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status() {
        assert!(ApiError::from_status(StatusCode::UNAUTHORIZED, "").is_unauthorized());
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "nope"),
            ApiError::AccessDenied(ref b) if b == "nope"
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
            ApiError::from_status(StatusCode::IM_A_TEAPOT, ""),
            ApiError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("truncated, 520 total bytes"));

        // Never split a multi-byte character
        let accents = "é".repeat(MAX_ERROR_BODY_LENGTH);
        assert!(ApiError::truncate_body(&accents).contains("truncated"));
    }

    #[test]
    fn test_from_graphql_classification() {
        assert!(ApiError::from_graphql("anything", Some("UNAUTHENTICATED")).is_unauthorized());
        assert!(ApiError::from_graphql("Unauthorized", None).is_unauthorized());
        assert!(ApiError::from_graphql("JWT error: Invalid token signature", None).is_unauthorized());
        assert!(!ApiError::from_graphql("Workout not found", Some("NOT_FOUND")).is_unauthorized());
        assert!(matches!(
            ApiError::from_graphql("Username already exists", None),
            ApiError::GraphQl(ref m) if m == "Username already exists"
        ));
    }
}
