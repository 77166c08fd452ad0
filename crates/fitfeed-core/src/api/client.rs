//! API client for communicating with the fitfeed GraphQL API.
//!
//! This module provides the `ApiClient` struct for sending queries and
//! mutations, and the `AuthApi` trait implemented on top of it for the
//! session manager.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::AuthSignal;
use crate::models::{AuthPayload, LoginInput, SignupInput, User};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Endpoint used when neither config nor environment names one
pub const DEFAULT_GRAPHQL_URL: &str = "http://localhost:8080/graphql";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_MUTATION: &str = "mutation Login($input: LoginInput!) { \
    login(input: $input) { accessToken refreshToken username userId } }";

const SIGNUP_MUTATION: &str = "mutation Signup($input: SignupInput!) { \
    signup(input: $input) { accessToken refreshToken username userId } }";

const REFRESH_TOKEN_MUTATION: &str = "mutation RefreshToken($refreshToken: String!) { \
    refreshToken(refreshToken: $refreshToken) { accessToken refreshToken username userId } }";

const LOGOUT_MUTATION: &str = "mutation Logout($refreshToken: String!) { \
    logout(refreshToken: $refreshToken) }";

const ME_QUERY: &str = "query Me { me { id username email displayName avatarUrl status } }";

/// The part of the remote API the session manager needs.
///
/// None of these calls raise the `AuthSignal`: the session manager decides
/// for itself what an authentication failure on these means.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, input: &LoginInput) -> Result<AuthPayload, ApiError>;

    async fn signup(&self, input: &SignupInput) -> Result<AuthPayload, ApiError>;

    /// Exchange a refresh token for a new token pair
    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthPayload, ApiError>;

    /// Invalidate a refresh token server-side
    async fn logout(&self, refresh_token: &str) -> Result<bool, ApiError>;

    /// Fetch the identity the access token belongs to
    async fn me(&self, access_token: &str) -> Result<User, ApiError>;
}

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: Option<GraphQlErrorExtensions>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorExtensions {
    code: Option<String>,
}

impl GraphQlError {
    fn to_api_error(&self) -> ApiError {
        let code = self.extensions.as_ref().and_then(|e| e.code.as_deref());
        ApiError::from_graphql(&self.message, code)
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    login: AuthPayload,
}

#[derive(Debug, Deserialize)]
struct SignupData {
    signup: AuthPayload,
}

#[derive(Debug, Deserialize)]
struct RefreshTokenData {
    #[serde(rename = "refreshToken")]
    refresh_token: AuthPayload,
}

#[derive(Debug, Deserialize)]
struct LogoutData {
    logout: bool,
}

#[derive(Debug, Deserialize)]
struct MeData {
    me: User,
}

/// API client for fitfeed.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    endpoint: String,
    auth_signal: Option<AuthSignal>,
}

impl ApiClient {
    /// Create a new API client for the given GraphQL endpoint
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_signal: None,
        })
    }

    /// Create a client that reports unauthenticated responses to a session,
    /// sharing the connection pool.
    pub fn with_auth_signal(&self, signal: AuthSignal) -> Self {
        Self {
            client: self.client.clone(), // Cheap clone, shares connection pool
            endpoint: self.endpoint.clone(),
            auth_signal: Some(signal),
        }
    }

    /// Run a query or mutation for the rest of the application.
    ///
    /// When the request carried a token and the server rejects it as
    /// unauthenticated, the session's `AuthSignal` is raised before the
    /// error is returned.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let result = self.send(query, variables, token).await;
        if let Err(ref e) = result {
            self.report_rejection(e, token);
        }
        result
    }

    /// Raise the `AuthSignal` if `error` rejected the credentials a request
    /// carried. Returns whether the session was signalled.
    fn report_rejection(&self, error: &ApiError, token: Option<&str>) -> bool {
        match (error, token, &self.auth_signal) {
            (ApiError::Unauthorized, Some(token), Some(signal)) => {
                debug!("Request rejected as unauthenticated, signalling session");
                signal.raise_rejected(token);
                true
            }
            _ => false,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let body = GraphQlRequest { query, variables };
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header(header::ACCEPT, "application/json")
                .json(&body);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(ApiError::from_status(status, &text));
            }
            return Self::parse_response(&text);
        }
    }

    /// Decode a GraphQL response body. Errors take precedence over data, and
    /// an authentication failure anywhere in the error list wins.
    fn parse_response<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
        let parsed: GraphQlResponse = serde_json::from_str(text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse GraphQL response: {}", e))
        })?;

        if !parsed.errors.is_empty() {
            let errors: Vec<ApiError> = parsed.errors.iter().map(GraphQlError::to_api_error).collect();
            if errors.iter().any(ApiError::is_unauthorized) {
                return Err(ApiError::Unauthorized);
            }
            let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(ApiError::GraphQl(messages.join("; ")));
        }

        let data = parsed
            .data
            .ok_or_else(|| ApiError::InvalidResponse("GraphQL response has no data".to_string()))?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::InvalidResponse(format!("Unexpected GraphQL data: {}", e)))
    }
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, input: &LoginInput) -> Result<AuthPayload, ApiError> {
        let data: LoginData = self.send(LOGIN_MUTATION, json!({ "input": input }), None).await?;
        Ok(data.login)
    }

    async fn signup(&self, input: &SignupInput) -> Result<AuthPayload, ApiError> {
        let data: SignupData = self.send(SIGNUP_MUTATION, json!({ "input": input }), None).await?;
        Ok(data.signup)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthPayload, ApiError> {
        let data: RefreshTokenData = self
            .send(REFRESH_TOKEN_MUTATION, json!({ "refreshToken": refresh_token }), None)
            .await?;
        Ok(data.refresh_token)
    }

    async fn logout(&self, refresh_token: &str) -> Result<bool, ApiError> {
        let data: LogoutData = self
            .send(LOGOUT_MUTATION, json!({ "refreshToken": refresh_token }), None)
            .await?;
        Ok(data.logout)
    }

    async fn me(&self, access_token: &str) -> Result<User, ApiError> {
        let data: MeData = self.send(ME_QUERY, json!({}), Some(access_token)).await?;
        Ok(data.me)
    }
}
