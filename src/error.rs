use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Upstream failure that should make the scheduler retry with a different
/// account. Carries enough context for logging and the exclusion set.
#[derive(Debug, Clone)]
pub struct FailoverError {
    pub account_id: String,
    pub status: u16,
    pub reason: String,
}

impl std::fmt::Display for FailoverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "upstream failure on account {} (status {}): {}",
            self.account_id, self.status, self.reason
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Account not found")]
    AccountNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("API key not found")]
    ApiKeyNotFound,

    #[error("API key rate limited: {0}")]
    ApiKeyRateLimited(String),

    #[error("Group not allowed for this user")]
    GroupNotAllowed,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Subscription expired")]
    SubscriptionExpired,

    #[error("Subscription suspended")]
    SubscriptionSuspended,

    #[error("Subscription already exists")]
    SubscriptionAlreadyExists,

    #[error("Subscription invalid")]
    SubscriptionInvalid,

    #[error("Daily usage limit exceeded")]
    DailyLimitExceeded,

    #[error("Weekly usage limit exceeded")]
    WeeklyLimitExceeded,

    #[error("Monthly usage limit exceeded")]
    MonthlyLimitExceeded,

    #[error("Redeem code not found")]
    RedeemCodeNotFound,

    #[error("Redeem code already used")]
    RedeemCodeUsed,

    #[error("Redeem code is locked by another request")]
    RedeemCodeLocked,

    #[error("Too many redeem attempts")]
    RedeemCodeRateLimited,

    #[error("Mixed channel selection warning")]
    MixedChannelWarning,

    #[error("No available accounts{}", .model.as_ref().map(|m| format!(" for model {m}")).unwrap_or_default())]
    NoAvailableAccounts { model: Option<String> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream error already mapped to a client-facing kind + message.
    #[error("{message}")]
    Upstream {
        status: u16,
        kind: &'static str,
        message: String,
    },

    /// Sentinel: the pipeline retries with a different account.
    #[error("{0}")]
    Failover(FailoverError),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl GatewayError {
    /// Stable machine-readable identifier for this error.
    pub fn kind(&self) -> &'static str {
        use GatewayError::*;
        match self {
            InvalidApiKey => "INVALID_API_KEY",
            AccountNotFound => "ACCOUNT_NOT_FOUND",
            UserNotFound => "USER_NOT_FOUND",
            ApiKeyNotFound => "API_KEY_NOT_FOUND",
            ApiKeyRateLimited(_) => "API_KEY_RATE_LIMITED",
            GroupNotAllowed => "GROUP_NOT_ALLOWED",
            InsufficientBalance => "INSUFFICIENT_BALANCE",
            SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            SubscriptionSuspended => "SUBSCRIPTION_SUSPENDED",
            SubscriptionAlreadyExists => "SUBSCRIPTION_ALREADY_EXISTS",
            SubscriptionInvalid => "SUBSCRIPTION_INVALID",
            DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            WeeklyLimitExceeded => "WEEKLY_LIMIT_EXCEEDED",
            MonthlyLimitExceeded => "MONTHLY_LIMIT_EXCEEDED",
            RedeemCodeNotFound => "REDEEM_CODE_NOT_FOUND",
            RedeemCodeUsed => "REDEEM_CODE_USED",
            RedeemCodeLocked => "REDEEM_CODE_LOCKED",
            RedeemCodeRateLimited => "REDEEM_CODE_RATE_LIMITED",
            MixedChannelWarning => "MIXED_CHANNEL_WARNING",
            NoAvailableAccounts { .. } => "NO_AVAILABLE_ACCOUNTS",
            InvalidRequest(_) => "INVALID_REQUEST",
            Upstream { .. } => "UPSTREAM_ERROR",
            Failover(_) => "FAILOVER",
            Timeout(_) => "TIMEOUT",
            OAuth(_) => "OAUTH_ERROR",
            Network(_) => "NETWORK_ERROR",
            Parse(_) => "PARSE_ERROR",
            Database(_) => "DATABASE_ERROR",
        }
    }

    /// Client-visible envelope: `{"type":"error","error":{"type":..,"message":..}}`.
    pub fn to_client_response(&self) -> Response {
        use GatewayError::*;
        let (status, error_type, message) = match self {
            InvalidApiKey | ApiKeyNotFound | UserNotFound => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            GroupNotAllowed
            | InsufficientBalance
            | SubscriptionExpired
            | SubscriptionSuspended
            | SubscriptionInvalid
            | DailyLimitExceeded
            | WeeklyLimitExceeded
            | MonthlyLimitExceeded => (
                StatusCode::FORBIDDEN,
                "permission_error",
                self.to_string(),
            ),
            ApiKeyRateLimited(_) | RedeemCodeRateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                self.to_string(),
            ),
            AccountNotFound | RedeemCodeNotFound => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                self.to_string(),
            ),
            NoAvailableAccounts { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                self.to_string(),
            ),
            InvalidRequest(_) | SubscriptionAlreadyExists | MixedChannelWarning
            | RedeemCodeUsed | RedeemCodeLocked => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                self.to_string(),
            ),
            Upstream {
                status,
                kind,
                message,
            } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                *kind,
                message.clone(),
            ),
            Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                self.to_string(),
            ),
            Failover(_) | Network(_) | Parse(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                self.to_string(),
            ),
            OAuth(_) | Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                self.to_string(),
            ),
        };

        (
            status,
            Json(json!({
                "type": "error",
                "error": {
                    "type": error_type,
                    "message": message
                }
            })),
        )
            .into_response()
    }

    pub fn is_failover(&self) -> bool {
        matches!(self, GatewayError::Failover(_))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_client_response()
    }
}

/// Map an upstream HTTP status (and optional Google `error.status`) to the
/// client-facing error kind + HTTP status. Messages stay generic so upstream
/// body fragments never leak to clients.
pub fn map_upstream_error(status: u16, google_status: Option<&str>) -> (u16, &'static str, &'static str) {
    if let Some(gs) = google_status {
        match gs {
            "INVALID_ARGUMENT" | "FAILED_PRECONDITION" => {
                return (400, "invalid_request_error", "Upstream rejected the request");
            }
            "UNAUTHENTICATED" => return (401, "authentication_error", "Upstream authentication failed"),
            "PERMISSION_DENIED" => return (403, "permission_error", "Upstream denied access"),
            "NOT_FOUND" => return (404, "not_found_error", "Upstream resource not found"),
            "RESOURCE_EXHAUSTED" => return (429, "rate_limit_error", "Upstream rate limit exceeded"),
            "UNAVAILABLE" => return (503, "overloaded_error", "Upstream is overloaded"),
            "DEADLINE_EXCEEDED" => return (504, "timeout_error", "Upstream timed out"),
            "INTERNAL" => return (502, "api_error", "Upstream internal error"),
            _ => {}
        }
    }
    match status {
        400 => (400, "invalid_request_error", "Upstream rejected the request"),
        401 => (401, "authentication_error", "Upstream authentication failed"),
        403 => (403, "permission_error", "Upstream denied access"),
        404 => (404, "not_found_error", "Upstream resource not found"),
        429 => (429, "rate_limit_error", "Upstream rate limit exceeded"),
        503 | 529 => (503, "overloaded_error", "Upstream is overloaded"),
        504 => (504, "timeout_error", "Upstream timed out"),
        _ => (502, "upstream_error", "Upstream request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(GatewayError::InsufficientBalance.kind(), "INSUFFICIENT_BALANCE");
        assert_eq!(GatewayError::RedeemCodeUsed.kind(), "REDEEM_CODE_USED");
        assert_eq!(
            GatewayError::NoAvailableAccounts { model: None }.kind(),
            "NO_AVAILABLE_ACCOUNTS"
        );
    }

    #[test]
    fn no_accounts_message_names_model() {
        let err = GatewayError::NoAvailableAccounts {
            model: Some("gemini-2.5-pro".into()),
        };
        assert_eq!(err.to_string(), "No available accounts for model gemini-2.5-pro");
    }

    #[test]
    fn google_status_overrides_http_status() {
        let (status, kind, _) = map_upstream_error(400, Some("RESOURCE_EXHAUSTED"));
        assert_eq!(status, 429);
        assert_eq!(kind, "rate_limit_error");
    }

    #[test]
    fn overloaded_maps_to_503() {
        let (status, kind, _) = map_upstream_error(529, None);
        assert_eq!(status, 503);
        assert_eq!(kind, "overloaded_error");
    }
}
