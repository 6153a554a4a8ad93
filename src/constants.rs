/// Anthropic API URL for messages endpoint (with beta features)
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages?beta=true";

/// Anthropic API URL for token counting (with beta features)
pub const ANTHROPIC_COUNT_TOKENS_URL: &str =
    "https://api.anthropic.com/v1/messages/count_tokens?beta=true";

/// Anthropic OAuth token endpoint (refresh_token grant)
pub const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// OAuth client id used by Anthropic OAuth / setup-token accounts
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// OAuth beta features header value
pub const OAUTH_BETA_HEADER: &str = "claude-code-20250219,oauth-2025-04-20";

/// OpenAI API base for api-key accounts without an explicit base_url
pub const OPENAI_API_BASE: &str = "https://api.openai.com";

/// OpenAI OAuth token endpoint
pub const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";

/// Google OAuth token endpoint (Gemini + Antigravity)
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Gemini Code Assist API base (OAuth code_assist accounts)
pub const CODE_ASSIST_API_BASE: &str = "https://cloudcode-pa.googleapis.com";

/// Gemini AI Studio / API-key base
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Cloud Resource Manager project listing (project-id auto-detection)
pub const CLOUD_RESOURCE_MANAGER_URL: &str =
    "https://cloudresourcemanager.googleapis.com/v1/projects";

/// Drive `about` endpoint used for Google-One tier inference
pub const DRIVE_ABOUT_URL: &str = "https://www.googleapis.com/drive/v3/about?fields=storageQuota";

/// Response header carrying the unified rate-limit reset (unix seconds)
pub const RATELIMIT_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

/// Response header carrying the 5h-window status (allowed | allowed_warning | rejected)
pub const RATELIMIT_5H_STATUS_HEADER: &str = "anthropic-ratelimit-unified-5h-status";

/// Rolling session window length (seconds)
pub const SESSION_WINDOW_SECS: i64 = 5 * 60 * 60;

/// Upstream error bodies are inspected up to this many bytes
pub const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// User agent sent on upstream requests
pub const USER_AGENT: &str = concat!("llm-gateway/", env!("CARGO_PKG_VERSION"));

/// Seed models for initial database population, used only while the models
/// table is empty.
/// Format: (id, input_price, output_price, cache_read_price, cache_write_price) — all $/MTok
pub static SEED_MODELS: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus-4-5", 5.0, 25.0, 0.50, 6.25),
    ("claude-sonnet-4-5", 3.0, 15.0, 0.30, 3.75),
    ("claude-haiku-4-5", 1.0, 5.0, 0.10, 1.25),
    ("claude-3-5-sonnet", 3.0, 15.0, 0.30, 3.75),
    ("gpt-4o", 2.5, 10.0, 1.25, 0.0),
    ("gpt-4o-mini", 0.15, 0.6, 0.075, 0.0),
    ("gemini-2.5-pro", 1.25, 10.0, 0.31, 0.0),
    ("gemini-2.5-flash", 0.30, 2.5, 0.075, 0.0),
];
