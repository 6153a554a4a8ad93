use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

/// Token refresh driver settings.
#[derive(Debug, Clone)]
pub struct TokenRefreshConfig {
    pub enabled: bool,
    pub check_interval_minutes: u64,
    pub refresh_before_expiry_hours: u64,
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_minutes: 15,
            refresh_before_expiry_hours: 1,
            max_retries: 3,
            retry_backoff_seconds: 2,
        }
    }
}

/// Rate-limit engine settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Cooldown applied on upstream 529 responses.
    pub overload_cooldown_minutes: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            overload_cooldown_minutes: 10,
        }
    }
}

/// Scheduler + concurrency broker settings.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    pub slot_cleanup_interval_secs: u64,
    pub slot_ttl_secs: u64,
    pub acquire_timeout_secs: u64,
    /// Alternate accounts tried after a failover-worthy upstream error.
    pub max_failover_attempts: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            slot_cleanup_interval_secs: 60,
            slot_ttl_secs: 600,
            acquire_timeout_secs: 30,
            max_failover_attempts: 3,
        }
    }
}

/// Google OAuth client settings used by Gemini / Antigravity refreshers.
#[derive(Debug, Clone)]
pub struct GeminiOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub scopes: String,
}

impl Default for GeminiOAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scopes: "https://www.googleapis.com/auth/cloud-platform".to_string(),
        }
    }
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub redis_url: Option<String>,
    pub token_refresh: TokenRefreshConfig,
    pub rate_limit: RateLimitConfig,
    pub scheduling: SchedulingConfig,
    pub gemini_oauth: GeminiOAuthConfig,
    pub ops_enabled: bool,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("LLM_GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("LLM_GATEWAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = env::var("LLM_GATEWAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("llm-gateway")
            });

        let redis_url = env::var("LLM_GATEWAY_REDIS_URL").ok().filter(|s| !s.is_empty());

        let token_refresh = TokenRefreshConfig {
            enabled: env_bool("LLM_GATEWAY_TOKEN_REFRESH_ENABLED", true),
            check_interval_minutes: env_u64("LLM_GATEWAY_TOKEN_REFRESH_INTERVAL_MINUTES", 15),
            refresh_before_expiry_hours: env_u64("LLM_GATEWAY_REFRESH_BEFORE_EXPIRY_HOURS", 1),
            max_retries: env_u64("LLM_GATEWAY_TOKEN_REFRESH_MAX_RETRIES", 3) as u32,
            retry_backoff_seconds: env_u64("LLM_GATEWAY_TOKEN_REFRESH_BACKOFF_SECONDS", 2),
        };

        let rate_limit = RateLimitConfig {
            overload_cooldown_minutes: env_u64("LLM_GATEWAY_OVERLOAD_COOLDOWN_MINUTES", 10) as i64,
        };

        let scheduling = SchedulingConfig {
            slot_cleanup_interval_secs: env_u64("LLM_GATEWAY_SLOT_CLEANUP_INTERVAL_SECS", 60),
            slot_ttl_secs: env_u64("LLM_GATEWAY_SLOT_TTL_SECS", 600),
            acquire_timeout_secs: env_u64("LLM_GATEWAY_ACQUIRE_TIMEOUT_SECS", 30),
            max_failover_attempts: env_u64("LLM_GATEWAY_MAX_FAILOVER_ATTEMPTS", 3) as usize,
        };

        let gemini_oauth = GeminiOAuthConfig {
            client_id: env::var("LLM_GATEWAY_GEMINI_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("LLM_GATEWAY_GEMINI_CLIENT_SECRET").unwrap_or_default(),
            scopes: env::var("LLM_GATEWAY_GEMINI_SCOPES").unwrap_or_else(|_| {
                "https://www.googleapis.com/auth/cloud-platform".to_string()
            }),
        };

        Self {
            host,
            port,
            data_dir,
            redis_url,
            token_refresh,
            rate_limit,
            scheduling,
            gemini_oauth,
            ops_enabled: env_bool("LLM_GATEWAY_OPS_ENABLED", false),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gateway.db")
    }
}
