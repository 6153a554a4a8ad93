//! Rate-limit engine: interprets one upstream call's outcome and writes the
//! account's limited / overloaded / temp-unschedulable state, plus the Gemini
//! RPD/RPM quota precheck.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, TimeZone, Timelike, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::constants::{ERROR_BODY_LIMIT, SESSION_WINDOW_SECS};
use crate::error::GatewayError;
use crate::redis::RedisStore;
use crate::store::{
    Account, AccountStore, AccountType, Credentials, Platform, UsageLogStore, now_millis, now_secs,
};
use crate::store::subscriptions::start_of_local_day;

/// Outcome of one upstream call, as seen by the engine. The forwarder
/// extracts the relevant headers and caps the body at 64 KiB.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOutcome {
    pub status: u16,
    /// `anthropic-ratelimit-unified-reset` (unix seconds), when present.
    pub unified_reset: Option<i64>,
    /// `anthropic-ratelimit-unified-5h-status`, when present.
    pub window_status: Option<String>,
    pub body: String,
}

/// What the engine decided about the account.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitAction {
    /// Filtered out or unrecognized status; nothing recorded.
    Skip,
    Disabled,
    RateLimited { reset_at: i64 },
    Overloaded { until: i64 },
    TempUnschedulable { until: i64 },
}

/// Per-account temp-unschedulable rule, configured in `extra`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TempUnschedRule {
    pub error_code: u16,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub duration_minutes: i64,
}

/// Rules from `extra.temp_unschedulable_rules`.
pub fn parse_rules(extra: &Credentials) -> Vec<TempUnschedRule> {
    extra
        .get_value("temp_unschedulable_rules")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// API-key accounts may restrict which upstream error codes the engine acts
/// on (`extra.handled_error_codes`). None means all codes are handled.
pub fn parse_handled_codes(extra: &Credentials) -> Option<Vec<u16>> {
    extra
        .get_value("handled_error_codes")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Match the first rule whose status matches and whose keyword appears
/// (case-insensitive) in the first 64 KiB of the body.
pub fn match_rule<'a>(
    rules: &'a [TempUnschedRule],
    status: u16,
    body: &str,
) -> Option<(usize, &'a TempUnschedRule, String)> {
    let mut cap = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(cap) {
        cap -= 1;
    }
    let lower = body[..cap].to_lowercase();
    for (idx, rule) in rules.iter().enumerate() {
        if rule.error_code != status {
            continue;
        }
        for keyword in &rule.keywords {
            if !keyword.is_empty() && lower.contains(&keyword.to_lowercase()) {
                return Some((idx, rule, keyword.clone()));
            }
        }
    }
    None
}

/// Next midnight in PST (fixed UTC−8), unix seconds.
pub fn next_pst_midnight(now: i64) -> i64 {
    let pst = FixedOffset::west_opt(8 * 3600).unwrap();
    let local: DateTime<FixedOffset> = pst.timestamp_opt(now, 0).single().unwrap_or_else(|| {
        pst.timestamp_opt(0, 0).single().unwrap()
    });
    let next_day = local.date_naive().succ_opt().unwrap_or(local.date_naive());
    next_day
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| pst.from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp())
        .unwrap_or(now + 24 * 3600)
}

/// Extract a Gemini 429 retry delay from the response body:
/// `error.details[].metadata.quotaResetDelay` ("12.345s"), a
/// "Please retry in Xs" phrase, or a daily-quota message (PST midnight).
pub fn gemini_reset_from_body(body: &str, now: i64) -> Option<i64> {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    if let Some(details) = parsed
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.as_array())
    {
        for detail in details {
            if let Some(delay) = detail
                .get("metadata")
                .and_then(|m| m.get("quotaResetDelay"))
                .and_then(|d| d.as_str())
                .and_then(parse_duration_secs)
            {
                return Some(now + delay);
            }
        }
    }

    if let Some(pos) = body.find("Please retry in ") {
        let rest = &body[pos + "Please retry in ".len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if let Ok(secs) = rest[..end].parse::<f64>() {
            return Some(now + secs.ceil() as i64);
        }
    }

    let lower = body.to_lowercase();
    if lower.contains("per day") || lower.contains("daily") {
        return Some(next_pst_midnight(now));
    }

    None
}

/// "12.345s" → whole seconds, rounded up.
fn parse_duration_secs(s: &str) -> Option<i64> {
    let trimmed = s.strip_suffix('s')?;
    trimmed.parse::<f64>().ok().map(|v| v.ceil() as i64)
}

/// Tier RPD/RPM limits for the Gemini quota precheck.
pub fn tier_limits(tier: &str) -> (i64, i64) {
    match tier {
        "google_ai_ultra" => (5000, 120),
        "google_ai_pro" | "standard-tier" => (2000, 120),
        "legacy-tier" => (1500, 120),
        _ => (1000, 60), // free-tier and unknown
    }
}

/// Tier-specific cooldown for Code-Assist 429s without a reset header.
fn code_assist_cooldown_secs(tier: &str) -> i64 {
    match tier {
        "free-tier" | "" => 30 * 60,
        _ => 5 * 60,
    }
}

pub struct RateLimitEngine {
    accounts: AccountStore,
    redis: RedisStore,
    overload_cooldown_minutes: i64,
}

impl RateLimitEngine {
    pub fn new(accounts: AccountStore, redis: RedisStore, overload_cooldown_minutes: i64) -> Self {
        Self {
            accounts,
            redis,
            overload_cooldown_minutes,
        }
    }

    /// Apply the engine's rules to a failed upstream call and persist the
    /// resulting account state.
    pub async fn handle_upstream_error(
        &self,
        account: &Account,
        outcome: &UpstreamOutcome,
    ) -> Result<RateLimitAction, GatewayError> {
        let now = now_secs();

        // 1. Per-account error-code filter (api-key accounts only).
        if account.account_type == AccountType::ApiKey
            && let Some(handled) = parse_handled_codes(&account.extra)
            && !handled.contains(&outcome.status)
        {
            return Ok(RateLimitAction::Skip);
        }

        // 2. Temp-unschedulable rule match.
        let rules = parse_rules(&account.extra);
        if let Some((rule_index, rule, keyword)) = match_rule(&rules, outcome.status, &outcome.body)
        {
            let until = now + rule.duration_minutes * 60;
            let message: String = outcome.body.chars().take(512).collect();
            let reason = json!({
                "triggered_at": now,
                "status_code": outcome.status,
                "matched_keyword": keyword,
                "rule_index": rule_index,
                "error_message": message,
            })
            .to_string();
            self.accounts
                .mark_temp_unschedulable(&account.id, until, &reason)
                .await?;
            self.redis
                .mirror_temp_unsched(&account.id, &reason, until - now)
                .await;
            info!(
                account_id = %account.id,
                until,
                keyword = %keyword,
                "account temp-unschedulable by rule match"
            );
            return Ok(RateLimitAction::TempUnschedulable { until });
        }

        // 3. Status code mapping.
        match outcome.status {
            401 => {
                self.accounts.disable(&account.id, "Authentication failed").await?;
                Ok(RateLimitAction::Disabled)
            }
            402 => {
                self.accounts.disable(&account.id, "Payment required").await?;
                Ok(RateLimitAction::Disabled)
            }
            403 => {
                self.accounts.disable(&account.id, "Access forbidden").await?;
                Ok(RateLimitAction::Disabled)
            }
            429 => self.handle_429(account, outcome, now).await,
            529 => {
                let until = now + self.overload_cooldown_minutes * 60;
                // A prior rate_limit_reset_at is left in place; both states
                // must elapse before the account schedules again.
                self.accounts.mark_overloaded(&account.id, until).await?;
                warn!(account_id = %account.id, until, "account overloaded (529)");
                Ok(RateLimitAction::Overloaded { until })
            }
            _ => Ok(RateLimitAction::Skip),
        }
    }

    async fn handle_429(
        &self,
        account: &Account,
        outcome: &UpstreamOutcome,
        now: i64,
    ) -> Result<RateLimitAction, GatewayError> {
        // The unified reset header is authoritative; the 5h window ending at
        // the reset is recorded as rejected.
        if let Some(reset_at) = outcome.unified_reset {
            self.accounts
                .mark_rate_limited(&account.id, reset_at, reset_at - SESSION_WINDOW_SECS, "rejected")
                .await?;
            warn!(account_id = %account.id, reset_at, "rate limited until unified reset");
            return Ok(RateLimitAction::RateLimited { reset_at });
        }

        let reset_at = match account.platform {
            Platform::Gemini | Platform::Antigravity => {
                if let Some(at) = gemini_reset_from_body(&outcome.body, now) {
                    at
                } else {
                    let oauth_type = account.gemini_oauth_type();
                    match oauth_type.as_str() {
                        "ai_studio" | "google_one" => next_pst_midnight(now),
                        _ => {
                            let tier = account.credentials.get_string("tier_id");
                            now + code_assist_cooldown_secs(&tier)
                        }
                    }
                }
            }
            _ => now + 5 * 60,
        };

        self.accounts
            .mark_rate_limited(&account.id, reset_at, reset_at - SESSION_WINDOW_SECS, "rejected")
            .await?;
        warn!(account_id = %account.id, reset_at, "rate limited (fallback cooldown)");
        Ok(RateLimitAction::RateLimited { reset_at })
    }

    /// Success path: advance the 5h session window from the response header.
    pub async fn handle_success(
        &self,
        account: &Account,
        outcome: &UpstreamOutcome,
    ) -> Result<(), GatewayError> {
        let Some(status) = outcome.window_status.as_deref() else {
            return Ok(());
        };
        if status != "allowed" && status != "allowed_warning" {
            return Ok(());
        }

        let now = now_secs();
        let window_open = account.session_window_end.is_some_and(|end| end > now);
        if !window_open {
            let hour_start = Utc
                .timestamp_opt(now, 0)
                .single()
                .map(|dt| dt.with_minute(0).unwrap().with_second(0).unwrap().timestamp())
                .unwrap_or(now - now.rem_euclid(3600));
            self.accounts
                .set_session_window(&account.id, hour_start, hour_start + SESSION_WINDOW_SECS, status)
                .await?;
        }

        if status == "allowed" {
            self.accounts.clear_rate_limit(&account.id).await?;
            self.redis.clear_temp_unsched(&account.id).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Quota precheck (Gemini)
// ---------------------------------------------------------------------------

/// Local heuristic comparing an account's current-day / current-minute
/// request counts against its tier RPD/RPM. Never persisted: an exhausted
/// account is skipped for this selection round only.
pub struct QuotaPrecheck {
    usage: UsageLogStore,
    /// account_id:day_start -> (read_at, day_count, minute_count)
    cache: Mutex<HashMap<String, (Instant, i64, i64)>>,
}

const QUOTA_CACHE_TTL: Duration = Duration::from_secs(60);

impl QuotaPrecheck {
    pub fn new(usage: UsageLogStore) -> Self {
        Self {
            usage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// True when the account may be scheduled.
    pub async fn allows(&self, account: &Account) -> bool {
        if account.platform != Platform::Gemini && account.platform != Platform::Antigravity {
            return true;
        }

        let tier = account.credentials.get_string("tier_id");
        let (rpd, rpm) = tier_limits(&tier);

        let now = now_secs();
        let day_start = start_of_local_day(now);
        let key = format!("{}:{day_start}", account.id);

        {
            let cache = self.cache.lock().await;
            if let Some((read_at, day, minute)) = cache.get(&key)
                && read_at.elapsed() < QUOTA_CACHE_TTL
            {
                return *day < rpd && *minute < rpm;
            }
        }

        let now_ms = now_millis();
        let day = match self
            .usage
            .count_requests(&account.id, day_start * 1000, now_ms + 1)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!("quota precheck day query failed: {e}");
                return true;
            }
        };
        let minute = match self
            .usage
            .count_requests(&account.id, now_ms - 60_000, now_ms + 1)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!("quota precheck minute query failed: {e}");
                return true;
            }
        };

        let mut cache = self.cache.lock().await;
        cache.retain(|_, (read_at, _, _)| read_at.elapsed() < QUOTA_CACHE_TTL);
        cache.insert(key, (Instant::now(), day, minute));

        day < rpd && minute < rpm
    }
}
