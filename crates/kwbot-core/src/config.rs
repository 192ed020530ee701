use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{domain::ChatId, errors::Error, store, Result};

pub const DEFAULT_TARGET_URL: &str = "https://www.nodeseek.com/?sortBy=postTime";
const MAX_BACKOFF_FACTOR: f64 = 10.0;
/// Upper bound for any configured interval.
const INTERVAL_CEILING_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// What happens to a matched post whose notification could not be delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Keep it in the seen ledger; the loss is logged and reported only.
    #[default]
    MarkSeen,
    /// Forget it so the next cycle matches (and tries to deliver) it again.
    RetryNextCycle,
}

impl DeliveryPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mark_seen" | "drop" => Some(Self::MarkSeen),
            "retry_next_cycle" | "retry" => Some(Self::RetryNextCycle),
            _ => None,
        }
    }
}

/// Typed configuration, loaded once at startup.
///
/// Keywords are deliberately absent: they are runtime state owned by the store.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bot_token: String,
    pub chat_id: ChatId,

    // Target site
    pub target_url: String,
    pub warmup_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub warmup_settle_min: Duration,
    pub warmup_settle_max: Duration,

    // Poll cadence / backoff
    pub base_interval: Duration,
    pub jitter_range: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub reset_after_successes: u32,

    // Extraction / dedup
    pub max_posts: usize,
    pub seen_capacity: usize,

    // Delivery
    pub notify_attempts: u32,
    pub notify_retry_delay: Duration,
    pub delivery_policy: DeliveryPolicy,

    pub state_path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct FileSections {
    #[serde(default)]
    telegram: TelegramSection,
    #[serde(default)]
    monitor: MonitorSection,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramSection {
    #[serde(default)]
    bot_token: Option<String>,
    /// Older files store this as a string.
    #[serde(default)]
    chat_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitorSection {
    target_url: Option<String>,
    warmup_url: Option<String>,
    user_agent: Option<String>,
    request_timeout_secs: Option<u64>,
    warmup_settle_min_ms: Option<u64>,
    warmup_settle_max_ms: Option<u64>,
    base_interval_secs: Option<u64>,
    jitter_secs: Option<u64>,
    backoff_factor: Option<f64>,
    max_interval_secs: Option<u64>,
    reset_after_successes: Option<u32>,
    max_posts: Option<usize>,
    seen_capacity: Option<usize>,
    notify_attempts: Option<u32>,
    notify_retry_delay_ms: Option<u64>,
    delivery_policy: Option<DeliveryPolicy>,
}

impl Config {
    /// Load from the state file at `path`, with `KWBOT_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let doc = store::read_document(path)?;
        Self::from_document(&doc, path, env_str)
    }

    /// Build a config from an already-read document. `lookup` resolves environment overrides.
    pub fn from_document(
        doc: &Value,
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let sections: FileSections = serde_json::from_value(doc.clone())
            .map_err(|e| Error::Config(format!("malformed config sections: {e}")))?;
        let tg = sections.telegram;
        let m = sections.monitor;

        let env_u64 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        // Required
        let bot_token = lookup("KWBOT_BOT_TOKEN")
            .and_then(non_empty)
            .or_else(|| tg.bot_token.and_then(non_empty))
            .ok_or_else(|| {
                Error::Config("telegram.bot_token (or KWBOT_BOT_TOKEN) is required".to_string())
            })?;

        let chat_raw = lookup("KWBOT_CHAT_ID")
            .and_then(non_empty)
            .or_else(|| tg.chat_id.as_ref().and_then(value_to_string))
            .ok_or_else(|| {
                Error::Config("telegram.chat_id (or KWBOT_CHAT_ID) is required".to_string())
            })?;
        let chat_id = chat_raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id != 0)
            .map(ChatId)
            .ok_or_else(|| Error::Config(format!("invalid chat_id: {chat_raw}")))?;

        // Target site
        let target_url = lookup("KWBOT_TARGET_URL")
            .and_then(non_empty)
            .or(m.target_url)
            .unwrap_or_else(|| DEFAULT_TARGET_URL.to_string());
        let target = parse_http_url(&target_url)?;

        let warmup_url = match lookup("KWBOT_WARMUP_URL")
            .and_then(non_empty)
            .or(m.warmup_url)
        {
            Some(u) => {
                parse_http_url(&u)?;
                u
            }
            None => format!("{}/", target.origin().ascii_serialization()),
        };

        let user_agent = lookup("KWBOT_USER_AGENT")
            .and_then(non_empty)
            .or(m.user_agent)
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let request_timeout = Duration::from_secs(
            env_u64("KWBOT_REQUEST_TIMEOUT_SECS")
                .or(m.request_timeout_secs)
                .unwrap_or(30)
                .max(1),
        );
        let warmup_settle_min = Duration::from_millis(m.warmup_settle_min_ms.unwrap_or(2_000));
        let warmup_settle_max =
            Duration::from_millis(m.warmup_settle_max_ms.unwrap_or(4_000)).max(warmup_settle_min);

        // Cadence
        let base_interval = Duration::from_secs(
            env_u64("KWBOT_BASE_INTERVAL_SECS")
                .or(m.base_interval_secs)
                .unwrap_or(30)
                .clamp(1, INTERVAL_CEILING_SECS),
        );
        let jitter_range = Duration::from_secs(
            env_u64("KWBOT_JITTER_SECS")
                .or(m.jitter_secs)
                .unwrap_or(10)
                .min(INTERVAL_CEILING_SECS),
        );
        let backoff_factor = m.backoff_factor.unwrap_or(2.0);
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&backoff_factor) {
            return Err(Error::Config(format!(
                "backoff_factor must be between 1.0 and {MAX_BACKOFF_FACTOR}, got {backoff_factor}"
            )));
        }
        let max_interval = Duration::from_secs(
            env_u64("KWBOT_MAX_INTERVAL_SECS")
                .or(m.max_interval_secs)
                .unwrap_or(600)
                .min(INTERVAL_CEILING_SECS),
        )
        .max(base_interval);
        let reset_after_successes = m.reset_after_successes.unwrap_or(3).max(1);

        let max_posts = m.max_posts.unwrap_or(50).max(1);
        // The ledger must at least hold one full page, otherwise posts still on the page get evicted.
        let seen_capacity = m.seen_capacity.unwrap_or(1000).max(max_posts * 2);

        let notify_attempts = m.notify_attempts.unwrap_or(3).max(1);
        let notify_retry_delay = Duration::from_millis(m.notify_retry_delay_ms.unwrap_or(2_000));

        let delivery_policy = match lookup("KWBOT_DELIVERY_POLICY").and_then(non_empty) {
            Some(s) => DeliveryPolicy::parse(&s)
                .ok_or_else(|| Error::Config(format!("unknown delivery policy: {s}")))?,
            None => m.delivery_policy.unwrap_or_default(),
        };

        Ok(Self {
            bot_token,
            chat_id,
            target_url,
            warmup_url,
            user_agent,
            request_timeout,
            warmup_settle_min,
            warmup_settle_max,
            base_interval,
            jitter_range,
            backoff_factor,
            max_interval,
            reset_after_successes,
            max_posts,
            seen_capacity,
            notify_attempts,
            notify_retry_delay,
            delivery_policy,
            state_path: path.to_path_buf(),
        })
    }
}

fn parse_http_url(raw: &str) -> Result<url::Url> {
    let u = url::Url::parse(raw.trim())
        .map_err(|e| Error::Config(format!("invalid url {raw}: {e}")))?;
    if !matches!(u.scheme(), "http" | "https") || u.host_str().is_none() {
        return Err(Error::Config(format!("url must be http(s) with a host: {raw}")));
    }
    Ok(u)
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => non_empty(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bot_token: "x".to_string(),
        chat_id: ChatId(42),
        target_url: "https://forum.example/?sortBy=postTime".to_string(),
        warmup_url: "https://forum.example/".to_string(),
        user_agent: DEFAULT_USER_AGENT.to_string(),
        request_timeout: Duration::from_secs(1),
        warmup_settle_min: Duration::ZERO,
        warmup_settle_max: Duration::ZERO,
        base_interval: Duration::from_secs(30),
        jitter_range: Duration::ZERO,
        backoff_factor: 2.0,
        max_interval: Duration::from_secs(600),
        reset_after_successes: 3,
        max_posts: 50,
        seen_capacity: 1000,
        notify_attempts: 3,
        notify_retry_delay: Duration::ZERO,
        delivery_policy: DeliveryPolicy::MarkSeen,
        state_path: PathBuf::from("/tmp/kwbot-test-state.json"),
    }
}
