use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::debounce::{self, AlertTrigger, DebounceConfig};
use crate::dispatch::{self, RetryPolicy, DEFAULT_MAP_LINK_BASE};
use crate::error::PipelineError;
use crate::frame::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};
use crate::geo::{DEFAULT_IP_LOOKUP_URL, DEFAULT_STALENESS_CEILING};
use crate::pipeline::{
    PipelineSettings, DEFAULT_GEO_DEADLINE, DEFAULT_JOB_CAPACITY, DEFAULT_WORKERS,
};
use crate::recognize::{
    AdapterConfig, DEFAULT_MAX_TEXT_LEN, DEFAULT_MIN_CONFIDENCE, DEFAULT_MIN_TEXT_LEN,
};
use crate::transport::{TelegramConfig, DEFAULT_TELEGRAM_API_BASE};
use crate::DetectionKind;

const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_DEVICE_MAX_FIX_AGE_MS: u64 = 30_000;
const DEFAULT_IP_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_TELEGRAM_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// -------------------- File schema --------------------

#[derive(Debug, Deserialize, Default)]
struct GuardConfigFile {
    recognition: Option<RecognitionConfigFile>,
    debounce: Option<DebounceConfigFile>,
    trigger: Option<TriggerConfigFile>,
    geolocation: Option<GeolocationConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    telegram: Option<TelegramConfigFile>,
    map: Option<MapConfigFile>,
    ledger: Option<LedgerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    min_confidence: Option<f32>,
    min_text_len: Option<usize>,
    max_text_len: Option<usize>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DebounceConfigFile {
    cooldown_ms: Option<u64>,
    inactivity_timeout_ms: Option<u64>,
    rearm_interval_ms: Option<u64>,
    realert_threshold: Option<u64>,
    min_occurrences: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TriggerConfigFile {
    kinds: Option<Vec<String>>,
    watchlist: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct GeolocationConfigFile {
    device_timeout_ms: Option<u64>,
    device_max_fix_age_ms: Option<u64>,
    ip_timeout_ms: Option<u64>,
    deadline_ms: Option<u64>,
    staleness_ceiling_ms: Option<u64>,
    ip_lookup_url: Option<String>,
    ip_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    jitter: Option<f64>,
    workers: Option<usize>,
    job_capacity: Option<usize>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelegramConfigFile {
    api_base: Option<String>,
    bot_token: Option<String>,
    chat_id: Option<String>,
    send_location: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MapConfigFile {
    link_base: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LedgerConfigFile {
    db_path: Option<String>,
}

impl GuardConfigFile {
    /// Checks on raw file values that defaults would otherwise paper over.
    fn check(&self) -> Result<()> {
        let kinds = self
            .trigger
            .as_ref()
            .and_then(|t| t.kinds.as_deref())
            .unwrap_or_default();
        if let Some(unknown) = kinds.iter().find(|k| DetectionKind::parse(k).is_none()) {
            return Err(invalid(format!(
                "trigger.kinds: unknown kind {:?} (expected text or barcode)",
                unknown
            )));
        }
        Ok(())
    }
}

// -------------------- Resolved config --------------------

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub recognition: RecognitionSettings,
    pub debounce: DebounceConfig,
    pub trigger: TriggerSettings,
    pub geolocation: GeolocationSettings,
    pub dispatch: DispatchSettings,
    pub telegram: TelegramSettings,
    /// Prefix for map links; empty disables links.
    pub map_link_base: String,
    /// SQLite ledger path; `None` keeps the ledger in memory.
    pub ledger_db_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub min_confidence: f32,
    pub min_text_len: usize,
    pub max_text_len: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub kinds: Vec<DetectionKind>,
    pub watchlist: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GeolocationSettings {
    pub device_timeout: Duration,
    pub device_max_fix_age: Duration,
    pub ip_timeout: Duration,
    pub deadline: Duration,
    pub staleness_ceiling: Duration,
    pub ip_lookup_url: String,
    pub ip_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    pub workers: usize,
    /// Dispatch jobs that may wait for a free worker.
    pub job_capacity: usize,
    pub shutdown_grace: Duration,
}

#[derive(Clone)]
pub struct TelegramSettings {
    pub api_base: String,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub send_location: bool,
    pub timeout: Duration,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("api_base", &self.api_base)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id)
            .field("send_location", &self.send_location)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        // An empty file schema resolves to the built-in defaults.
        Self::from_file(GuardConfigFile::default())
    }
}

impl GuardConfig {
    /// Load from `$GUARD_CONFIG` (TOML, or JSON for `.json` files), apply `GUARD_*`
    /// environment overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GUARD_CONFIG").ok();
        Self::load_from(
            config_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(Path::new),
        )
    }

    /// Like `load`, with an explicit file path instead of `$GUARD_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GuardConfigFile) -> Self {
        let recognition = file.recognition.unwrap_or_default();
        let recognition = RecognitionSettings {
            min_confidence: recognition.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            min_text_len: recognition.min_text_len.unwrap_or(DEFAULT_MIN_TEXT_LEN),
            max_text_len: recognition.max_text_len.unwrap_or(DEFAULT_MAX_TEXT_LEN),
            queue_capacity: recognition
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
        };

        let deb = file.debounce.unwrap_or_default();
        let debounce = DebounceConfig {
            cooldown: deb
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(debounce::DEFAULT_COOLDOWN),
            inactivity_timeout: deb
                .inactivity_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(debounce::DEFAULT_INACTIVITY_TIMEOUT),
            rearm_interval: deb
                .rearm_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(debounce::DEFAULT_REARM_INTERVAL),
            realert_threshold: deb
                .realert_threshold
                .unwrap_or(debounce::DEFAULT_REALERT_THRESHOLD),
            min_occurrences: deb
                .min_occurrences
                .unwrap_or(debounce::DEFAULT_MIN_OCCURRENCES),
        };

        let trig = file.trigger.unwrap_or_default();
        let trigger = TriggerSettings {
            kinds: trig
                .kinds
                .map(|kinds| kinds.iter().filter_map(|k| DetectionKind::parse(k)).collect())
                .unwrap_or_else(|| vec![DetectionKind::Text, DetectionKind::Barcode]),
            watchlist: trig.watchlist.unwrap_or_default(),
        };

        let geo = file.geolocation.unwrap_or_default();
        let geolocation = GeolocationSettings {
            device_timeout: Duration::from_millis(
                geo.device_timeout_ms.unwrap_or(DEFAULT_DEVICE_TIMEOUT_MS),
            ),
            device_max_fix_age: Duration::from_millis(
                geo.device_max_fix_age_ms
                    .unwrap_or(DEFAULT_DEVICE_MAX_FIX_AGE_MS),
            ),
            ip_timeout: Duration::from_millis(geo.ip_timeout_ms.unwrap_or(DEFAULT_IP_TIMEOUT_MS)),
            deadline: geo
                .deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_GEO_DEADLINE),
            staleness_ceiling: geo
                .staleness_ceiling_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STALENESS_CEILING),
            ip_lookup_url: geo
                .ip_lookup_url
                .unwrap_or_else(|| DEFAULT_IP_LOOKUP_URL.to_string()),
            ip_token: geo.ip_token.filter(|t| !t.trim().is_empty()),
        };

        let disp = file.dispatch.unwrap_or_default();
        let dispatch = DispatchSettings {
            retry: RetryPolicy {
                max_attempts: disp.max_attempts.unwrap_or(dispatch::DEFAULT_MAX_ATTEMPTS),
                base_delay: disp
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(dispatch::DEFAULT_BASE_DELAY),
                max_delay: disp
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(dispatch::DEFAULT_MAX_DELAY),
                jitter: disp.jitter.unwrap_or(0.0),
            },
            workers: disp.workers.unwrap_or(DEFAULT_WORKERS),
            job_capacity: disp.job_capacity.unwrap_or(DEFAULT_JOB_CAPACITY),
            shutdown_grace: Duration::from_millis(
                disp.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
        };

        let tg = file.telegram.unwrap_or_default();
        let telegram = TelegramSettings {
            api_base: tg
                .api_base
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            bot_token: tg.bot_token.filter(|t| !t.trim().is_empty()),
            chat_id: tg.chat_id.filter(|c| !c.trim().is_empty()),
            send_location: tg.send_location.unwrap_or(true),
            timeout: Duration::from_millis(tg.timeout_ms.unwrap_or(DEFAULT_TELEGRAM_TIMEOUT_MS)),
        };

        Self {
            recognition,
            debounce,
            trigger,
            geolocation,
            dispatch,
            telegram,
            map_link_base: file
                .map
                .and_then(|map| map.link_base)
                .unwrap_or_else(|| DEFAULT_MAP_LINK_BASE.to_string()),
            ledger_db_path: file
                .ledger
                .and_then(|ledger| ledger.db_path)
                .filter(|p| !p.trim().is_empty()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("GUARD_TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.bot_token = Some(token.trim().to_string());
            }
        }
        if let Ok(chat_id) = std::env::var("GUARD_TELEGRAM_CHAT_ID") {
            if !chat_id.trim().is_empty() {
                self.telegram.chat_id = Some(chat_id.trim().to_string());
            }
        }
        if let Ok(token) = std::env::var("GUARD_IPINFO_TOKEN") {
            if !token.trim().is_empty() {
                self.geolocation.ip_token = Some(token.trim().to_string());
            }
        }
        if let Ok(path) = std::env::var("GUARD_LEDGER_DB") {
            if !path.trim().is_empty() {
                self.ledger_db_path = Some(path);
            }
        }
        if let Ok(cooldown) = std::env::var("GUARD_COOLDOWN_MS") {
            let ms: u64 = cooldown
                .trim()
                .parse()
                .map_err(|_| anyhow!("GUARD_COOLDOWN_MS must be an integer number of milliseconds"))?;
            self.debounce.cooldown = Duration::from_millis(ms);
        }
        if let Ok(attempts) = std::env::var("GUARD_MAX_ATTEMPTS") {
            self.dispatch.retry.max_attempts = attempts
                .trim()
                .parse()
                .map_err(|_| anyhow!("GUARD_MAX_ATTEMPTS must be a positive integer"))?;
        }
        if let Ok(workers) = std::env::var("GUARD_WORKERS") {
            self.dispatch.workers = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("GUARD_WORKERS must be a positive integer"))?;
        }
        if let Ok(watchlist) = std::env::var("GUARD_WATCHLIST") {
            self.trigger.watchlist = split_csv(&watchlist);
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        let r = &self.recognition;
        if !(0.0..=1.0).contains(&r.min_confidence) {
            return Err(invalid("recognition.min_confidence must be within 0.0..=1.0"));
        }
        if r.max_text_len == 0 {
            return Err(invalid("recognition.max_text_len must be greater than zero"));
        }
        if r.min_text_len > r.max_text_len {
            return Err(invalid(
                "recognition.min_text_len must not exceed recognition.max_text_len",
            ));
        }
        if r.queue_capacity == 0 || r.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(invalid(format!(
                "recognition.queue_capacity must be within 1..={}",
                MAX_QUEUE_CAPACITY
            )));
        }

        if self.debounce.inactivity_timeout.is_zero() {
            return Err(invalid("debounce.inactivity_timeout_ms must be greater than zero"));
        }
        if self.debounce.realert_threshold == 0 {
            return Err(invalid("debounce.realert_threshold must be greater than zero"));
        }
        if self.debounce.min_occurrences == 0 {
            self.debounce.min_occurrences = 1;
        }

        if self.trigger.kinds.is_empty() {
            return Err(invalid("trigger.kinds must name at least one of: text, barcode"));
        }
        self.trigger.kinds.dedup();

        let g = &self.geolocation;
        if g.deadline.is_zero() {
            return Err(invalid("geolocation.deadline_ms must be greater than zero"));
        }
        url::Url::parse(&g.ip_lookup_url)
            .map_err(|e| invalid(format!("geolocation.ip_lookup_url is invalid: {}", e)))?;

        let d = &self.dispatch;
        if d.retry.max_attempts == 0 {
            return Err(invalid("dispatch.max_attempts must be greater than zero"));
        }
        if d.retry.base_delay > d.retry.max_delay {
            return Err(invalid("dispatch.base_delay_ms must not exceed dispatch.max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&d.retry.jitter) {
            return Err(invalid("dispatch.jitter must be within 0.0..=1.0"));
        }
        if d.workers == 0 {
            return Err(invalid("dispatch.workers must be greater than zero"));
        }
        if d.job_capacity == 0 {
            return Err(invalid("dispatch.job_capacity must be greater than zero"));
        }

        url::Url::parse(&self.telegram.api_base)
            .map_err(|e| invalid(format!("telegram.api_base is invalid: {}", e)))?;
        if self.telegram.timeout.is_zero() {
            return Err(invalid("telegram.timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    // -------------------- Component views --------------------

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            min_confidence: self.recognition.min_confidence,
            min_text_len: self.recognition.min_text_len,
            max_text_len: self.recognition.max_text_len,
        }
    }

    pub fn alert_trigger(&self) -> AlertTrigger {
        AlertTrigger::new(self.trigger.kinds.clone(), self.trigger.watchlist.clone())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers: self.dispatch.workers,
            queue_capacity: self.recognition.queue_capacity,
            job_capacity: self.dispatch.job_capacity,
            geo_deadline: self.geolocation.deadline,
        }
    }

    pub fn map_link_base(&self) -> Option<String> {
        Some(self.map_link_base.clone()).filter(|base| !base.trim().is_empty())
    }

    /// Telegram transport settings, when both credentials are present.
    pub fn telegram_config(&self) -> Option<TelegramConfig> {
        let token = self.telegram.bot_token.as_ref()?;
        let chat_id = self.telegram.chat_id.as_ref()?;
        let mut cfg = TelegramConfig::new(token.clone(), chat_id.clone());
        cfg.api_base = self.telegram.api_base.clone();
        cfg.send_location = self.telegram.send_location;
        cfg.timeout = self.telegram.timeout;
        Some(cfg)
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    PipelineError::Config(message.into()).into()
}

fn read_config_file(path: &Path) -> Result<GuardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg: GuardConfigFile = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    cfg.check()?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
