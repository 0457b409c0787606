//! Runtime configuration for the Overlord.
//!
//! Resolution order: **env var > `~/.overlord/config` file > hardcoded default**.
//!
//! ```text
//! Field                  Env Var                   Config Key              Default
//! ────────────────────── ───────────────────────── ─────────────────────── ────────
//! max_concurrent         MAX_CONCURRENT            max_concurrent          3
//! timeout_minutes        TIMEOUT_MINUTES           timeout_minutes         30
//! health_port            HEALTH_PORT               health_port             8090
//! watched_repos          WATCHED_REPOS             watched_repos           (empty)
//! default_repo           DEFAULT_REPO              default_repo            (none)
//! cron_enabled           CRON_ENABLED              cron_enabled            true
//! cron_schedule          CRON_SCHEDULE             cron_schedule           "0 2 * * *"
//! state_db               STATE_DB                  —                       <dir>/state.db
//! stub_mode              STUB_MODE                 —                       false
//! heartbeat_timeout      HEARTBEAT_TIMEOUT_SECS    heartbeat_timeout       300s
//! watchdog_interval      WATCHDOG_INTERVAL_SECS    watchdog_interval       60s
//! cleanup_interval       CLEANUP_INTERVAL_SECS     cleanup_interval        300s
//! question_ttl           QUESTION_TTL_SECS         question_ttl            86400s
//! minion_image           MINION_IMAGE              minion_image            ghcr.io/overlord/minion:latest
//! labels                 READY_LABEL etc.          ready_label etc.        see below
//! ```
//!
//! The config snapshot is immutable for the process lifetime. `validate()`
//! reports every problem at once; any problem is fatal at start.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::Result;

use crate::error::ConfigError;
use crate::sched::normalize_cron;

/// Default Docker image for minion containers.
pub const DEFAULT_MINION_IMAGE: &str = "ghcr.io/overlord/minion:latest";

/// Default sweep schedule: 02:00 daily.
pub const DEFAULT_CRON_SCHEDULE: &str = "0 2 * * *";

/// Issue-queue label names. The four states an issue moves through from
/// the Overlord's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLabels {
    /// Marks an issue ready for dispatch.
    pub ready: String,
    /// A minion is working on the issue.
    pub in_progress: String,
    /// A PR exists and awaits human review.
    pub in_review: String,
    /// The minion failed; a human should look.
    pub needs_attention: String,
}

impl Default for QueueLabels {
    fn default() -> Self {
        Self {
            ready: "minion-ready".to_string(),
            in_progress: "in-progress".to_string(),
            in_review: "in-review".to_string(),
            needs_attention: "needs-attention".to_string(),
        }
    }
}

/// Immutable configuration snapshot for one Overlord process.
#[derive(Debug, Clone)]
pub struct OverlordConfig {
    /// Base directory for overlord state (`~/.overlord` by default, `OVERLORD_DIR`).
    pub overlord_dir: PathBuf,
    /// Concurrency cap: maximum simultaneously active minions (`MAX_CONCURRENT`).
    pub max_concurrent: usize,
    /// Advisory wall-clock limit passed to minions; the watchdog enforces
    /// liveness via heartbeats, not this (`TIMEOUT_MINUTES`).
    pub timeout_minutes: u64,
    /// TCP port for the reporter endpoint (`HEALTH_PORT`).
    pub health_port: u16,
    /// Host part of the callback URL injected into minions (`CALLBACK_HOST`).
    pub callback_host: String,
    /// Repositories the queue scanner watches, `owner/repo` (`WATCHED_REPOS`).
    pub watched_repos: Vec<String>,
    /// Default repository for chat commands like `work on #42` (`DEFAULT_REPO`).
    pub default_repo: Option<String>,
    /// Whether the cron sweep runs at all (`CRON_ENABLED`).
    pub cron_enabled: bool,
    /// Five-field cron expression for sweeps (`CRON_SCHEDULE`).
    pub cron_schedule: String,
    /// Path of the SQLite state file (`STATE_DB`).
    pub state_db: PathBuf,
    /// Skip real container-runtime calls; use the in-memory stub (`STUB_MODE`).
    pub stub_mode: bool,
    /// A minion silent for longer than this is considered stuck (`HEARTBEAT_TIMEOUT_SECS`).
    pub heartbeat_timeout: Duration,
    /// Watchdog tick interval (`WATCHDOG_INTERVAL_SECS`).
    pub watchdog_interval: Duration,
    /// Dead-container cleanup interval (`CLEANUP_INTERVAL_SECS`).
    pub cleanup_interval: Duration,
    /// Pending questions older than this are swept (`QUESTION_TTL_SECS`).
    pub question_ttl: Duration,
    /// Docker image for minion containers (`MINION_IMAGE`).
    pub minion_image: String,
    /// Issue label names (`READY_LABEL`, `IN_PROGRESS_LABEL`, `IN_REVIEW_LABEL`,
    /// `NEEDS_ATTENTION_LABEL`).
    pub labels: QueueLabels,
    /// GitHub API token; required when `watched_repos` is non-empty (`GITHUB_TOKEN`).
    pub github_token: Option<String>,
    /// Base URL of the LLM endpoint warmed before sweeps (`LLM_BASE_URL`).
    pub llm_base_url: Option<String>,
    /// Model name used for the warm-up request (`LLM_MODEL`).
    pub llm_model: String,
    /// Anthropic key forwarded into minion containers (`ANTHROPIC_API_KEY`).
    pub anthropic_api_key: Option<String>,
    /// Shared bearer token guarding the ingestion routes (`REPORT_TOKEN`).
    pub report_token: Option<String>,
    /// Chat bot token; chat is disabled unless token and channel are both set
    /// (`CHAT_BOT_TOKEN`).
    pub chat_bot_token: Option<String>,
    /// Chat channel the Overlord listens in and posts to (`CHAT_CHANNEL`).
    pub chat_channel: Option<String>,
    /// Send immediate notifications (`URGENT_NOTIFICATIONS`).
    pub urgent_notifications: bool,
    /// Accumulate and send periodic digests (`DIGEST_NOTIFICATIONS`).
    pub digest_notifications: bool,
}

impl OverlordConfig {
    /// Load config from env vars, `<dir>/config` file, and hardcoded defaults.
    ///
    /// Resolution order: env var > config file > default.
    pub fn load(overlord_dir: &Path) -> Result<Self> {
        Self::load_with_env(overlord_dir, |k| env::var(k).ok())
    }

    /// Same as [`load`](Self::load) with an injectable env lookup, so tests
    /// never touch the process environment.
    pub fn load_with_env(
        overlord_dir: &Path,
        get_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut cfg = Self::defaults(overlord_dir);

        let config_file = overlord_dir.join("config");
        if config_file.exists() {
            parse_config_file(&config_file, |key, value| {
                cfg.apply_file_entry(key, value);
            })?;
        }

        cfg.apply_env_overrides(get_env);

        Ok(cfg)
    }

    fn defaults(overlord_dir: &Path) -> Self {
        Self {
            overlord_dir: overlord_dir.to_path_buf(),
            max_concurrent: 3,
            timeout_minutes: 30,
            health_port: 8090,
            callback_host: "overlord".to_string(),
            watched_repos: Vec::new(),
            default_repo: None,
            cron_enabled: true,
            cron_schedule: DEFAULT_CRON_SCHEDULE.to_string(),
            state_db: overlord_dir.join("state.db"),
            stub_mode: false,
            heartbeat_timeout: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            question_ttl: Duration::from_secs(86_400),
            minion_image: DEFAULT_MINION_IMAGE.to_string(),
            labels: QueueLabels::default(),
            github_token: None,
            llm_base_url: None,
            llm_model: "default".to_string(),
            anthropic_api_key: None,
            report_token: None,
            chat_bot_token: None,
            chat_channel: None,
            urgent_notifications: true,
            digest_notifications: true,
        }
    }

    fn apply_file_entry(&mut self, key: &str, value: &str) {
        match key {
            "max_concurrent" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.max_concurrent = n;
                }
            }
            "timeout_minutes" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.timeout_minutes = n;
                }
            }
            "health_port" => {
                if let Ok(n) = value.parse::<u16>() {
                    self.health_port = n;
                }
            }
            "callback_host" => self.callback_host = value.to_string(),
            "watched_repos" => self.watched_repos = split_repos(value),
            "default_repo" => self.default_repo = non_empty(value),
            "cron_enabled" => self.cron_enabled = value == "true",
            "cron_schedule" => self.cron_schedule = value.to_string(),
            "heartbeat_timeout" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.heartbeat_timeout = Duration::from_secs(n);
                }
            }
            "watchdog_interval" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.watchdog_interval = Duration::from_secs(n);
                }
            }
            "cleanup_interval" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.cleanup_interval = Duration::from_secs(n);
                }
            }
            "question_ttl" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.question_ttl = Duration::from_secs(n);
                }
            }
            "minion_image" => self.minion_image = value.to_string(),
            "ready_label" => self.labels.ready = value.to_string(),
            "in_progress_label" => self.labels.in_progress = value.to_string(),
            "in_review_label" => self.labels.in_review = value.to_string(),
            "needs_attention_label" => self.labels.needs_attention = value.to_string(),
            "llm_base_url" => self.llm_base_url = non_empty(value),
            "llm_model" => self.llm_model = value.to_string(),
            "urgent_notifications" => self.urgent_notifications = value != "false",
            "digest_notifications" => self.digest_notifications = value != "false",
            _ => {}
        }
    }

    fn apply_env_overrides(&mut self, get_env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get_env("MAX_CONCURRENT") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_concurrent = n;
            }
        }
        if let Some(v) = get_env("TIMEOUT_MINUTES") {
            if let Ok(n) = v.parse::<u64>() {
                self.timeout_minutes = n;
            }
        }
        if let Some(v) = get_env("HEALTH_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.health_port = n;
            }
        }
        if let Some(v) = get_env("CALLBACK_HOST") {
            self.callback_host = v;
        }
        if let Some(v) = get_env("WATCHED_REPOS") {
            self.watched_repos = split_repos(&v);
        }
        if let Some(v) = get_env("DEFAULT_REPO") {
            self.default_repo = non_empty(&v);
        }
        if let Some(v) = get_env("CRON_ENABLED") {
            self.cron_enabled = v == "true";
        }
        if let Some(v) = get_env("CRON_SCHEDULE") {
            if !v.trim().is_empty() {
                self.cron_schedule = v;
            }
        }
        if let Some(v) = get_env("STATE_DB") {
            if !v.is_empty() {
                self.state_db = PathBuf::from(v);
            }
        }
        if let Some(v) = get_env("STUB_MODE") {
            self.stub_mode = v == "true";
        }
        if let Some(v) = get_env("HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.heartbeat_timeout = Duration::from_secs(n);
            }
        }
        if let Some(v) = get_env("WATCHDOG_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.watchdog_interval = Duration::from_secs(n);
            }
        }
        if let Some(v) = get_env("CLEANUP_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.cleanup_interval = Duration::from_secs(n);
            }
        }
        if let Some(v) = get_env("QUESTION_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.question_ttl = Duration::from_secs(n);
            }
        }
        if let Some(v) = get_env("MINION_IMAGE") {
            self.minion_image = v;
        }
        if let Some(v) = get_env("READY_LABEL") {
            self.labels.ready = v;
        }
        if let Some(v) = get_env("IN_PROGRESS_LABEL") {
            self.labels.in_progress = v;
        }
        if let Some(v) = get_env("IN_REVIEW_LABEL") {
            self.labels.in_review = v;
        }
        if let Some(v) = get_env("NEEDS_ATTENTION_LABEL") {
            self.labels.needs_attention = v;
        }
        if let Some(v) = get_env("GITHUB_TOKEN") {
            self.github_token = non_empty(&v);
        }
        if let Some(v) = get_env("LLM_BASE_URL") {
            self.llm_base_url = non_empty(&v);
        }
        if let Some(v) = get_env("LLM_MODEL") {
            if !v.is_empty() {
                self.llm_model = v;
            }
        }
        if let Some(v) = get_env("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = non_empty(&v);
        }
        if let Some(v) = get_env("REPORT_TOKEN") {
            self.report_token = non_empty(&v);
        }
        if let Some(v) = get_env("CHAT_BOT_TOKEN") {
            self.chat_bot_token = non_empty(&v);
        }
        if let Some(v) = get_env("CHAT_CHANNEL") {
            self.chat_channel = non_empty(&v);
        }
        if let Some(v) = get_env("URGENT_NOTIFICATIONS") {
            self.urgent_notifications = v != "false";
        }
        if let Some(v) = get_env("DIGEST_NOTIFICATIONS") {
            self.digest_notifications = v != "false";
        }
    }

    /// Callback URL injected into minion containers.
    pub fn callback_url(&self) -> String {
        format!(
            "http://{}:{}/minion/report",
            self.callback_host, self.health_port
        )
    }

    /// Validate the snapshot. Every problem is collected; any problem is
    /// fatal at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.max_concurrent == 0 {
            problems.push("MAX_CONCURRENT must be greater than zero".to_string());
        }
        if self.health_port == 0 {
            problems.push("HEALTH_PORT must be a non-zero TCP port".to_string());
        }
        if self.heartbeat_timeout.is_zero() {
            problems.push("HEARTBEAT_TIMEOUT_SECS must be greater than zero".to_string());
        }
        if self.watchdog_interval.is_zero() {
            problems.push("WATCHDOG_INTERVAL_SECS must be greater than zero".to_string());
        }
        for repo in &self.watched_repos {
            if !is_repo_slug(repo) {
                problems.push(format!("WATCHED_REPOS entry `{repo}` is not owner/repo"));
            }
        }
        if let Some(repo) = &self.default_repo {
            if !is_repo_slug(repo) {
                problems.push(format!("DEFAULT_REPO `{repo}` is not owner/repo"));
            }
        }
        if !self.watched_repos.is_empty() && self.github_token.is_none() {
            problems.push("WATCHED_REPOS is set but GITHUB_TOKEN is missing".to_string());
        }
        if self.cron_enabled {
            if let Err(e) = normalize_cron(&self.cron_schedule) {
                problems.push(format!(
                    "CRON_SCHEDULE `{}` is invalid: {e}",
                    self.cron_schedule
                ));
            }
        }
        if self.chat_bot_token.is_some() != self.chat_channel.is_some() {
            problems.push(
                "CHAT_BOT_TOKEN and CHAT_CHANNEL must be set together or not at all".to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}

fn split_repos(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_repo_slug(s: &str) -> bool {
    match s.split_once('/') {
        Some((owner, name)) => !owner.is_empty() && !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

/// Parse a `key=value` config file, calling `f` for each entry.
///
/// Lines starting with `#` and empty lines are skipped.
fn parse_config_file(path: &Path, mut f: impl FnMut(&str, &str)) -> Result<()> {
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            f(k.trim(), v.trim());
        }
    }
    Ok(())
}
