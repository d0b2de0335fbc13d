//! Configuration parsing and management.
//!
//! A single TOML document configures the engine and the daemon that hosts
//! it. Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [priority]
//! multiplier = "1.2"
//! window_min_secs = 5
//! window_max_secs = 10
//! compliance_failure_mode = "fail_open"
//!
//! [bidding]
//! grace_ms = 1500
//! rate_limit_max_bids = 5
//! rate_limit_window_secs = 60
//!
//! [lease]
//! duration_days = 90
//! grace_days = 7
//!
//! [daemon]
//! listen_addr = "127.0.0.1:8400"
//! ```

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::Multiplier;

/// Longest configurable duration, roughly one hundred years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 86_400;

/// Converts seconds to a calendar duration, clamped to [`MAX_DURATION_SECS`].
fn chrono_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(0))
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaxConfig {
    /// Priority resolution settings.
    #[serde(default)]
    pub priority: PriorityConfig,

    /// Bid evaluation settings.
    #[serde(default)]
    pub bidding: BiddingConfig,

    /// Tie-break oracle settings.
    #[serde(default)]
    pub tie_break: TieBreakConfig,

    /// Bounty matching settings.
    #[serde(default)]
    pub bounty: BountyConfig,

    /// Lease lifecycle settings.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Daemon host settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl PaxConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, contains unknown keys, or
    /// fails [`PaxConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.priority;
        if p.window_min_secs == 0 || p.window_min_secs > p.window_max_secs {
            return Err(ConfigError::Validation(format!(
                "priority window bounds must satisfy 0 < min <= max, got [{}, {}]",
                p.window_min_secs, p.window_max_secs
            )));
        }
        if p.cache_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "priority.cache_ttl_secs must be greater than zero".to_string(),
            ));
        }
        let b = &self.bidding;
        if b.rate_limit_max_bids == 0 || b.rate_limit_window_secs == 0 {
            return Err(ConfigError::Validation(
                "bidding rate limit ceiling and window must be greater than zero".to_string(),
            ));
        }
        let long_durations = [
            ("priority.cache_ttl_secs", p.cache_ttl_secs),
            ("bidding.grace_ms", b.grace_ms / 1_000),
            ("bidding.rate_limit_window_secs", b.rate_limit_window_secs),
            ("tie_break.ledger_retention_secs", self.tie_break.ledger_retention_secs),
            ("lease.duration_days", u64::from(self.lease.duration_days) * 86_400),
            ("lease.grace_days", u64::from(self.lease.grace_days) * 86_400),
        ];
        if let Some((field, _)) = long_durations
            .iter()
            .find(|(_, secs)| *secs > MAX_DURATION_SECS)
        {
            return Err(ConfigError::Validation(format!(
                "{field} exceeds the maximum duration of {MAX_DURATION_SECS} seconds"
            )));
        }
        let t = &self.tie_break;
        if t.poll_interval_ms == 0 || t.watcher_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "tie_break poll intervals must be greater than zero".to_string(),
            ));
        }
        if t.ledger_retention_secs < t.watcher_timeout_secs {
            return Err(ConfigError::Validation(
                "tie_break.ledger_retention_secs must cover watcher_timeout_secs".to_string(),
            ));
        }
        if self.bounty.stacking_cap_multiple <= Decimal::ZERO {
            return Err(ConfigError::Validation(format!(
                "bounty.stacking_cap_multiple must be positive, got {}",
                self.bounty.stacking_cap_multiple
            )));
        }
        let l = &self.lease;
        if l.duration_days == 0 || l.grace_days == 0 || l.reauction_duration_hours == 0 {
            return Err(ConfigError::Validation(
                "lease duration, grace and re-auction duration must be greater than zero"
                    .to_string(),
            ));
        }
        if l.reauction_reserve_price < Decimal::ZERO {
            return Err(ConfigError::Validation(
                "lease.reauction_reserve_price must not be negative".to_string(),
            ));
        }
        let d = &self.daemon;
        if d.sweep_interval_secs == 0 || d.digest_flush_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon timer intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the priority resolver treats a compliance gate that cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceFailureMode {
    /// Grant priority anyway and log a warning.
    #[default]
    FailOpen,
    /// Strip priority perks and log a warning.
    FailClosed,
}

/// Priority resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorityConfig {
    /// Bid multiplier granted to the confirmed holder.
    #[serde(default = "default_multiplier")]
    pub multiplier: Multiplier,

    /// Lower bound of the per-round priority window.
    #[serde(default = "default_window_min_secs")]
    pub window_min_secs: u32,

    /// Upper bound of the per-round priority window.
    #[serde(default = "default_window_max_secs")]
    pub window_max_secs: u32,

    /// TTL for cached slot ownership lookups.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Behaviour when the compliance gate errors or times out.
    #[serde(default)]
    pub compliance_failure_mode: ComplianceFailureMode,

    /// Deadline for a single compliance gate call.
    #[serde(default = "default_compliance_timeout_ms")]
    pub compliance_timeout_ms: u64,
}

impl PriorityConfig {
    /// Returns the compliance gate deadline.
    #[must_use]
    pub const fn compliance_timeout(&self) -> Duration {
        Duration::from_millis(self.compliance_timeout_ms)
    }

    /// Returns the slot cache TTL.
    #[must_use]
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono_seconds(self.cache_ttl_secs)
    }
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            window_min_secs: default_window_min_secs(),
            window_max_secs: default_window_max_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            compliance_failure_mode: ComplianceFailureMode::default(),
            compliance_timeout_ms: default_compliance_timeout_ms(),
        }
    }
}

const fn default_multiplier() -> Multiplier {
    Multiplier::DEFAULT_PRIORITY
}

const fn default_window_min_secs() -> u32 {
    5
}

const fn default_window_max_secs() -> u32 {
    10
}

const fn default_cache_ttl_secs() -> u64 {
    30
}

const fn default_compliance_timeout_ms() -> u64 {
    2_000
}

/// Bid evaluator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BiddingConfig {
    /// Clock-skew allowance added after the priority window closes.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Accepted bids allowed per actor per rolling window.
    #[serde(default = "default_rate_limit_max_bids")]
    pub rate_limit_max_bids: u32,

    /// Rolling window length for the per-actor rate limit.
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl BiddingConfig {
    /// Returns the post-window grace allowance.
    #[must_use]
    pub fn grace(&self) -> chrono::Duration {
        chrono_seconds(self.grace_ms / 1_000)
            + chrono::Duration::milliseconds(i64::try_from(self.grace_ms % 1_000).unwrap_or(0))
    }

    /// Returns the rate limit window.
    #[must_use]
    pub fn rate_limit_window(&self) -> chrono::Duration {
        chrono_seconds(self.rate_limit_window_secs)
    }
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            rate_limit_max_bids: default_rate_limit_max_bids(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

const fn default_grace_ms() -> u64 {
    1_500
}

const fn default_rate_limit_max_bids() -> u32 {
    5
}

const fn default_rate_limit_window_secs() -> u64 {
    60
}

/// Tie-break coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TieBreakConfig {
    /// Deadline for a blocking wait on the randomness oracle.
    #[serde(default = "default_await_timeout_ms")]
    pub await_timeout_ms: u64,

    /// Poll interval during a blocking wait.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for the detached background watcher.
    #[serde(default = "default_watcher_timeout_secs")]
    pub watcher_timeout_secs: u64,

    /// Poll interval of the detached background watcher.
    #[serde(default = "default_watcher_poll_interval_ms")]
    pub watcher_poll_interval_ms: u64,

    /// How long a tie-break record stays in the audit ledger.
    #[serde(default = "default_ledger_retention_secs")]
    pub ledger_retention_secs: u64,
}

impl TieBreakConfig {
    /// Returns the blocking-wait deadline.
    #[must_use]
    pub const fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    /// Returns the blocking-wait poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the watcher deadline.
    #[must_use]
    pub const fn watcher_timeout(&self) -> Duration {
        Duration::from_secs(self.watcher_timeout_secs)
    }

    /// Returns the watcher poll interval.
    #[must_use]
    pub const fn watcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_interval_ms)
    }

    /// Returns the audit ledger retention.
    #[must_use]
    pub fn ledger_retention(&self) -> chrono::Duration {
        chrono_seconds(self.ledger_retention_secs)
    }
}

impl Default for TieBreakConfig {
    fn default() -> Self {
        Self {
            await_timeout_ms: default_await_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            watcher_timeout_secs: default_watcher_timeout_secs(),
            watcher_poll_interval_ms: default_watcher_poll_interval_ms(),
            ledger_retention_secs: default_ledger_retention_secs(),
        }
    }
}

const fn default_await_timeout_ms() -> u64 {
    3_000
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_watcher_timeout_secs() -> u64 {
    90 // three confirmation cycles
}

const fn default_watcher_poll_interval_ms() -> u64 {
    5_000
}

const fn default_ledger_retention_secs() -> u64 {
    86_400
}

/// Bounty matching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BountyConfig {
    /// Maximum combined payout as a multiple of the effective price.
    #[serde(default = "default_stacking_cap_multiple")]
    pub stacking_cap_multiple: Decimal,

    /// Whether a configured criteria oracle is consulted.
    #[serde(default = "default_criteria_oracle_enabled")]
    pub criteria_oracle_enabled: bool,

    /// Deadline for one criteria oracle pass.
    #[serde(default = "default_criteria_oracle_timeout_ms")]
    pub criteria_oracle_timeout_ms: u64,
}

impl BountyConfig {
    /// Returns the criteria oracle deadline.
    #[must_use]
    pub const fn criteria_oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.criteria_oracle_timeout_ms)
    }
}

impl Default for BountyConfig {
    fn default() -> Self {
        Self {
            stacking_cap_multiple: default_stacking_cap_multiple(),
            criteria_oracle_enabled: default_criteria_oracle_enabled(),
            criteria_oracle_timeout_ms: default_criteria_oracle_timeout_ms(),
        }
    }
}

const fn default_stacking_cap_multiple() -> Decimal {
    Decimal::TWO
}

const fn default_criteria_oracle_enabled() -> bool {
    true
}

const fn default_criteria_oracle_timeout_ms() -> u64 {
    2_000
}

/// Lease lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseConfig {
    /// Length of a lease term; renewals extend by this amount.
    #[serde(default = "default_duration_days")]
    pub duration_days: u32,

    /// Grace window after the lease end during which the holder may renew.
    #[serde(default = "default_grace_days")]
    pub grace_days: u32,

    /// Historical bids a previous holder needs to be auto-eligible for the
    /// re-auction.
    #[serde(default = "default_min_historical_bids")]
    pub min_historical_bids: u64,

    /// Maximum re-auctions triggered by one sweep.
    #[serde(default = "default_max_reauctions_per_sweep")]
    pub max_reauctions_per_sweep: usize,

    /// Reserve price of a re-auction round.
    #[serde(default = "default_reauction_reserve_price")]
    pub reauction_reserve_price: Decimal,

    /// Length of a re-auction round.
    #[serde(default = "default_reauction_duration_hours")]
    pub reauction_duration_hours: u32,
}

impl LeaseConfig {
    /// Returns the lease term.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.duration_days))
    }

    /// Returns the grace window.
    #[must_use]
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.grace_days))
    }

    /// Returns the re-auction round length.
    #[must_use]
    pub fn reauction_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.reauction_duration_hours))
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_days: default_duration_days(),
            grace_days: default_grace_days(),
            min_historical_bids: default_min_historical_bids(),
            max_reauctions_per_sweep: default_max_reauctions_per_sweep(),
            reauction_reserve_price: default_reauction_reserve_price(),
            reauction_duration_hours: default_reauction_duration_hours(),
        }
    }
}

const fn default_duration_days() -> u32 {
    90
}

const fn default_grace_days() -> u32 {
    7
}

const fn default_min_historical_bids() -> u64 {
    5
}

const fn default_max_reauctions_per_sweep() -> usize {
    10
}

const fn default_reauction_reserve_price() -> Decimal {
    Decimal::ONE_HUNDRED
}

const fn default_reauction_duration_hours() -> u32 {
    72
}

/// Daemon host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Address the HTTP API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Interval between lease sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Interval between notification digest flushes.
    #[serde(default = "default_digest_flush_interval_secs")]
    pub digest_flush_interval_secs: u64,

    /// Notifications queued per actor per UTC day.
    #[serde(default = "default_notification_daily_cap")]
    pub notification_daily_cap: u32,
}

impl DaemonConfig {
    /// Returns the lease sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Returns the digest flush interval.
    #[must_use]
    pub const fn digest_flush_interval(&self) -> Duration {
        Duration::from_secs(self.digest_flush_interval_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sweep_interval_secs: default_sweep_interval_secs(),
            digest_flush_interval_secs: default_digest_flush_interval_secs(),
            notification_daily_cap: default_notification_daily_cap(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8400".to_string()
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

const fn default_digest_flush_interval_secs() -> u64 {
    3_600
}

const fn default_notification_daily_cap() -> u32 {
    20
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
