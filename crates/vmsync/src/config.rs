//! Configuration Module - Synchronization Tuning Parameters
//!
//! Spin ladders for contended monitors, exclusive-access policy and the
//! resource bounds that turn into `AllocationFailure`.

use std::time::Duration;

/// Spin ladder for one contended acquisition attempt.
///
/// An attempt runs `yields` outer rounds. Each round retries the CAS `spin2`
/// times with a busy-wait of `spin1` cycles between retries, then yields the
/// CPU. Only after the last round does the caller escalate to blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinCounts {
    pub spin1: u32,
    pub spin2: u32,
    pub yields: u32,
}

impl SpinCounts {
    /// Counts used on multi-processor machines.
    pub const MULTI_CPU: SpinCounts = SpinCounts {
        spin1: 256,
        spin2: 32,
        yields: 45,
    };

    /// Spinning cannot help on one CPU; keep a single attempt.
    pub const SINGLE_CPU: SpinCounts = SpinCounts {
        spin1: 1,
        spin2: 1,
        yields: 1,
    };

    pub fn for_machine() -> Self {
        if num_cpus::get() > 1 {
            Self::MULTI_CPU
        } else {
            Self::SINGLE_CPU
        }
    }

    fn validate(&self, which: &str) -> Result<(), ConfigError> {
        if self.spin1 == 0 || self.spin2 == 0 || self.yields == 0 {
            return Err(ConfigError::InvalidSpinCount(format!(
                "{} spin counts must be at least 1, got {:?}",
                which, self
            )));
        }
        Ok(())
    }
}

/// Main configuration for the synchronization substrate
///
/// # Examples
///
/// ```rust
/// use vmsync::{SpinCounts, SyncConfig};
///
/// let config = SyncConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Low spinning for heavily oversubscribed hosts
/// let config = SyncConfig {
///     spin: SpinCounts { spin1: 16, spin2: 4, yields: 2 },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Spin ladder for a thin lock held by another thread
    pub spin: SpinCounts,

    /// Spin ladder for try-enter on an inflated monitor
    pub try_enter_spin: SpinCounts,

    /// Allow lock reservation (biasing) on reservable objects
    ///
    /// When disabled, reservable objects are locked with ordinary thin
    /// locks and return to the reservable word on release.
    pub lock_reservation: bool,

    /// Pre-mark every thread before the authoritative halt pass
    ///
    /// Bounds convergence latency when many threads keep re-acquiring
    /// their token while the requester is still walking the thread list.
    pub two_pass_exclusive: bool,

    /// Exclusive responses slower than this are logged and counted
    pub exclusive_slow_tolerance_ms: u64,

    /// Upper bound on live heavyweight monitor records (0 = unbounded)
    pub max_monitors: usize,

    /// Monitor-enter records per thread
    pub max_enter_records: usize,

    /// Collect counters and histograms
    pub stats_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let spin = SpinCounts::for_machine();
        Self {
            spin,
            try_enter_spin: spin,
            lock_reservation: true,
            two_pass_exclusive: true,
            exclusive_slow_tolerance_ms: 5,
            max_monitors: 0,
            max_enter_records: 4096,
            stats_enabled: true,
        }
    }
}

impl SyncConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spin.validate("monitor")?;
        self.try_enter_spin.validate("try-enter")?;

        if self.max_enter_records == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_enter_records must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn exclusive_slow_tolerance(&self) -> Duration {
        Duration::from_millis(self.exclusive_slow_tolerance_ms)
    }

    /// Create config from environment variables
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u32>("VMSYNC_SPIN1") {
            config.spin.spin1 = v;
        }
        if let Some(v) = env_parse::<u32>("VMSYNC_SPIN2") {
            config.spin.spin2 = v;
        }
        if let Some(v) = env_parse::<u32>("VMSYNC_YIELDS") {
            config.spin.yields = v;
        }
        if let Some(v) = env_parse::<u32>("VMSYNC_TRY_ENTER_SPIN1") {
            config.try_enter_spin.spin1 = v;
        }
        if let Some(v) = env_parse::<u32>("VMSYNC_TRY_ENTER_SPIN2") {
            config.try_enter_spin.spin2 = v;
        }
        if let Some(v) = env_parse::<u32>("VMSYNC_TRY_ENTER_YIELDS") {
            config.try_enter_spin.yields = v;
        }
        if let Some(v) = env_flag("VMSYNC_LOCK_RESERVATION") {
            config.lock_reservation = v;
        }
        if let Some(v) = env_flag("VMSYNC_TWO_PASS_EXCLUSIVE") {
            config.two_pass_exclusive = v;
        }
        if let Some(v) = env_parse::<u64>("VMSYNC_SLOW_TOLERANCE_MS") {
            config.exclusive_slow_tolerance_ms = v;
        }
        if let Some(v) = env_parse::<usize>("VMSYNC_MAX_MONITORS") {
            config.max_monitors = v;
        }
        if let Some(v) = env_parse::<usize>("VMSYNC_MAX_ENTER_RECORDS") {
            config.max_enter_records = v;
        }
        if let Some(v) = env_flag("VMSYNC_STATS") {
            config.stats_enabled = v;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_flag(key: &str) -> Option<bool> {
    let val = std::env::var(key).ok()?;
    Some(val == "1" || val.eq_ignore_ascii_case("true"))
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid spin count: {0}")]
    InvalidSpinCount(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
}
