//! Coordinator configuration.
//!
//! Settings come from the environment (see [`CoordinatorConfig::from_env`])
//! or are filled in by the binary from its command line. Cluster sizing is
//! checked up front: a process with a bad `node_count`/`index` must refuse
//! to start.

use crate::error::{CoordinatorError, Result};
use corelib::PartitionPlan;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default duplicate-consumer detection interval.
pub const DEFAULT_SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-shard window between two recovery advertisements.
pub const DEFAULT_RECOVERY_COOLDOWN: Duration = Duration::from_secs(30);

/// With [`OrphanSweep::Auto`], the sweep runs once every this many
/// supervise intervals.
pub const ORPHAN_SWEEP_FACTOR: u32 = 5;

/// Broker connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// When the orphan sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanSweep {
    /// Never; dead processes' claims stay in the table.
    Disabled,
    /// Every [`ORPHAN_SWEEP_FACTOR`] supervise intervals.
    #[default]
    Auto,
    Every(Duration),
}

/// Timing knobs for one supervisor and its shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long a starting shard waits for a competing consumer before
    /// declaring itself active, and how often an active shard re-checks.
    pub supervise_interval: Duration,
    /// Minimum time between two recovery advertisements of the same shard.
    pub recovery_cooldown: Duration,
    pub orphan_sweep: OrphanSweep,
}

impl SupervisorSettings {
    /// Effective sweep period, `None` if the sweep is off.
    pub fn orphan_sweep_period(&self) -> Option<Duration> {
        match self.orphan_sweep {
            OrphanSweep::Disabled => None,
            OrphanSweep::Auto => Some(self.supervise_interval * ORPHAN_SWEEP_FACTOR),
            OrphanSweep::Every(period) if period.is_zero() => None,
            OrphanSweep::Every(period) => Some(period),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            supervise_interval: DEFAULT_SUPERVISE_INTERVAL,
            recovery_cooldown: DEFAULT_RECOVERY_COOLDOWN,
            orphan_sweep: OrphanSweep::Auto,
        }
    }
}

/// Everything a worker process needs at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoordinatorConfig {
    /// Number of worker positions in the cluster. Required.
    pub node_count: Option<u32>,
    /// 1-based position of this worker. Unset means "start with no shards".
    pub index: Option<u32>,
    pub supervisor: SupervisorSettings,
    pub broker: BrokerSettings,
}

impl CoordinatorConfig {
    /// Read configuration from environment variables.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `SHARD_NODE_COUNT` | node count |
    /// | `SHARD_INDEX` | 1-based position |
    /// | `SHARD_SUPERVISE_INTERVAL_MS` | detection interval |
    /// | `SHARD_RECOVERY_COOLDOWN_MS` | recovery debounce window |
    /// | `SHARD_ORPHAN_SWEEP_MS` | orphan sweep period (unset = auto, `0` = off) |
    /// | `AMQP_HOST`, `AMQP_PORT`, `AMQP_USER`, `AMQP_PASSWORD`, `AMQP_VHOST` | broker |
    ///
    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.node_count = env_parse("SHARD_NODE_COUNT")?;
        config.index = env_parse("SHARD_INDEX")?;
        if let Some(ms) = env_parse::<u64>("SHARD_SUPERVISE_INTERVAL_MS")? {
            config.supervisor.supervise_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SHARD_RECOVERY_COOLDOWN_MS")? {
            config.supervisor.recovery_cooldown = Duration::from_millis(ms);
        }
        config.supervisor.orphan_sweep = match env_parse::<u64>("SHARD_ORPHAN_SWEEP_MS")? {
            None => OrphanSweep::Auto,
            Some(0) => OrphanSweep::Disabled,
            Some(ms) => OrphanSweep::Every(Duration::from_millis(ms)),
        };

        let broker = &mut config.broker;
        if let Some(host) = env_parse("AMQP_HOST")? {
            broker.host = host;
        }
        if let Some(port) = env_parse("AMQP_PORT")? {
            broker.port = port;
        }
        if let Some(user) = env_parse("AMQP_USER")? {
            broker.user = user;
        }
        if let Some(password) = env_parse("AMQP_PASSWORD")? {
            broker.password = password;
        }
        if let Some(vhost) = env_parse("AMQP_VHOST")? {
            broker.vhost = vhost;
        }
        Ok(config)
    }

    /// Check sizing and timing, returning this process's partition plan.
    ///
    /// # Errors
    ///
    /// `Core(InvalidConfiguration)` for bad sizing, `Config` for a zero
    /// supervise interval.
    pub fn validate(&self) -> Result<PartitionPlan> {
        if self.supervisor.supervise_interval.is_zero() {
            return Err(CoordinatorError::Config(
                "supervise_interval must be positive".to_string(),
            ));
        }
        Ok(corelib::plan(self.node_count, self.index)?)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoordinatorError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(CoordinatorError::Config(format!("{}: {}", key, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.supervisor.supervise_interval, Duration::from_secs(1));
        assert_eq!(config.supervisor.orphan_sweep, OrphanSweep::Auto);
        assert_eq!(
            config.supervisor.orphan_sweep_period(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.vhost, "/");
    }

    #[test]
    fn test_sweep_period_follows_settings() {
        let mut settings = SupervisorSettings {
            supervise_interval: Duration::from_millis(30),
            ..Default::default()
        };
        assert_eq!(
            settings.orphan_sweep_period(),
            Some(Duration::from_millis(150))
        );
        settings.orphan_sweep = OrphanSweep::Every(Duration::from_millis(70));
        assert_eq!(
            settings.orphan_sweep_period(),
            Some(Duration::from_millis(70))
        );
        settings.orphan_sweep = OrphanSweep::Disabled;
        assert_eq!(settings.orphan_sweep_period(), None);
    }

    #[test]
    fn test_validate_requires_node_count() {
        let config = CoordinatorConfig::default();
        assert!(matches!(
            config.validate(),
            Err(CoordinatorError::Core(corelib::Error::InvalidConfiguration(_)))
        ));
    }

    #[test]
    fn test_validate_returns_plan() {
        let config = CoordinatorConfig {
            node_count: Some(5),
            index: Some(5),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().len(), 208);

        let unplaced = CoordinatorConfig {
            node_count: Some(5),
            ..Default::default()
        };
        assert!(unplaced.validate().unwrap().is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = CoordinatorConfig {
            node_count: Some(1),
            ..Default::default()
        };
        config.supervisor.supervise_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(CoordinatorError::Config(_))));
    }

    #[test]
    fn test_password_is_redacted() {
        let settings = BrokerSettings {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }

    const ENV_KEYS: [&str; 10] = [
        "SHARD_NODE_COUNT",
        "SHARD_INDEX",
        "SHARD_SUPERVISE_INTERVAL_MS",
        "SHARD_RECOVERY_COOLDOWN_MS",
        "SHARD_ORPHAN_SWEEP_MS",
        "AMQP_HOST",
        "AMQP_PORT",
        "AMQP_USER",
        "AMQP_PASSWORD",
        "AMQP_VHOST",
    ];

    // The process environment is shared by every test thread.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock();
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        let out = f();
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
        out
    }

    #[test]
    fn test_from_env_reads_every_variable() {
        let config = with_env(
            &[
                ("SHARD_NODE_COUNT", "4"),
                ("SHARD_INDEX", "2"),
                ("SHARD_SUPERVISE_INTERVAL_MS", "250"),
                ("SHARD_RECOVERY_COOLDOWN_MS", "9000"),
                ("SHARD_ORPHAN_SWEEP_MS", "1500"),
                ("AMQP_HOST", "rabbit.internal"),
                ("AMQP_PORT", "5673"),
                ("AMQP_USER", "worker"),
                ("AMQP_PASSWORD", "s3cret"),
                ("AMQP_VHOST", "/search"),
            ],
            CoordinatorConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.node_count, Some(4));
        assert_eq!(config.index, Some(2));
        assert_eq!(
            config.supervisor.supervise_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.supervisor.recovery_cooldown, Duration::from_secs(9));
        assert_eq!(
            config.supervisor.orphan_sweep,
            OrphanSweep::Every(Duration::from_millis(1500))
        );
        assert_eq!(
            config.broker,
            BrokerSettings {
                host: "rabbit.internal".to_string(),
                port: 5673,
                user: "worker".to_string(),
                password: "s3cret".to_string(),
                vhost: "/search".to_string(),
            }
        );
        assert_eq!(config.validate().unwrap().range(), Some(256..=511));
    }

    #[test]
    fn test_from_env_unset_and_blank_keep_defaults() {
        let config = with_env(
            &[("SHARD_NODE_COUNT", "3"), ("AMQP_HOST", "  ")],
            CoordinatorConfig::from_env,
        )
        .unwrap();
        assert_eq!(
            config,
            CoordinatorConfig {
                node_count: Some(3),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_from_env_zero_sweep_disables_it() {
        let config = with_env(&[("SHARD_ORPHAN_SWEEP_MS", "0")], CoordinatorConfig::from_env)
            .unwrap();
        assert_eq!(config.supervisor.orphan_sweep, OrphanSweep::Disabled);
        assert_eq!(config.supervisor.orphan_sweep_period(), None);
    }

    #[test]
    fn test_from_env_rejects_unparsable_values() {
        for (key, value) in [
            ("SHARD_NODE_COUNT", "five"),
            ("SHARD_INDEX", "-1"),
            ("SHARD_SUPERVISE_INTERVAL_MS", "1s"),
            ("AMQP_PORT", "70000"),
        ] {
            let result = with_env(&[(key, value)], CoordinatorConfig::from_env);
            match result {
                Err(CoordinatorError::Config(message)) => assert!(message.contains(key)),
                other => panic!("{}={} gave {:?}", key, value, other),
            }
        }
    }

    #[test]
    fn test_from_env_bad_sizing_refuses_to_start() {
        let config = with_env(
            &[("SHARD_NODE_COUNT", "5"), ("SHARD_INDEX", "10")],
            CoordinatorConfig::from_env,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(CoordinatorError::Core(corelib::Error::InvalidConfiguration(_)))
        ));
    }
}
