//! Configuration for an assembler host.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use plexus_id::SystemId;

/// Assembler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this host among the participants.
    pub system_id: SystemId,

    /// Lifetime of leases this host grants; holders renew at a third of it.
    pub lease_duration: Duration,

    /// How often granted leases are checked for expiry.
    pub lease_check_interval: Duration,

    /// Mailbox capacity of each application actor.
    pub mailbox_size: usize,

    /// Upper bound on how long `configure` waits for the root report.
    pub configure_timeout: Duration,

    /// Seed for binding host shuffling. Random when absent.
    pub binding_seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let system_id = match std::env::var("PLEXUS_SYSTEM_ID") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid PLEXUS_SYSTEM_ID '{}'", raw))?,
            Err(_) => SystemId::new(),
        };

        let lease_duration = Duration::from_millis(env_u64("PLEXUS_LEASE_DURATION_MS", 10_000)?);
        let lease_check_interval =
            Duration::from_millis(env_u64("PLEXUS_LEASE_CHECK_INTERVAL_MS", 500)?);
        let mailbox_size = env_u64("PLEXUS_MAILBOX_SIZE", 1024)? as usize;
        let configure_timeout =
            Duration::from_secs(env_u64("PLEXUS_CONFIGURE_TIMEOUT_SECS", 60)?);

        let binding_seed = match std::env::var("PLEXUS_BINDING_SEED") {
            Ok(raw) => Some(
                raw.parse()
                    .with_context(|| format!("invalid PLEXUS_BINDING_SEED '{}'", raw))?,
            ),
            Err(_) => None,
        };

        let log_level = std::env::var("PLEXUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let config = Self {
            system_id,
            lease_duration,
            lease_check_interval,
            mailbox_size,
            configure_timeout,
            binding_seed,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            bail!("PLEXUS_LEASE_DURATION_MS must be greater than zero");
        }
        if self.lease_check_interval.is_zero() {
            bail!("PLEXUS_LEASE_CHECK_INTERVAL_MS must be greater than zero");
        }
        if self.mailbox_size == 0 {
            bail!("PLEXUS_MAILBOX_SIZE must be greater than zero");
        }
        Ok(())
    }

    /// Defaults for an explicitly named host.
    pub fn for_system(system_id: SystemId) -> Self {
        Self {
            system_id,
            lease_duration: Duration::from_secs(10),
            lease_check_interval: Duration::from_millis(500),
            mailbox_size: 1024,
            configure_timeout: Duration::from_secs(60),
            binding_seed: None,
            log_level: "info".to_string(),
        }
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid {} '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}
