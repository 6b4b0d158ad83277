//! Configuration types.

use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Kudos awarded for one delivered (or cancelled) form.
pub const DEFAULT_FORM_KUDOS: u64 = 1;

/// Dispatch engine configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a worker may hold a claimed form before it is considered stale.
    /// Fixed at claim time, never extended by worker activity.
    pub claim_ttl: Duration,
    /// Job expiry window, refreshed whenever the job is claimed from or completed.
    pub job_ttl: Duration,
    /// Period of the reclaim / purge sweep.
    pub sweep_interval: Duration,
    /// Kudos per delivered or cancelled form.
    pub form_kudos: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(180),  // 3 minutes
            job_ttl: Duration::from_secs(1200),   // 20 minutes
            sweep_interval: Duration::from_secs(10),
            form_kudos: DEFAULT_FORM_KUDOS,
        }
    }
}

impl DispatchConfig {
    /// Load from `FORM_DISPATCH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, fallback: Duration| -> Duration {
            match lookup(key) {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(v) if v > 0 => Duration::from_secs(v),
                    _ => {
                        warn!(key, value = %raw, "Ignoring invalid duration, using default");
                        fallback
                    }
                },
                None => fallback,
            }
        };

        let form_kudos = match lookup("FORM_DISPATCH_FORM_KUDOS") {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring invalid FORM_DISPATCH_FORM_KUDOS, using default");
                defaults.form_kudos
            }),
            None => defaults.form_kudos,
        };

        Self {
            claim_ttl: secs("FORM_DISPATCH_CLAIM_TTL_SECS", defaults.claim_ttl),
            job_ttl: secs("FORM_DISPATCH_JOB_TTL_SECS", defaults.job_ttl),
            sweep_interval: secs("FORM_DISPATCH_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            form_kudos,
        }
    }

    /// A claim must fit inside the job window, or a job can be purged while a
    /// worker still holds one of its forms.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_ttl > self.job_ttl {
            return Err(ConfigError::InvalidValue {
                key: "FORM_DISPATCH_CLAIM_TTL_SECS".to_string(),
                message: format!(
                    "claim TTL {}s exceeds job TTL {}s",
                    self.claim_ttl.as_secs(),
                    self.job_ttl.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Claim window as a chrono duration, for timestamp math.
    pub fn claim_window(&self) -> chrono::Duration {
        to_chrono(self.claim_ttl)
    }

    /// Job expiry window as a chrono duration.
    pub fn job_window(&self) -> chrono::Duration {
        to_chrono(self.job_ttl)
    }
}

/// Windows are capped at a century so timestamp arithmetic cannot overflow.
fn to_chrono(d: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(d).map_or(cap, |w| w.min(cap))
}
