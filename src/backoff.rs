use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

/// How hard to try before giving up on the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 10 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30000 }

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            attempt: 0,
            delay_ms: self.initial_delay_ms,
            policy: self.clone(),
        }
    }

    /// Runs `op` until it succeeds or `max_attempts` is reached, sleeping with
    /// exponential backoff between attempts. Returns the last error.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = self.backoff();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    error!(
                        "{} failed (attempt {}/{}): {}",
                        what,
                        backoff.attempt() + 1,
                        self.max_attempts,
                        err
                    );
                    match backoff.next_delay() {
                        Some(delay) => {
                            info!("Waiting {}ms before retrying {}", delay.as_millis(), what);
                            sleep(delay).await;
                        }
                        None => {
                            error!("Max attempts reached for {}. Giving up.", what);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

/// Iterator-like exponential backoff state with +/-15% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    delay_ms: u64,
    policy: ReconnectPolicy,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait after a failed attempt, or `None` once the policy is
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }

        let base = self.delay_ms;
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * base as f64;
        let sleep_time = (base as f64 + jitter).max(0.0) as u64;

        self.delay_ms = std::cmp::min(base.saturating_mul(2), self.policy.max_delay_ms);
        Some(Duration::from_millis(sleep_time))
    }
}
