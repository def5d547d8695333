//! Tunable options for cluster operations.

use std::time::Duration;

use crate::error::{Error, Result};

/// Bounds for the operations that wait on asynchronous store propagation,
/// most notably the poll for a partition leader after topic creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterOptions {
    /// Sleep between leader polls.
    pub leader_wait_poll: Duration,
    /// Give up waiting for a leader after this long.
    pub leader_wait_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            leader_wait_poll: Duration::from_millis(100),
            leader_wait_timeout: Duration::from_secs(30),
        }
    }
}

impl ClusterOptions {
    /// Reads overrides from `ZKAFKA_LEADER_WAIT_POLL_MS` and
    /// `ZKAFKA_LEADER_WAIT_TIMEOUT_MS`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        let mut options = ClusterOptions::default();
        if let Some(ms) = read_millis("ZKAFKA_LEADER_WAIT_POLL_MS")? {
            options.leader_wait_poll = ms;
        }
        if let Some(ms) = read_millis("ZKAFKA_LEADER_WAIT_TIMEOUT_MS")? {
            options.leader_wait_timeout = ms;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.leader_wait_poll.is_zero() {
            return Err(Error::Config(
                "leader_wait_poll must be greater than zero".to_string(),
            ));
        }
        if self.leader_wait_timeout < self.leader_wait_poll {
            return Err(Error::Config(format!(
                "leader_wait_timeout ({:?}) must be at least leader_wait_poll ({:?})",
                self.leader_wait_timeout, self.leader_wait_poll
            )));
        }
        Ok(())
    }
}

fn read_millis(var: &str) -> Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|_| Error::Config(format!("{} must be an integer, got {:?}", var, raw)))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("{}: {}", var, e))),
    }
}
