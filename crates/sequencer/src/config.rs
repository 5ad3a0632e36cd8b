use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Delay before the first reconnect attempt; later attempts wait three
    /// times longer than the previous one.
    pub reconnect_base_delay_ms: u64,
    pub reconnect_attempts: u32,
    /// Texture bundles kept across prunes, not counting the current viewport.
    pub max_texture_bundles: usize,
    /// Events buffered per listener before further events are dropped for it.
    pub listener_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1000,
            reconnect_attempts: 5,
            max_texture_bundles: 256,
            listener_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.reconnect_attempts == 0 {
            return Err("reconnect_attempts must be positive");
        }
        if self.max_texture_bundles == 0 {
            return Err("max_texture_bundles must be positive");
        }
        if self.listener_capacity == 0 {
            return Err("listener_capacity must be positive");
        }
        Ok(())
    }

    pub fn assert_valid(&self) {
        if let Err(problem) = self.validate() {
            panic!("invalid session config: {problem}");
        }
    }

    /// `base * 3^attempt`, saturating.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 3u64.saturating_pow(attempt);
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }
}
