use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Motion link connection state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Health supervisor bookkeeping, updated once per scheduling tick
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthRecord {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub connected: bool,
}

impl HealthRecord {
    pub fn record_success(&mut self) {
        self.last_attempt_at = Some(Utc::now());
        self.consecutive_failures = 0;
        self.connected = true;
    }

    pub fn record_failure(&mut self) {
        self.last_attempt_at = Some(Utc::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.connected = false;
    }
}
