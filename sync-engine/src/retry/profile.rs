use std::time::Duration;

use super::classifier::ErrorClass;

/// How aggressively a client retries, chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: &'static str,
    /// Cycle the connection after a network-classified failure.
    pub restart_on_network_error: bool,
    /// Retry every non-validation error, not just network ones.
    pub retry_any_error: bool,
    pub network_base_delay: Duration,
    pub generic_base_delay: Duration,
    pub failure_message: String,
}

impl NetworkProfile {
    /// Flaky radios: restart the connection and retry everything.
    pub fn mobile() -> Self {
        Self {
            name: "mobile",
            restart_on_network_error: true,
            retry_any_error: true,
            network_base_delay: Duration::from_millis(2_000),
            generic_base_delay: Duration::from_millis(1_000),
            failure_message: "Sync failed after several attempts. Your changes are saved on this device \
                              and will sync when the connection improves."
                .into(),
        }
    }

    pub fn desktop() -> Self {
        Self {
            name: "desktop",
            restart_on_network_error: false,
            retry_any_error: false,
            network_base_delay: Duration::from_millis(1_000),
            generic_base_delay: Duration::from_millis(500),
            failure_message: "Unable to sync right now. Check your connection and try again.".into(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mobile" => Some(Self::mobile()),
            "desktop" => Some(Self::desktop()),
            _ => None,
        }
    }

    pub fn should_retry(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Validation => false,
            ErrorClass::Network => true,
            _ => self.retry_any_error,
        }
    }

    pub fn base_delay(&self, class: ErrorClass) -> Duration {
        match class {
            ErrorClass::Network => self.network_base_delay,
            _ => self.generic_base_delay,
        }
    }

    /// `2^(retry-1) * base`, for 1-based `retry`.
    pub fn backoff(&self, retry: u32, class: ErrorClass) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay(class).saturating_mul(1u32 << exp)
    }
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self::desktop()
    }
}
