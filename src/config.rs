use std::time::Duration;

/// Per-session tunables for polling and store requests.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Fixed period between scheduled polls of the device record.
    pub poll_interval: Duration,

    /// Maximum random delay added to each scheduled poll, for spreading
    /// load across a fleet. Zero keeps the period exactly fixed.
    pub poll_max_jitter: Duration,

    /// Maximum time to wait for a single store request to complete.
    pub request_timeout: Duration,

    /// Optional token sent as the `auth` query parameter on every request.
    pub auth_token: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3_000),
            poll_max_jitter: Duration::ZERO,
            request_timeout: Duration::from_millis(10_000),
            auth_token: None,
        }
    }
}
