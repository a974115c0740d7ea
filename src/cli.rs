use clap::Parser;
use std::num::ParseIntError;
use std::time::Duration;

use crate::config::SessionConfig;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Root URL of the remote document store
    #[arg(env = "SKYLIGHT_ENDPOINT_ROOT", value_name = "url")]
    pub endpoint_root: String,

    /// Identifier of the device record to control
    #[arg(
        env = "SKYLIGHT_DEVICE_ID",
        long = "device-id",
        value_name = "id",
        default_value = "device_001"
    )]
    pub device_id: String,

    /// Token sent as the `auth` query parameter on store requests
    #[arg(env = "SKYLIGHT_AUTH_TOKEN", long = "auth-token", value_name = "token")]
    pub auth_token: Option<String>,

    /// Device record poll interval in milliseconds
    #[arg(
        env = "SKYLIGHT_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_interval: Option<Duration>,

    /// Max random jitter added to each scheduled poll, in milliseconds
    #[arg(
        env = "SKYLIGHT_POLL_MAX_JITTER_MS",
        long = "poll-max-jitter-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_max_jitter: Option<Duration>,

    /// Store request timeout in milliseconds
    #[arg(
        env = "SKYLIGHT_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,
}

impl Cli {
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig {
            auth_token: self.auth_token.clone(),
            ..Default::default()
        };
        if let Some(poll_interval) = self.poll_interval {
            config.poll_interval = poll_interval;
        }
        if let Some(poll_max_jitter) = self.poll_max_jitter {
            config.poll_max_jitter = poll_max_jitter;
        }
        if let Some(request_timeout) = self.request_timeout {
            config.request_timeout = request_timeout;
        }
        config
    }
}

pub fn parse() -> Cli {
    Parser::parse()
}
