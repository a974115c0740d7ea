//! Connection session: owns the device identity, the driver task and the
//! state view handed to the renderer.
//!
//! A [Session] is created by [Session::connect] and consumed by
//! [Session::disconnect]. Each session spawns its own driver with fresh
//! channels, so results from requests issued by one session can never reach
//! the state of another.

use std::fmt::{self, Display};

use reqwest::Url;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::SessionConfig;
use crate::device::{ActuatorMode, DeviceRecord, OptimisticPatch, SettingValue};
use crate::store::{RemoteStore, StorePath};
use crate::sync::{self, Command};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("endpoint root must not be empty")]
    EmptyEndpoint,

    #[error("endpoint root must be an absolute http(s) URL: {0}")]
    InvalidEndpoint(String),

    #[error("device id must not be empty")]
    EmptyDeviceId,

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("poll interval must be non-zero")]
    ZeroPollInterval,
}

/// Connection lifecycle as seen by the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no successful fetch yet.
    #[default]
    Connecting,
    /// Polling; the view carries the last fetched record.
    Polling,
    /// The session has been shut down.
    Disconnected,
}

/// A non-fatal synchronization error, surfaced through the view.
///
/// Carries stringified causes so the view stays `Clone` across the watch
/// channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// A poll failed; the previous record is retained.
    Fetch(String),
    /// A command write failed; the optimistic value stands until the next
    /// poll reconciles it.
    Write { path: String, cause: String },
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Fetch(cause) => write!(f, "fetch failed: {cause}"),
            SyncError::Write { path, cause } => write!(f, "write to {path} failed: {cause}"),
        }
    }
}

/// What the rendering subscriber receives on every state change.
#[derive(Clone, Debug, Default)]
pub struct SessionView {
    /// Blended device state: the last fetched record with pending
    /// optimistic patches applied in issue order.
    pub device: Option<DeviceRecord>,
    pub connection: ConnectionState,
    pub last_error: Option<SyncError>,
}

/// A live connection to one device record in the store.
pub struct Session {
    device_id: String,
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: broadcast::Sender<()>,
    view_rx: watch::Receiver<SessionView>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    /// Validates the endpoint and device id, then spawns the polling driver.
    ///
    /// The driver performs one immediate fetch and keeps polling at the
    /// configured interval until [Session::disconnect]. On validation
    /// failure nothing is spawned and no state changes.
    pub fn connect(
        endpoint_root: &str,
        device_id: &str,
        config: SessionConfig,
    ) -> Result<Self, ConnectError> {
        let endpoint_root = endpoint_root.trim();
        if endpoint_root.is_empty() {
            return Err(ConnectError::EmptyEndpoint);
        }
        let url = Url::parse(endpoint_root)
            .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConnectError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(ConnectError::EmptyDeviceId);
        }
        let device_path = StorePath::new(["devices", device_id])
            .map_err(|e| ConnectError::InvalidDeviceId(e.to_string()))?;
        // The driver's timer needs a non-zero period
        if config.poll_interval.is_zero() {
            return Err(ConnectError::ZeroPollInterval);
        }

        let store = RemoteStore::new(url.as_str(), &config);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (view_tx, view_rx) = watch::channel(SessionView::default());

        info!("connecting to {url} as '{device_id}'");
        let driver = tokio::spawn(sync::run(
            store,
            device_path,
            config,
            view_tx,
            command_rx,
            shutdown_rx,
        ));

        Ok(Self {
            device_id: device_id.to_string(),
            command_tx,
            shutdown_tx,
            view_rx,
            driver: Some(driver),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The current view plus a subscription to every subsequent change.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    /// Switches an actuator on or off, optimistically.
    pub fn set_actuator_state(&self, actuator: &str, on: bool) {
        self.send(Command::Patch(OptimisticPatch::actuator_state(actuator, on)));
    }

    /// Switches an actuator between manual and automatic mode.
    pub fn set_actuator_mode(&self, actuator: &str, mode: ActuatorMode) {
        self.send(Command::Patch(OptimisticPatch::actuator_mode(actuator, mode)));
    }

    /// Replaces a device setting.
    pub fn set_setting(&self, key: &str, value: impl Into<SettingValue>) {
        self.send(Command::Patch(OptimisticPatch::setting(key, value.into())));
    }

    /// Triggers an out-of-band fetch without touching the poll timer.
    pub fn refresh_now(&self) {
        self.send(Command::Refresh);
    }

    fn send(&self, command: Command) {
        // A closed channel means the driver is gone; commands are no-ops then
        let _ = self.command_tx.send(command);
    }

    /// Shuts the driver down and waits for it to publish the final
    /// disconnected view. In-flight store requests are not aborted; their
    /// results die with the driver's channels.
    pub async fn disconnect(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        info!("disconnected from '{}'", self.device_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;
    use mockito::Server;
    use serde_json::json;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(poll_ms: u64) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(poll_ms),
            ..Default::default()
        }
    }

    fn record_body(fan_on: bool) -> String {
        json!({
            "name": "Greenhouse",
            "status": "online",
            "sensors": { "temperature": { "value": 21.5, "unit": "°C" } },
            "actuators": { "fan": { "state": fan_on, "mode": "manual" } },
            "settings": { "tempThreshold": 26, "autoMode": true }
        })
        .to_string()
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<SessionView>, mut pred: F) -> SessionView
    where
        F: FnMut(&SessionView) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if pred(&view) {
                        return view.clone();
                    }
                }
                rx.changed().await.expect("view channel closed");
            }
        })
        .await
        .expect("timed out waiting for view")
    }

    #[tokio::test]
    async fn connect_validates_endpoint_and_device_id() {
        assert!(matches!(
            Session::connect("", "dev1", test_config(100)),
            Err(ConnectError::EmptyEndpoint)
        ));
        assert!(matches!(
            Session::connect("   ", "dev1", test_config(100)),
            Err(ConnectError::EmptyEndpoint)
        ));
        assert!(matches!(
            Session::connect("not a url", "dev1", test_config(100)),
            Err(ConnectError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Session::connect("ftp://store.test", "dev1", test_config(100)),
            Err(ConnectError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Session::connect("http://store.test", "", test_config(100)),
            Err(ConnectError::EmptyDeviceId)
        ));
        assert!(matches!(
            Session::connect("http://store.test", "a/b", test_config(100)),
            Err(ConnectError::InvalidDeviceId(_))
        ));
    }

    #[tokio::test]
    async fn connect_rejects_a_zero_poll_interval() {
        // A zero period would kill the driver's timer; reject it up front
        // instead of handing back a session that never publishes
        assert!(matches!(
            Session::connect("http://store.test", "dev1", test_config(0)),
            Err(ConnectError::ZeroPollInterval)
        ));
    }

    #[tokio::test]
    async fn command_applies_optimistically_and_poll_reconciles() {
        let mut server = Server::new_async().await;
        // The store keeps reporting the fan off; PUTs are unmatched and fail
        let _get = server
            .mock("GET", "/devices/dev1.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_body(false))
            .expect_at_least(1)
            .create_async()
            .await;

        let session = Session::connect(&server.url(), "dev1", test_config(300)).unwrap();
        let mut view_rx = session.subscribe();
        wait_for(&mut view_rx, |v| v.device.is_some()).await;

        // The blended state flips before any network response
        session.set_actuator_state("fan", true);
        wait_for(&mut view_rx, |v| {
            v.device
                .as_ref()
                .is_some_and(|d| d.actuators["fan"].state)
        })
        .await;

        // The write fails; the optimistic value stands and the error is
        // surfaced
        let view = wait_for(&mut view_rx, |v| v.last_error.is_some()).await;
        assert!(matches!(view.last_error, Some(SyncError::Write { .. })));
        assert!(view.device.unwrap().actuators["fan"].state);

        // Next poll returns fan=false: last-poll-wins clears the patch and
        // the error
        let view = wait_for(&mut view_rx, |v| {
            v.device
                .as_ref()
                .is_some_and(|d| !d.actuators["fan"].state)
                && v.last_error.is_none()
        })
        .await;
        assert_eq!(view.connection, ConnectionState::Polling);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn failed_poll_keeps_the_previous_record() {
        let mut server = Server::new_async().await;
        let _ok = server
            .mock("GET", "/devices/dev1.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_body(false))
            .expect_at_least(1)
            .create_async()
            .await;

        let session = Session::connect(&server.url(), "dev1", test_config(100)).unwrap();
        let mut view_rx = session.subscribe();
        let before = wait_for(&mut view_rx, |v| v.device.is_some()).await;

        // Later mocks take precedence: polls start failing
        let _err = server
            .mock("GET", "/devices/dev1.json")
            .with_status(500)
            .expect_at_least(1)
            .create_async()
            .await;

        let after = wait_for(&mut view_rx, |v| v.last_error.is_some()).await;
        assert!(matches!(after.last_error, Some(SyncError::Fetch(_))));
        assert_eq!(after.device, before.device);
        assert_eq!(after.connection, ConnectionState::Polling);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_cancels_polling() {
        let mut server = Server::new_async().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _mock = server
            .mock("GET", "/devices/dev1.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                record_body(false).into_bytes()
            })
            .expect_at_least(0)
            .create_async()
            .await;

        let session = Session::connect(&server.url(), "dev1", test_config(100)).unwrap();
        let mut view_rx = session.subscribe();
        session.disconnect().await;

        let view = wait_for(&mut view_rx, |v| {
            v.connection == ConnectionState::Disconnected
        })
        .await;
        assert!(view.device.is_none());

        // The initial fetch may or may not have gone out; nothing more after
        tokio::time::sleep(Duration::from_millis(100)).await;
        let hits_after_disconnect = hits.load(Ordering::SeqCst);
        assert!(hits_after_disconnect <= 1);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(hits.load(Ordering::SeqCst), hits_after_disconnect);
    }

    #[tokio::test]
    async fn stale_fetch_never_crosses_sessions() {
        let mut server = Server::new_async().await;
        // The first device's record arrives late
        let _slow = server
            .mock("GET", "/devices/alpha.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_chunked_body(|writer| {
                std::thread::sleep(Duration::from_millis(300));
                writer.write_all(json!({ "name": "alpha" }).to_string().as_bytes())
            })
            .expect_at_least(0)
            .create_async()
            .await;
        let _fast = server
            .mock("GET", "/devices/beta.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "name": "beta", "status": "online" }).to_string())
            .expect_at_least(1)
            .create_async()
            .await;

        // Disconnect while alpha's fetch is still in flight, then reconnect
        // with a different device id
        let first = Session::connect(&server.url(), "alpha", test_config(10_000)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.disconnect().await;

        let second = Session::connect(&server.url(), "beta", test_config(10_000)).unwrap();
        let mut view_rx = second.subscribe();
        let view = wait_for(&mut view_rx, |v| v.device.is_some()).await;
        assert_eq!(view.device.unwrap().name, "beta");

        // Let alpha's response land; it must not touch the new session
        tokio::time::sleep(Duration::from_millis(400)).await;
        let view = view_rx.borrow().clone();
        assert_eq!(view.device.unwrap().name, "beta");
        assert_eq!(view.connection, ConnectionState::Polling);

        second.disconnect().await;
    }

    #[tokio::test]
    async fn settings_commands_blend_and_write() {
        let mut server = Server::new_async().await;
        let _get = server
            .mock("GET", "/devices/dev1.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(record_body(false))
            .expect_at_least(1)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/devices/dev1/settings/tempThreshold.json")
            .match_body(mockito::Matcher::Json(json!(27.0)))
            .with_status(200)
            .with_body("27")
            .create_async()
            .await;

        let session = Session::connect(&server.url(), "dev1", test_config(5_000)).unwrap();
        let mut view_rx = session.subscribe();
        let view = wait_for(&mut view_rx, |v| v.device.is_some()).await;
        assert_eq!(view.device.unwrap().status, DeviceStatus::Online);

        session.set_setting("tempThreshold", 27.0);
        let view = wait_for(&mut view_rx, |v| {
            v.device
                .as_ref()
                .is_some_and(|d| d.settings["tempThreshold"] == SettingValue::Number(27.0))
        })
        .await;
        assert!(view.last_error.is_none());

        // The remote write went out to the matching sub-path
        timeout(Duration::from_secs(2), async {
            while !put.matched_async().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("PUT should reach the store");

        session.disconnect().await;
    }
}
