//! Background driver for a connected session.
//!
//! The driver is the single writer over session state: user commands, fetch
//! results and write results all funnel into one `select!` loop. Fetches and
//! writes run as spawned tasks so a slow request never blocks commands or
//! shutdown; results come back over a channel owned by this driver, so a
//! late result from a disconnected session has nowhere to land.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::device::{DeviceRecord, OptimisticPatch};
use crate::session::{ConnectionState, SessionView, SyncError};
use crate::store::{RemoteStore, StorePath};

#[derive(Debug)]
pub(crate) enum Command {
    /// Apply an optimistic patch and issue the corresponding remote write.
    Patch(OptimisticPatch),
    /// Out-of-band fetch; does not touch the poll timer.
    Refresh,
}

#[derive(Debug)]
enum IoResult {
    Fetch(Result<DeviceRecord, String>),
    Write {
        path: String,
        result: Result<(), String>,
    },
}

struct Driver {
    store: RemoteStore,
    device_path: StorePath,
    record: Option<DeviceRecord>,
    patches: Vec<OptimisticPatch>,
    connection: ConnectionState,
    last_error: Option<SyncError>,
    view_tx: watch::Sender<SessionView>,
    io_tx: mpsc::UnboundedSender<IoResult>,
}

pub(crate) async fn run(
    store: RemoteStore,
    device_path: StorePath,
    config: SessionConfig,
    view_tx: watch::Sender<SessionView>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (io_tx, mut io_rx) = mpsc::unbounded_channel();
    let mut driver = Driver {
        store,
        device_path,
        record: None,
        patches: Vec::new(),
        connection: ConnectionState::Connecting,
        last_error: None,
        view_tx,
        io_tx,
    };

    // Initial fetch before the timer starts
    driver.spawn_fetch(Duration::ZERO);

    let start = time::Instant::now() + config.poll_interval;
    let mut ticker = time::interval_at(start, config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            command = command_rx.recv() => match command {
                Some(Command::Patch(patch)) => driver.handle_patch(patch),
                Some(Command::Refresh) => driver.spawn_fetch(Duration::ZERO),
                None => break, // session handle dropped
            },

            Some(result) = io_rx.recv() => driver.handle_io(result),

            _ = ticker.tick() => driver.spawn_fetch(jitter(config.poll_max_jitter)),
        }
    }

    // Final publication: record cleared, timer gone. In-flight requests may
    // still complete, but their results die with this driver's channels.
    driver.view_tx.send_replace(SessionView {
        device: None,
        connection: ConnectionState::Disconnected,
        last_error: None,
    });
    debug!("session driver stopped");
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::random_range(0..=max_ms))
}

impl Driver {
    fn publish(&self) {
        self.view_tx.send_replace(SessionView {
            device: self
                .record
                .clone()
                .map(|record| record.with_patches(&self.patches)),
            connection: self.connection,
            last_error: self.last_error.clone(),
        });
    }

    fn spawn_fetch(&self, delay: Duration) {
        let store = self.store.clone();
        let path = self.device_path.clone();
        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            let result = fetch_record(&store, &path).await;
            let _ = io_tx.send(IoResult::Fetch(result));
        });
    }

    fn handle_patch(&mut self, patch: OptimisticPatch) {
        self.spawn_write(&patch);
        self.patches.push(patch);
        self.publish();
    }

    fn spawn_write(&self, patch: &OptimisticPatch) {
        let path = match self.device_path.join(patch.path.iter().cloned()) {
            Ok(path) => path,
            Err(e) => {
                let _ = self.io_tx.send(IoResult::Write {
                    path: patch.path.join("/"),
                    result: Err(e.to_string()),
                });
                return;
            }
        };
        let store = self.store.clone();
        let value = patch.value.clone();
        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            let result = store
                .write_path(&path, &value)
                .await
                .map_err(|e| e.to_string());
            let _ = io_tx.send(IoResult::Write {
                path: path.to_string(),
                result,
            });
        });
    }

    fn handle_io(&mut self, result: IoResult) {
        match result {
            IoResult::Fetch(Ok(record)) => {
                // Last-poll-wins: the fetched record supersedes all pending
                // optimism, confirmed or not.
                self.record = Some(record);
                self.patches.clear();
                self.connection = ConnectionState::Polling;
                self.last_error = None;
                self.publish();
            }
            IoResult::Fetch(Err(cause)) => {
                // Previous record stands; the loop keeps polling.
                warn!("failed to fetch device record: {cause}");
                self.last_error = Some(SyncError::Fetch(cause));
                self.publish();
            }
            IoResult::Write {
                path,
                result: Ok(()),
            } => {
                debug!("wrote {path}");
            }
            IoResult::Write {
                path,
                result: Err(cause),
            } => {
                // No rollback: the optimistic value keeps rendering until
                // the next poll reconciles it.
                warn!("failed to write {path}: {cause}");
                self.last_error = Some(SyncError::Write { path, cause });
                self.publish();
            }
        }
    }
}

async fn fetch_record(store: &RemoteStore, path: &StorePath) -> Result<DeviceRecord, String> {
    let value = store.read_path(path).await.map_err(|e| e.to_string())?;
    serde_json::from_value(value).map_err(|e| format!("bad device record: {e}"))
}
