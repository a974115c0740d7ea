/*
Remote-control client for a single IoT device record in a cloud document
store.

The crate polls the device record at a fixed interval, renders it through a
watch channel, and pushes user commands back as whole-value writes. Commands
apply optimistically on top of the last fetched record; every successful
poll is fully authoritative and discards pending optimism (last-poll-wins).
*/

pub mod cli;
pub mod config;
pub mod device;
pub mod session;
pub mod store;

mod sync;

pub use config::SessionConfig;
pub use device::{
    Actuator, ActuatorMode, DeviceRecord, DeviceStatus, OptimisticPatch, Sensor, SettingValue,
};
pub use session::{ConnectError, ConnectionState, Session, SessionView, SyncError};
pub use store::{RemoteStore, StoreError, StorePath};
