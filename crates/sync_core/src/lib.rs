//! Realtime synchronization of the two sequencing lanes.

pub mod channel;
pub mod config;
pub mod error;
pub mod normalize;
pub mod session;
pub mod store;
pub mod transport;

pub use channel::{PushConnector, RefreshIntent, WsConnector};
pub use config::{load_settings, SyncSettings};
pub use error::SyncError;
pub use session::{ConnectionStatus, SyncEvent, SyncSession};
pub use store::{CsvExport, LaneView, ViewState, ViewStateStore};
pub use transport::{ControlAction, HttpTransport, LaneTransport};
