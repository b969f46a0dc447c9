pub mod logs;
pub mod network;
pub mod session;

pub use logs::{LevelFilter, LogBuffer, LogEntry, DEFAULT_MAX_LOGS};
pub use network::{CallState, NetworkCall, NetworkTable, DEFAULT_MAX_REQUESTS};
pub use session::{
    ConnectionState, LogsState, NetworkState, Session, SessionConfig, SessionStatus,
    DEFAULT_RECONNECT_DELAY,
};
