pub mod codec;
pub mod protocol;

pub use codec::{classify, decode, decode_frame, Route};
pub use protocol::{
    current_timestamp, Envelope, ErrorData, LogEvent, LogLevel, RequestData, ResponseData,
    SystemEvent, DEFAULT_PORT, DEFAULT_WS_PATH, LOGSCOPE_VERSION,
};
