use std::time::Duration;

/// Prefix used in client-generated error messages
pub const ERROR_PREFIX: &str = "Mysql Client";

/// Average event loop callback delay above which the client is considered stalled
pub const CALLBACK_DELAY_STALL_THRESHOLD: Duration = Duration::from_millis(50);

/// Slack allowed past the total connect timeout before giving up on retries
pub const TOTAL_TIMEOUT_SLACK: Duration = Duration::from_millis(1);

/// Error numbers from the MySQL client library
pub mod client_errno {
    pub const CR_UNKNOWN_ERROR: u32 = 2000;
    pub const CR_SERVER_GONE_ERROR: u32 = 2006;
    pub const CR_SERVER_LOST: u32 = 2013;
    pub const ER_NET_READ_INTERRUPTED: u32 = 1159;
}

/// Error numbers generated by this crate rather than the server or the backend
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrno {
    ConnTimeout = 7000,
    ConnTimeoutLoopStalled = 7001,
    QueryTimeout = 7002,
    QueryTimeoutLoopStalled = 7003,
    InitializationFailed = 7006,
    OperationCancelled = 7007,
}

impl ClientErrno {
    pub fn code(self) -> u32 {
        self as u32
    }
}

bitflags::bitflags! {
    /// Client capability flags passed to the backend on connect
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const CLIENT_FOUND_ROWS = 0x0000_0002;
        const CLIENT_COMPRESS = 0x0000_0020;
        const CLIENT_LOCAL_FILES = 0x0000_0080;
        const CLIENT_IGNORE_SPACE = 0x0000_0100;
        const CLIENT_INTERACTIVE = 0x0000_0400;
        const CLIENT_SSL = 0x0000_0800;
        const CLIENT_MULTI_STATEMENTS = 0x0001_0000;
        const CLIENT_MULTI_RESULTS = 0x0002_0000;
        const CLIENT_QUERY_ATTRIBUTES = 0x0800_0000;
    }
}

impl Default for ClientFlags {
    fn default() -> Self {
        ClientFlags::CLIENT_MULTI_STATEMENTS
    }
}

bitflags::bitflags! {
    /// Server status flags reported at the end of a query
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServerStatusFlags: u16 {
        const SERVER_STATUS_IN_TRANS = 0x0001;
        const SERVER_STATUS_AUTOCOMMIT = 0x0002;
        const SERVER_MORE_RESULTS_EXISTS = 0x0008;
        const SERVER_STATUS_NO_GOOD_INDEX_USED = 0x0010;
        const SERVER_STATUS_NO_INDEX_USED = 0x0020;
        const SERVER_STATUS_CURSOR_EXISTS = 0x0040;
        const SERVER_STATUS_LAST_ROW_SENT = 0x0080;
        const SERVER_QUERY_WAS_SLOW = 0x0800;
        const SERVER_SESSION_STATE_CHANGED = 0x4000;
    }
}

/// Compression algorithm negotiated for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zlib,
    Zstd,
    ZstdStream,
    Lz4,
    Lz4Stream,
}

impl Compression {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "zlib" | "true" | "1" => Some(Self::Zlib),
            "zstd" => Some(Self::Zstd),
            "zstd_stream" => Some(Self::ZstdStream),
            "lz4" => Some(Self::Lz4),
            "lz4_stream" => Some(Self::Lz4Stream),
            _ => None,
        }
    }
}
