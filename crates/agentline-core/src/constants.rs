//! Shared defaults

/// Application directory name under the user's home directory
pub const CONFIG_DIR_NAME: &str = ".agentline";

/// Config file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Default SQLite database file name
pub const DATABASE_FILE_NAME: &str = "agentline.db";

pub mod server {
    pub const DEFAULT_PORT: u16 = 8000;
    pub const DEFAULT_BIND: &str = "0.0.0.0";
}

pub mod bridge {
    /// Bounded queue between the worker thread and the async consumer
    pub const QUEUE_CAPACITY: usize = 256;
    /// Bytes read from the upstream body per read call
    pub const READ_CHUNK_SIZE: usize = 8192;
    /// Frames that must have been delivered before a truncated body counts as a clean end
    pub const SOFT_TRUNCATION_MIN_FRAMES: usize = 10;
}

pub mod runtime {
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    pub const READ_TIMEOUT_SECS: u64 = 900;
    pub const SESSION_HEADER: &str = "X-Runtime-Session-Id";
    pub const PROMPT_TYPE: &str = "dialog";
}

pub mod query {
    pub const MAX_CONCURRENT_PER_PRINCIPAL: usize = 3;
    pub const DISCONNECT_POLL_MS: u64 = 100;
    /// Characters of the query used for an auto-created session title
    pub const SESSION_TITLE_CHARS: usize = 20;
    /// Unauthorized resource ids listed in a denial message
    pub const DENIED_IDS_SHOWN: usize = 3;
    pub const EVENT_BUFFER: usize = 256;
}
