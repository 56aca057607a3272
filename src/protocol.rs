//! Shared protocol constants for the MeshCentral file-manager tunnel

// Tag carried by relay control messages multiplexed on the data tunnel
pub const CTRL_CHANNEL_ID: u64 = 102938;

// Relay protocol number announced after pairing (5 = files)
pub const RELAY_PROTOCOL_FILES: u8 = 5;

// Upload chunk size; one chunk is in flight at a time
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

// Files above this size skip the hash precheck and upload from offset 0
pub const HASH_CHECK_LIMIT: u64 = 100 * 1024 * 1024;

// Largest payload the streaming decoder will buffer (31-bit length field)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Bounded diagnostics history kept by the error classifier
pub const ERROR_HISTORY_LIMIT: usize = 100;

// Request verbs (client -> server)
pub mod action {
    pub const LS: &str = "ls";
    pub const MKDIR: &str = "mkdir";
    pub const RENAME: &str = "rename";
    pub const RM: &str = "rm";
    pub const COPY: &str = "copy";
    pub const MOVE: &str = "move";
    pub const ZIP: &str = "zip";
    pub const UNZIP: &str = "unzip";
    pub const FINDFILE: &str = "findfile";
    pub const GET: &str = "get";
    pub const SET: &str = "set";
    pub const UPLOAD: &str = "upload";
    pub const UPLOAD_HASH: &str = "uploadhash";
    pub const UPLOAD_DONE: &str = "uploaddone";
    pub const DOWNLOAD: &str = "download";

    // Server -> client only
    pub const UPLOAD_START: &str = "uploadstart";
    pub const UPLOAD_ACK: &str = "uploadack";
    pub const UPLOAD_ERROR: &str = "uploaderror";
    pub const DIALOG_MESSAGE: &str = "dialogmessage";
    pub const ERROR: &str = "error";
    pub const CONNECTED: &str = "connected";
    pub const STATE: &str = "state";
}

// `sub` values of the download sub-protocol
pub mod download_sub {
    pub const START: &str = "start";
    pub const START_ACK: &str = "startack";
    pub const ACK: &str = "ack";
    pub const CANCEL: &str = "cancel";
    pub const ERROR: &str = "error";
}

// `type` values on the relay control channel
pub mod ctrl_type {
    pub const OPTIONS: &str = "options";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const CLOSE: &str = "close";
    pub const CONSOLE: &str = "console";
}

// Directory entry `t` codes
pub mod entry_type {
    pub const LINK: u8 = 1;
    pub const DIR: u8 = 2;
    pub const FILE: u8 = 3;
}

// Centralized timeout constants
pub mod timeouts {
    // Default deadline for a correlated request (ms)
    pub const OPERATION_MS: u64 = 8_000;

    // Backoff before re-sending an upload chunk the transport refused (ms)
    pub const SEND_RETRY_MS: u64 = 25;

    // How long settled request ids are remembered to absorb late duplicates (ms)
    pub const SETTLED_RETENTION_MS: u64 = 60_000;

    // WebSocket connect deadline (ms)
    pub const CONNECT_MS: u64 = 10_000;

    // Idle tick for the client actor when nothing is scheduled (ms)
    pub const IDLE_TICK_MS: u64 = 1_000;
}
