//! Wire messages: outbound requests and the decoded inbound message union
//!
//! Inbound JSON is decoded once, at the transport boundary, into
//! [`ServerMessage`]; the manager matches on it exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::protocol::{action, ctrl_type, download_sub, entry_type, CTRL_CHANNEL_ID};

/// Directory entry kind (`t` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Link,
    Dir,
    File,
}

impl EntryKind {
    pub fn from_code(code: u64) -> Option<Self> {
        match u8::try_from(code).ok()? {
            entry_type::LINK => Some(EntryKind::Link),
            entry_type::DIR => Some(EntryKind::Dir),
            entry_type::FILE => Some(EntryKind::File),
            _ => None,
        }
    }
}

/// Read-only snapshot of one listing row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<i64>,
    pub path: Option<String>,
}

impl FileEntry {
    /// Drives/links and directories can be navigated into
    pub fn is_container(&self) -> bool {
        matches!(self.kind, EntryKind::Link | EntryKind::Dir)
    }

    /// Parse one `{n,t,s,d}` row; rows without a name or known type are skipped
    pub fn from_value(v: &Value) -> Option<Self> {
        let name = v.get("n")?.as_str()?.to_string();
        let kind = EntryKind::from_code(v.get("t")?.as_u64()?)?;
        let size = v
            .get("s")
            .and_then(|s| s.as_u64().or_else(|| s.as_f64().map(|f| f.max(0.0) as u64)))
            .unwrap_or(0);
        let modified = v
            .get("d")
            .and_then(|d| d.as_i64().or_else(|| d.as_f64().map(|f| f as i64)));
        let path = v.get("path").and_then(Value::as_str).map(str::to_string);
        Some(FileEntry {
            name,
            kind,
            size,
            modified,
            path,
        })
    }
}

/// Parse an array of listing rows, dropping malformed ones
pub fn parse_entries(v: Option<&Value>) -> Vec<FileEntry> {
    v.and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(FileEntry::from_value).collect())
        .unwrap_or_default()
}

/// `tag` of an `uploadhash` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashTag {
    #[serde(rename = "h")]
    pub hash: String,
    #[serde(rename = "s")]
    pub size: u64,
    pub skip: bool,
}

/// Download sub-protocol verbs sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadSub {
    Start,
    StartAck,
    Ack,
    Cancel,
}

/// Client -> agent request, serialized as `{"action": "<verb>", ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Request {
    Ls {
        reqid: String,
        path: String,
    },
    Mkdir {
        reqid: String,
        path: String,
    },
    Rename {
        reqid: String,
        path: String,
        oldname: String,
        newname: String,
    },
    Rm {
        reqid: String,
        path: String,
        delfiles: Vec<String>,
        rec: bool,
    },
    Copy {
        reqid: String,
        scpath: String,
        dspath: String,
        names: Vec<String>,
    },
    Move {
        reqid: String,
        scpath: String,
        dspath: String,
        names: Vec<String>,
    },
    Zip {
        reqid: String,
        path: String,
        files: Vec<String>,
        zipname: String,
    },
    Unzip {
        reqid: String,
        path: String,
        file: String,
    },
    FindFile {
        reqid: String,
        path: String,
        filter: String,
    },
    Get {
        reqid: String,
        path: String,
        file: String,
    },
    Set {
        reqid: String,
        path: String,
        file: String,
        data: String,
    },
    Upload {
        reqid: String,
        path: String,
        name: String,
        size: u64,
        append: bool,
    },
    UploadHash {
        reqid: String,
        path: String,
        name: String,
        tag: HashTag,
    },
    UploadDone {
        reqid: String,
    },
    Download {
        sub: DownloadSub,
        id: String,
        path: String,
    },
}

impl Request {
    /// Correlation id (`reqid`, or `id` for the download sub-protocol)
    pub fn reqid(&self) -> &str {
        match self {
            Request::Ls { reqid, .. }
            | Request::Mkdir { reqid, .. }
            | Request::Rename { reqid, .. }
            | Request::Rm { reqid, .. }
            | Request::Copy { reqid, .. }
            | Request::Move { reqid, .. }
            | Request::Zip { reqid, .. }
            | Request::Unzip { reqid, .. }
            | Request::FindFile { reqid, .. }
            | Request::Get { reqid, .. }
            | Request::Set { reqid, .. }
            | Request::Upload { reqid, .. }
            | Request::UploadHash { reqid, .. }
            | Request::UploadDone { reqid } => reqid,
            Request::Download { id, .. } => id,
        }
    }

    pub fn is_listing(&self) -> bool {
        matches!(self, Request::Ls { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Relay control envelope: `{"ctrlChannel": 102938, "type": kind, ...fields}`
pub fn ctrl_message(kind: &str, fields: Value) -> Value {
    let mut out = Map::new();
    out.insert("ctrlChannel".into(), json!(CTRL_CHANNEL_ID));
    out.insert("type".into(), json!(kind));
    if let Value::Object(extra) = fields {
        for (k, v) in extra {
            out.entry(k).or_insert(v);
        }
    }
    Value::Object(out)
}

/// True when a JSON value carries the relay control-channel tag (numeric or string)
pub fn is_ctrl_message(v: &Value) -> bool {
    match v.get("ctrlChannel") {
        Some(Value::Number(n)) => n.as_u64() == Some(CTRL_CHANNEL_ID),
        Some(Value::String(s)) => s.parse::<u64>().ok() == Some(CTRL_CHANNEL_ID),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CtrlMessage {
    Ping,
    Pong,
    Options(Value),
    Close { reason: Option<String> },
    Console { msg: Option<String> },
    Other(Value),
}

impl CtrlMessage {
    pub fn from_value(v: Value) -> Self {
        let text = |key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
        match v.get("type").and_then(Value::as_str) {
            Some(ctrl_type::PING) => CtrlMessage::Ping,
            Some(ctrl_type::PONG) => CtrlMessage::Pong,
            Some(ctrl_type::CLOSE) => CtrlMessage::Close {
                reason: text("reason"),
            },
            Some(ctrl_type::CONSOLE) => CtrlMessage::Console { msg: text("msg") },
            Some(ctrl_type::OPTIONS) => CtrlMessage::Options(v),
            _ => CtrlMessage::Other(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryListing {
    pub reqid: Option<String>,
    pub path: Option<String>,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadControl {
    /// `offset` absent: continue from wherever the hash precheck left off
    Start { reqid: String, offset: Option<u64> },
    Ack { reqid: String, offset: Option<u64> },
    Hash { reqid: String, exists: bool, offset: Option<u64> },
    Done { reqid: String },
    Error { reqid: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadControl {
    Start {
        id: String,
        size: Option<u64>,
        name: Option<String>,
    },
    Cancel {
        id: String,
        reason: Option<String>,
    },
    Error {
        id: String,
        error: String,
    },
    Other {
        id: String,
        sub: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub reqid: Option<String>,
    pub error: String,
    pub raw: Value,
}

/// Generic `{reqid, result|action|error}` reply
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub reqid: Option<String>,
    pub action: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ctrl(CtrlMessage),
    Listing(DirectoryListing),
    Upload(UploadControl),
    Download(DownloadControl),
    Dialog(Option<String>),
    Error(ErrorMessage),
    Connected,
    Response(OperationResponse),
    Ignored,
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn num_field(v: &Value, key: &str) -> Option<u64> {
    v.get(key)
        .and_then(|n| n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)))
}

fn offset_field(v: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| num_field(v, k))
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Decode one JSON text message
pub fn decode_text(text: &str) -> serde_json::Result<ServerMessage> {
    let v: Value = serde_json::from_str(text)?;
    Ok(decode_value(v))
}

pub fn decode_value(v: Value) -> ServerMessage {
    if is_ctrl_message(&v) {
        return ServerMessage::Ctrl(CtrlMessage::from_value(v));
    }

    let act = str_field(&v, "action");
    let Some(act) = act else {
        if v.get("dir").is_some() {
            return ServerMessage::Listing(decode_listing(&v));
        }
        if v.get("error").is_none() && v.get("result").is_none() {
            return ServerMessage::Ignored;
        }
        return ServerMessage::Response(decode_response(v, None));
    };

    let reqid = || str_field(&v, "reqid").unwrap_or_default();
    match act.as_str() {
        action::LS => ServerMessage::Listing(decode_listing(&v)),
        action::DOWNLOAD => decode_download(&v),
        action::UPLOAD_START => ServerMessage::Upload(UploadControl::Start {
            reqid: reqid(),
            offset: offset_field(&v, &["nextofs", "position", "offset"]),
        }),
        action::UPLOAD_ACK => ServerMessage::Upload(UploadControl::Ack {
            reqid: reqid(),
            offset: offset_field(&v, &["nextofs", "position", "offset"]),
        }),
        action::UPLOAD_HASH => ServerMessage::Upload(UploadControl::Hash {
            reqid: reqid(),
            exists: truthy(v.get("exists")),
            offset: offset_field(&v, &["nextofs", "offset"]),
        }),
        action::UPLOAD_DONE => ServerMessage::Upload(UploadControl::Done { reqid: reqid() }),
        action::UPLOAD_ERROR => ServerMessage::Upload(UploadControl::Error {
            reqid: reqid(),
            error: str_field(&v, "error").unwrap_or_else(|| "Upload failed".to_string()),
        }),
        action::DIALOG_MESSAGE => ServerMessage::Dialog(str_field(&v, "msg")),
        action::ERROR => ServerMessage::Error(ErrorMessage {
            reqid: str_field(&v, "reqid"),
            error: str_field(&v, "error").unwrap_or_else(|| "Operation failed".to_string()),
            raw: v,
        }),
        action::CONNECTED | action::STATE => {
            let state_ready = num_field(&v, "state") == Some(3);
            let connected = v.get("connected").and_then(Value::as_bool) == Some(true);
            if state_ready || connected {
                ServerMessage::Connected
            } else {
                ServerMessage::Ignored
            }
        }
        _ => ServerMessage::Response(decode_response(v, Some(act))),
    }
}

fn decode_listing(v: &Value) -> DirectoryListing {
    DirectoryListing {
        reqid: str_field(v, "reqid"),
        path: str_field(v, "path"),
        entries: parse_entries(v.get("dir")),
    }
}

fn decode_download(v: &Value) -> ServerMessage {
    let Some(id) = str_field(v, "id") else {
        return ServerMessage::Ignored;
    };
    let sub = str_field(v, "sub").unwrap_or_default();
    let ctl = match sub.as_str() {
        download_sub::START => DownloadControl::Start {
            id,
            size: num_field(v, "size"),
            name: str_field(v, "name"),
        },
        download_sub::CANCEL => DownloadControl::Cancel {
            id,
            reason: str_field(v, "reason"),
        },
        download_sub::ERROR => DownloadControl::Error {
            id,
            error: str_field(v, "error").unwrap_or_else(|| "Download failed".to_string()),
        },
        _ => DownloadControl::Other { id, sub },
    };
    ServerMessage::Download(ctl)
}

fn decode_response(v: Value, act: Option<String>) -> OperationResponse {
    OperationResponse {
        reqid: str_field(&v, "reqid"),
        action: act,
        result: v.get("result").cloned(),
        error: str_field(&v, "error"),
        body: v,
    }
}
