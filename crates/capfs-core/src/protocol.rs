//! Wire protocol definitions
//!
//! All network messages are defined here. Messages are serialized with bincode
//! and prefixed with a 4-byte little-endian length.
//!
//! The protocol is symmetric: both peers keep an export table of local
//! objects the other side may call. A [`CapDescriptor`] always names an entry
//! in the export table of whoever *sent* the message carrying it. Export id
//! [`MAIN_CAP`] is reserved for the serving side's [`crate::MainView`].

use serde::{Deserialize, Serialize};

use crate::error::ErrorMessage;
use crate::types::{CapKind, DirectoryEntry, StatInfo};

/// Index into a peer's export table
pub type CapId = u64;

/// Correlates a `Call` with its `Return`
pub type QuestionId = u64;

/// Export id of the main view on the serving side
pub const MAIN_CAP: CapId = 0;

/// All possible network messages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcMessage {
    // Handshake
    Hello(HelloMessage),

    // Invocation
    Call(CallMessage),
    Return(ReturnMessage),

    // Lifecycle
    Release(ReleaseMessage),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u32,
}

/// Reference to an object in the sender's export table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapDescriptor {
    pub id: CapId,
    pub kind: CapKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallMessage {
    pub question: QuestionId,
    pub target: CapId,
    pub method: Method,
}

/// Every invocable method, grouped by the interface that offers it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Method {
    // MainView
    Root,
    Restore { token: Vec<u8> },

    // Node
    Stat,
    Save,

    // Directory
    List { sink: CapDescriptor },
    Walk { name: String },

    // RwDirectory
    Create { name: String, executable: bool },
    Mkdir { name: String },
    Delete { name: String },

    // File
    Read {
        start_at: i64,
        amount: u64,
        sink: CapDescriptor,
    },

    // RwFile
    Write { start_at: i64 },
    SetExec { exec: bool },
    Truncate { size: u64 },

    // EntrySink
    Push { entries: Vec<DirectoryEntry> },
    EntriesDone,

    // ByteStream
    WriteBytes { data: Vec<u8> },
    BytesDone,
    ExpectSize { size: u64 },

    // Handle
    Cancel,
}

impl Method {
    /// Capabilities carried by this call (exported by the caller)
    pub fn descriptors(&self) -> Vec<CapDescriptor> {
        match self {
            Method::List { sink } | Method::Read { sink, .. } => vec![*sink],
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReturnMessage {
    pub question: QuestionId,
    pub result: Result<Payload, ErrorMessage>,
}

/// Successful result of a call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    Unit,
    Stat(StatInfo),
    Token(Vec<u8>),
    Capability(CapDescriptor),
    WriteSession {
        sink: CapDescriptor,
        cancel: CapDescriptor,
    },
}

impl Payload {
    /// Capabilities carried by this result (exported by the callee)
    pub fn descriptors(&self) -> Vec<CapDescriptor> {
        match self {
            Payload::Capability(d) => vec![*d],
            Payload::WriteSession { sink, cancel } => vec![*sink, *cancel],
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseMessage {
    pub id: CapId,
}

// === Serialization ===

/// Serialize a message with length prefix
pub fn serialize_message(msg: &RpcMessage) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(msg)?;
    let len = payload.len() as u32;

    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Deserialize a message (without length prefix)
pub fn deserialize_message(data: &[u8]) -> Result<RpcMessage, bincode::Error> {
    bincode::deserialize(data)
}
