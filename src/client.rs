//! Engine-owned client records.
//!
//! The network layer is an external collaborator; what the engine keeps
//! per client is the reply buffer, the selected database, the MULTI
//! flag and the blocking state used by the list wait queues.

use bytes::Bytes;

use crate::list_value::ListEnd;

pub type ClientId = u64;

/// Structured reply values appended to a client's buffer. Wire encoding
/// is left to the serving layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Simple(String),
    Bulk(Bytes),
    Int(i64),
    Nil,
    NilArray,
    Array(Vec<Reply>),
    Error(String),
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    pub fn bulk(bytes: impl Into<Bytes>) -> Reply {
        Reply::Bulk(bytes.into())
    }
}

/// What a blocked client is waiting for.
#[derive(Debug, Default)]
pub struct BlockingState {
    /// Keys the client blocks on, registration order, deduplicated.
    pub keys: Vec<Bytes>,
    /// Absolute unix-ms deadline, None blocks forever.
    pub deadline_ms: Option<i64>,
    /// Destination key of the atomic-move variant.
    pub target: Option<Bytes>,
    /// Which end to pop when the key becomes ready. Recorded at block
    /// time so the waker never inspects command identity.
    pub end: ListEnd,
}

pub struct Client {
    pub id: ClientId,
    /// Index of the selected database.
    pub db: usize,
    /// Inside a MULTI block; blocking commands degrade to immediate
    /// null replies there.
    pub in_multi: bool,
    pub blocked: bool,
    pub blocking: BlockingState,
    replies: Vec<Reply>,
}

impl Client {
    pub fn new(id: ClientId) -> Self {
        Client {
            id,
            db: 0,
            in_multi: false,
            blocked: false,
            blocking: BlockingState::default(),
            replies: Vec::new(),
        }
    }

    pub fn add_reply(&mut self, reply: Reply) {
        self.replies.push(reply);
    }

    pub fn add_reply_bulk(&mut self, bytes: Bytes) {
        self.replies.push(Reply::Bulk(bytes));
    }

    pub fn add_reply_int(&mut self, n: i64) {
        self.replies.push(Reply::Int(n));
    }

    pub fn add_reply_nil(&mut self) {
        self.replies.push(Reply::Nil);
    }

    pub fn add_reply_error(&mut self, text: String) {
        self.replies.push(Reply::Error(text));
    }

    /// Drains the buffered replies, oldest first.
    pub fn take_replies(&mut self) -> Vec<Reply> {
        std::mem::take(&mut self.replies)
    }
}
