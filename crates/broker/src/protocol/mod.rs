//! Wire protocol: framing, argument grammar, typed commands and responses
//!
//! Requests are tagged, line-oriented frames. Arguments are atoms, quoted
//! strings, `{n}` literals or parenthesized lists. Every request receives
//! zero or more untagged data responses followed by exactly one tagged
//! completion.

pub mod command;
pub mod encode;
pub mod parser;
pub mod response;
pub mod value;

pub use command::{
    CollectionScope, Command, CreateOptions, Depth, FetchScope, ItemScope, ListOptions, NewItem,
    SearchScope, SyncTarget, UidSet,
};
pub use parser::{Frame, decode_frame};
pub use response::{Response, Status};
pub use value::Value;

/// Result of decoding a frame from the wire
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded
    Complete(T),
    /// More data is needed to complete the frame
    Incomplete,
    /// The input is malformed; the bad line has been consumed
    Invalid(DecodeError),
}

/// A malformed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Tag of the failed request when one could be read
    pub tag: Option<String>,
    pub reason: String,
}
