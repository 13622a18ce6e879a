//! Server responses

use bytes::{BufMut, BytesMut};

use super::value::{Value, encode_all};
use crate::error::ErrorKind;

/// Completion status of a tagged response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Command was understood but failed
    No,
    /// Command could not be parsed
    Bad,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        }
    }
}

/// One response line (or literal-bearing block) sent to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Untagged data: `* <values>`
    Data(Vec<Value>),
    /// Final tagged completion
    Done {
        tag: String,
        status: Status,
        code: Option<&'static str>,
        text: String,
    },
    /// Untagged `* BYE`, sent before the server closes the connection
    Bye(String),
}

impl Response {
    pub fn data(values: Vec<Value>) -> Self {
        Response::Data(values)
    }

    pub fn ok(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Response::Done {
            tag: tag.into(),
            status: Status::Ok,
            code: None,
            text: text.into(),
        }
    }

    pub fn bad(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Response::Done {
            tag: tag.into(),
            status: Status::Bad,
            code: None,
            text: text.into(),
        }
    }

    /// Failure response for a classified error
    pub fn failure(tag: impl Into<String>, kind: ErrorKind, text: impl Into<String>) -> Self {
        let status = if kind == ErrorKind::Syntax {
            Status::Bad
        } else {
            Status::No
        };
        Response::Done {
            tag: tag.into(),
            status,
            code: kind.code(),
            text: text.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Response::Done { .. })
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            Response::Done { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Append the wire form of this response, including the line ending
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Response::Data(values) => {
                out.put_slice(b"* ");
                encode_all(values, out);
            }
            Response::Done {
                tag,
                status,
                code,
                text,
            } => {
                out.put_slice(tag.as_bytes());
                out.put_u8(b' ');
                out.put_slice(status.as_str().as_bytes());
                if let Some(code) = code {
                    out.put_slice(format!(" [{}]", code).as_bytes());
                }
                if !text.is_empty() {
                    out.put_u8(b' ');
                    // text is free-form but must stay on one line
                    out.put_slice(text.replace(['\r', '\n'], " ").as_bytes());
                }
            }
            Response::Bye(text) => {
                out.put_slice(b"* BYE ");
                out.put_slice(text.as_bytes());
            }
        }
        out.put_slice(b"\r\n");
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_data() {
        let response = Response::data(vec![Value::int(4), Value::list(vec![Value::atom("REV"), Value::int(2)])]);
        assert_eq!(&response.to_bytes()[..], b"* 4 (REV 2)\r\n");
    }

    #[test]
    fn test_encode_failure_with_code() {
        let response = Response::failure("a7", ErrorKind::Conflict, "Item 3 was modified\nconcurrently");
        assert_eq!(
            &response.to_bytes()[..],
            b"a7 NO [CONFLICT] Item 3 was modified concurrently\r\n"
        );
    }

    #[test]
    fn test_syntax_failure_is_bad() {
        let response = Response::failure("1", ErrorKind::Syntax, "Unknown command FOO");
        assert_eq!(response.status(), Some(Status::Bad));
        assert_eq!(&response.to_bytes()[..], b"1 BAD Unknown command FOO\r\n");
    }
}
