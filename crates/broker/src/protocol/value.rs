//! Argument values of the wire grammar and their encoding

use bytes::{BufMut, BytesMut};

/// Quoted strings longer than this are sent as literals
const MAX_QUOTED_LEN: usize = 1024;

/// One argument of a request or data response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `NIL`
    Nil,
    /// Bare token such as a command keyword, number or flag
    Atom(String),
    /// Quoted string or literal; arbitrary bytes
    String(Vec<u8>),
    /// Parenthesized list
    List(Vec<Value>),
}

impl Value {
    pub fn atom(s: impl Into<String>) -> Self {
        Value::Atom(s.into())
    }

    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Atom(n.to_string())
    }

    pub fn bool(b: bool) -> Self {
        Value::Atom(if b { "TRUE" } else { "FALSE" }.to_string())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(items)
    }

    /// String value, or `NIL` when absent
    pub fn opt_string(s: Option<&str>) -> Self {
        match s {
            Some(s) => Value::string(s),
            None => Value::Nil,
        }
    }

    /// Text of an atom or a UTF-8 string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Atom(s) => Some(s),
            Value::String(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw bytes of an atom or string
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Atom(s) => Some(s.as_bytes()),
            Value::String(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Atom(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_str()?.to_ascii_uppercase().as_str() {
            "TRUE" | "1" => Some(true),
            "FALSE" | "0" => Some(false),
            _ => None,
        }
    }

    /// Case-insensitive keyword match against an atom
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Value::Atom(s) if s.eq_ignore_ascii_case(keyword))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Append the wire form of this value to `out`
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Value::Nil => out.put_slice(b"NIL"),
            Value::Atom(s) => out.put_slice(s.as_bytes()),
            Value::String(bytes) => encode_string(bytes, out),
            Value::List(items) => {
                out.put_u8(b'(');
                encode_all(items, out);
                out.put_u8(b')');
            }
        }
    }
}

/// Encode values separated by single spaces
pub fn encode_all(values: &[Value], out: &mut BytesMut) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.put_u8(b' ');
        }
        value.encode(out);
    }
}

fn encode_string(bytes: &[u8], out: &mut BytesMut) {
    let quotable = bytes.len() <= MAX_QUOTED_LEN && bytes.iter().all(|b| (0x20..0x7f).contains(b));
    if quotable {
        out.reserve(bytes.len() + 2);
        out.put_u8(b'"');
        for &b in bytes {
            if b == b'"' || b == b'\\' {
                out.put_u8(b'\\');
            }
            out.put_u8(b);
        }
        out.put_u8(b'"');
    } else {
        out.put_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
        out.put_slice(bytes);
    }
}
