//! Incremental request decoder
//!
//! Decodes `<tag> <COMMAND> <args...>` frames from a growing read buffer.
//! A frame may span several lines when it carries `{n}` literals; the decoder
//! reports `Incomplete` until every literal byte has arrived.

use bytes::{Buf, BytesMut};

use super::value::Value;
use super::{DecodeError, DecodeResult};

/// Largest literal accepted in a single request
pub const MAX_LITERAL_SIZE: usize = 64 * 1024 * 1024;

/// Deepest list nesting accepted
const MAX_DEPTH: usize = 32;

/// A decoded request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: String,
    /// Command name, upper-cased
    pub name: String,
    pub args: Vec<Value>,
}

/// Why a scan stopped early
enum Stop {
    Incomplete,
    Invalid(String),
}

type Scan<T> = std::result::Result<T, Stop>;

/// Decode one frame from the front of `buffer`.
///
/// On `Complete` the frame's bytes are consumed. On `Invalid` the offending
/// frame, literals included, is consumed so the caller can answer `BAD` and
/// keep reading.
pub fn decode_frame(buffer: &mut BytesMut) -> DecodeResult<Frame> {
    let blank = buffer.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
    buffer.advance(blank);
    if buffer.is_empty() {
        return DecodeResult::Incomplete;
    }

    let mut cursor = Cursor::new(&buffer[..]);
    match cursor.frame() {
        Ok(frame) => {
            let used = cursor.pos;
            buffer.advance(used);
            DecodeResult::Complete(frame)
        }
        Err(Stop::Incomplete) => DecodeResult::Incomplete,
        Err(Stop::Invalid(reason)) => {
            // wait for the rest of the frame before discarding it
            let Some(end) = frame_end(&buffer[..], cursor.pos) else {
                return DecodeResult::Incomplete;
            };
            let tag = leading_tag(&buffer[..]);
            buffer.advance(end);
            DecodeResult::Invalid(DecodeError { tag, reason })
        }
    }
}

/// Offset just past the last line of a frame whose scan stopped at `from`.
///
/// Literals before `from` were already stepped over by the scan. Any line
/// after it that announces a literal is followed by that many raw bytes,
/// which belong to the same frame and are skipped without being parsed.
fn frame_end(data: &[u8], from: usize) -> Option<usize> {
    let mut line_start = 0;
    let mut pos = from;
    loop {
        let newline = pos + data[pos..].iter().position(|b| *b == b'\n')?;
        match announced_literal(&data[line_start..newline]) {
            Some(size) if size <= MAX_LITERAL_SIZE => {
                pos = newline + 1 + size;
                if pos > data.len() {
                    return None;
                }
                line_start = pos;
            }
            _ => return Some(newline + 1),
        }
    }
}

/// Size of the `{n}` or `{n+}` literal a line ends with
fn announced_literal(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = line.strip_suffix(b"}")?;
    let line = line.strip_suffix(b"+").unwrap_or(line);
    let digits = line.len() - line.iter().rev().take_while(|b| b.is_ascii_digit()).count();
    if digits == line.len() || line[..digits].last() != Some(&b'{') {
        return None;
    }
    std::str::from_utf8(&line[digits..]).ok()?.parse().ok()
}

/// First token of a line, used to tag a `BAD` response
fn leading_tag(line: &[u8]) -> Option<String> {
    let token: Vec<u8> = line
        .iter()
        .take_while(|b| is_atom_byte(**b))
        .copied()
        .collect();
    if token.is_empty() {
        None
    } else {
        String::from_utf8(token).ok()
    }
}

fn is_atom_byte(b: u8) -> bool {
    !matches!(b, b' ' | b'(' | b')' | b'"' | b'\r' | b'\n') && b >= 0x20 && b != 0x7f
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Scan<u8> {
        self.data.get(self.pos).copied().ok_or(Stop::Incomplete)
    }

    fn frame(&mut self) -> Scan<Frame> {
        let tag = self.atom()?;
        if self.at_line_end()? {
            return Err(Stop::Invalid("Missing command name".into()));
        }
        self.expect(b' ')?;
        let name = self.atom()?.to_ascii_uppercase();

        let mut args = Vec::new();
        loop {
            if self.at_line_end()? {
                self.consume_line_end()?;
                break;
            }
            self.expect(b' ')?;
            if self.at_line_end()? {
                // tolerate trailing whitespace
                continue;
            }
            args.push(self.value(0)?);
        }

        Ok(Frame { tag, name, args })
    }

    fn at_line_end(&self) -> Scan<bool> {
        Ok(matches!(self.peek()?, b'\r' | b'\n'))
    }

    fn consume_line_end(&mut self) -> Scan<()> {
        match self.peek()? {
            b'\n' => {
                self.pos += 1;
                Ok(())
            }
            b'\r' => {
                self.pos += 1;
                match self.peek()? {
                    b'\n' => {
                        self.pos += 1;
                        Ok(())
                    }
                    _ => Err(Stop::Invalid("Stray carriage return".into())),
                }
            }
            _ => Err(Stop::Invalid("Expected end of line".into())),
        }
    }

    fn expect(&mut self, byte: u8) -> Scan<()> {
        let found = self.peek()?;
        if found == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(Stop::Invalid(format!(
                "Expected '{}' but found '{}'",
                byte as char,
                found.escape_ascii()
            )))
        }
    }

    fn atom(&mut self) -> Scan<String> {
        let start = self.pos;
        while is_atom_byte(self.peek()?) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(Stop::Invalid(format!(
                "Expected atom but found '{}'",
                self.data[self.pos].escape_ascii()
            )));
        }
        String::from_utf8(self.data[start..self.pos].to_vec())
            .map_err(|_| Stop::Invalid("Atom is not valid UTF-8".into()))
    }

    fn value(&mut self, depth: usize) -> Scan<Value> {
        match self.peek()? {
            b'(' => self.list(depth),
            b'"' => self.quoted(),
            b'{' => self.literal(),
            b')' => Err(Stop::Invalid("Unbalanced ')'".into())),
            _ => {
                let atom = self.atom()?;
                if atom.eq_ignore_ascii_case("NIL") {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::Atom(atom))
                }
            }
        }
    }

    fn list(&mut self, depth: usize) -> Scan<Value> {
        if depth >= MAX_DEPTH {
            return Err(Stop::Invalid("Lists nested too deeply".into()));
        }
        self.expect(b'(')?;
        let mut items = Vec::new();
        loop {
            match self.peek()? {
                b')' => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                b' ' => self.pos += 1,
                b'\r' | b'\n' => return Err(Stop::Invalid("Unterminated list".into())),
                _ => items.push(self.value(depth + 1)?),
            }
        }
    }

    fn quoted(&mut self) -> Scan<Value> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.peek()? {
                b'"' => {
                    self.pos += 1;
                    return Ok(Value::String(out));
                }
                b'\\' => {
                    self.pos += 1;
                    let escaped = self.peek()?;
                    match escaped {
                        b'"' | b'\\' => out.push(escaped),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        other => {
                            return Err(Stop::Invalid(format!(
                                "Invalid escape '\\{}'",
                                other.escape_ascii()
                            )));
                        }
                    }
                    self.pos += 1;
                }
                b'\r' | b'\n' => return Err(Stop::Invalid("Unterminated quoted string".into())),
                b => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn literal(&mut self) -> Scan<Value> {
        self.expect(b'{')?;
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        if digits.is_empty() {
            return Err(Stop::Invalid("Literal without length".into()));
        }
        let size: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Stop::Invalid("Literal length out of range".into()))?;
        if size > MAX_LITERAL_SIZE {
            return Err(Stop::Invalid(format!("Literal of {} bytes is too large", size)));
        }
        if self.peek()? == b'+' {
            self.pos += 1;
        }
        self.expect(b'}')?;
        self.consume_line_end()?;

        if self.data.len() < self.pos + size {
            return Err(Stop::Incomplete);
        }
        let bytes = self.data[self.pos..self.pos + size].to_vec();
        self.pos += size;
        Ok(Value::String(bytes))
    }
}
