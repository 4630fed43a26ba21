//! STOMP 1.2 frame codec.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown STOMP command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid header escape sequence")]
    InvalidEscape,
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
    #[error("frame is missing its NUL terminator")]
    Unterminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Returns the first value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(b':');
            push_header_part(&mut out, value, escape);
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decodes the first frame in `input`.
    ///
    /// Returns the frame and the number of bytes consumed, or `None` when the
    /// input holds nothing but heart-beat end-of-lines.
    pub fn decode(input: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        let start = input
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(input.len());
        if start == input.len() {
            return Ok(None);
        }

        let mut cursor = start;
        let command_line = next_line(input, &mut cursor)?;
        let command = Command::parse(command_line)?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = next_line(input, &mut cursor)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            let (name, value) = if escape {
                (unescape(name)?, unescape(value)?)
            } else {
                (name.to_string(), value.to_string())
            };
            headers.push((name, value));
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.trim().parse::<usize>().ok());
        let body_end = match content_length {
            Some(len) => {
                let end = cursor.checked_add(len).ok_or(FrameError::Unterminated)?;
                if input.len() <= end || input[end] != 0 {
                    return Err(FrameError::Unterminated);
                }
                end
            }
            None => input[cursor..]
                .iter()
                .position(|b| *b == 0)
                .map(|offset| cursor + offset)
                .ok_or(FrameError::Unterminated)?,
        };

        let frame = Frame {
            command,
            headers,
            body: Bytes::copy_from_slice(&input[cursor..body_end]),
        };
        Ok(Some((frame, body_end + 1)))
    }
}

fn next_line<'a>(input: &'a [u8], cursor: &mut usize) -> Result<&'a str, FrameError> {
    let rest = &input[*cursor..];
    let len = rest
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(FrameError::Unterminated)?;
    *cursor += len + 1;
    let line = rest[..len].strip_suffix(b"\r").unwrap_or(&rest[..len]);
    std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)
}

fn push_header_part(out: &mut Vec<u8>, raw: &str, escape: bool) {
    if !escape {
        out.extend_from_slice(raw.as_bytes());
        return;
    }
    for ch in raw.chars() {
        match ch {
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            ':' => out.extend_from_slice(b"\\c"),
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_content_length_is_rejected() {
        let input = b"MESSAGE\ncontent-length:18446744073709551615\n\nx\0";
        assert_eq!(Frame::decode(input), Err(FrameError::Unterminated));

        let input = b"MESSAGE\ncontent-length:100\n\nx\0";
        assert_eq!(Frame::decode(input), Err(FrameError::Unterminated));
    }

    #[test]
    fn encodes_send_frame_with_content_length() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/app/connect")
            .body(Bytes::from_static(b"{}"));
        let encoded = frame.encode();
        assert_eq!(
            encoded,
            b"SEND\ndestination:/app/connect\ncontent-length:2\n\n{}\0".to_vec()
        );
    }

    #[test]
    fn decodes_message_frame_from_server() {
        let raw = b"MESSAGE\ndestination:/topic/connect/a@x.com/u1\nsubscription:sub-0\nmessage-id:1\n\n{\"error\":\"SUCCESS\"}\0";
        let (frame, consumed) = Frame::decode(raw).expect("decode").expect("frame");
        assert_eq!(consumed, raw.len());
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("destination"), Some("/topic/connect/a@x.com/u1"));
        assert_eq!(frame.body, Bytes::from_static(b"{\"error\":\"SUCCESS\"}"));
    }

    #[test]
    fn heartbeats_decode_to_nothing() {
        assert_eq!(Frame::decode(b"\n\r\n").expect("decode"), None);
    }

    #[test]
    fn escapes_header_values_outside_connect() {
        let frame = Frame::new(Command::Subscribe).header("destination", "a:b\\c");
        let encoded = frame.encode();
        assert!(encoded.starts_with(b"SUBSCRIBE\ndestination:a\\cb\\\\c\n"));
        let (decoded, _) = Frame::decode(&encoded).expect("decode").expect("frame");
        assert_eq!(decoded.get("destination"), Some("a:b\\c"));
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let frame = Frame::new(Command::Connect).header("host", "api:8080");
        assert!(frame.encode().starts_with(b"CONNECT\nhost:api:8080\n"));
    }

    #[test]
    fn content_length_allows_embedded_nul() {
        let raw = b"MESSAGE\ncontent-length:3\n\na\0b\0";
        let (frame, _) = Frame::decode(raw).expect("decode").expect("frame");
        assert_eq!(frame.body, Bytes::from_static(b"a\0b"));
    }

    #[test]
    fn decodes_consecutive_frames() {
        let mut raw = Frame::new(Command::Receipt).header("receipt-id", "1").encode();
        raw.extend(Frame::new(Command::Receipt).header("receipt-id", "2").encode());
        let (first, used) = Frame::decode(&raw).expect("decode").expect("first");
        let (second, _) = Frame::decode(&raw[used..]).expect("decode").expect("second");
        assert_eq!(first.get("receipt-id"), Some("1"));
        assert_eq!(second.get("receipt-id"), Some("2"));
    }

    #[test]
    fn rejects_unknown_commands_and_truncation() {
        assert_eq!(
            Frame::decode(b"PING\n\n\0"),
            Err(FrameError::UnknownCommand("PING".into()))
        );
        assert_eq!(
            Frame::decode(b"MESSAGE\ndestination:x\n\nbody"),
            Err(FrameError::Unterminated)
        );
    }
}
