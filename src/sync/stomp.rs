//! Minimal STOMP 1.2 framing for the push channel.
//!
//! Frames travel as WebSocket text messages. A message made only of EOLs is
//! a heart-beat.

use std::time::Duration;

use crate::error::{Result, SyncError};

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
    pub fn as_str(&self) -> &'static str {
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

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            _ => return None,
        })
    }

    // CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Parse every frame in one WebSocket text message. Heart-beats yield no frames.
pub fn parse_frames(input: &str) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut cursor = 0;

    loop {
        let rest = &input[cursor..];
        let skipped = rest.len() - rest.trim_start_matches(['\n', '\r']).len();
        cursor += skipped;
        if cursor >= input.len() {
            break;
        }
        let (frame, consumed) = parse_frame(&input[cursor..])?;
        frames.push(frame);
        cursor += consumed;
    }

    Ok(frames)
}

fn read_line<'a>(input: &'a str, cursor: &mut usize) -> Option<&'a str> {
    let rest = &input[*cursor..];
    let end = rest.find('\n')?;
    *cursor += end + 1;
    let line = &rest[..end];
    Some(line.strip_suffix('\r').unwrap_or(line))
}

fn malformed(detail: &str) -> SyncError {
    SyncError::Connection(format!("malformed STOMP frame: {}", detail))
}

fn parse_frame(input: &str) -> Result<(Frame, usize)> {
    let mut cursor = 0;
    let command_line = read_line(input, &mut cursor).ok_or_else(|| malformed("missing command"))?;
    let command = Command::parse(command_line).ok_or_else(|| malformed(command_line))?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = read_line(input, &mut cursor).ok_or_else(|| malformed("unterminated headers"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| malformed(line))?;
        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| value.trim().parse::<usize>().map_err(|_| malformed("bad content-length")))
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            let end = cursor
                .checked_add(len)
                .ok_or_else(|| malformed("bad content-length"))?;
            if input.as_bytes().get(end) != Some(&0) {
                return Err(malformed("body does not match content-length"));
            }
            end
        }
        None => cursor + input[cursor..].find('\0').ok_or_else(|| malformed("missing NUL terminator"))?,
    };

    let body = input
        .get(cursor..body_end)
        .ok_or_else(|| malformed("body is not valid UTF-8"))?
        .to_string();

    Ok((Frame { command, headers, body }, body_end + 1))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(malformed("invalid header escape")),
        }
    }
    Ok(out)
}

/// `heart-beat` header value for the given send/receive intervals
pub fn heartbeat_header(outgoing: Duration, incoming: Duration) -> String {
    format!("{},{}", outgoing.as_millis(), incoming.as_millis())
}

/// Effective (send, receive) heart-beat intervals.
///
/// Each direction is active only if both sides ask for it, at the slower
/// of the two rates.
pub fn negotiate_heartbeat(
    outgoing: Duration,
    incoming: Duration,
    server_header: Option<&str>,
) -> (Option<Duration>, Option<Duration>) {
    let (server_send, server_receive) = server_header
        .and_then(|raw| {
            let (sx, sy) = raw.split_once(',')?;
            Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?))
        })
        .unwrap_or((0, 0));

    let combine = |ours: Duration, theirs: u64| {
        if ours.is_zero() || theirs == 0 {
            None
        } else {
            Some(ours.max(Duration::from_millis(theirs)))
        }
    };

    (combine(outgoing, server_receive), combine(incoming, server_send))
}
