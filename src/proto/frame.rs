use std::collections::BTreeMap;

use thiserror::Error;

use super::command::Command;

/// Upper bound on buffered bytes between frame terminators. A module that
/// streams garbage with no newline must not grow the buffer without bound.
const MAX_FRAME_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no frame marker in line: {0:?}")]
    NoMarker(String),
    #[error("unknown frame discriminator: {0:?}")]
    BadDiscriminator(String),
    #[error("malformed length field: {0:?}")]
    BadLength(String),
    #[error("length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame truncated")]
    Truncated,
    #[error("malformed key=value pair: {0:?}")]
    BadPair(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {0}: {1:?}")]
    BadValue(&'static str, String),
    #[error("frame is not valid UTF-8")]
    NotText,
    #[error("receive buffer overflowed without a frame terminator")]
    Oversized,
}

/// Serialize a command to a CRLF-terminated text-mode line.
pub fn encode_command(cmd: &Command) -> String {
    let mut out = String::new();
    out.push_str(cmd.opcode());
    for (key, value) in cmd.params() {
        out.push(',');
        out.push(key);
        out.push('=');
        out.push_str(&value);
    }
    out.push_str("\r\n");
    out
}

pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02X}", b);
    }
    s
}

pub fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Parsed key=value fields of a response or event frame.
#[derive(Debug, Clone, Default)]
pub struct Fields(BTreeMap<String, String>);

impl Fields {
    fn parse(s: &str) -> Result<Self, ParseError> {
        let mut map = BTreeMap::new();
        if s.is_empty() {
            return Ok(Self(map));
        }
        for tok in s.split(',') {
            let Some((k, v)) = tok.split_once('=') else {
                return Err(ParseError::BadPair(tok.to_string()));
            };
            if k.is_empty() {
                return Err(ParseError::BadPair(tok.to_string()));
            }
            map.insert(k.to_string(), v.to_string());
        }
        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn req(&self, key: &'static str) -> Result<&str, ParseError> {
        self.get(key).ok_or(ParseError::MissingField(key))
    }

    pub fn hex_u8(&self, key: &'static str) -> Result<u8, ParseError> {
        let v = self.req(key)?;
        u8::from_str_radix(v, 16).map_err(|_| ParseError::BadValue(key, v.to_string()))
    }

    pub fn hex_u16(&self, key: &'static str) -> Result<u16, ParseError> {
        let v = self.req(key)?;
        u16::from_str_radix(v, 16).map_err(|_| ParseError::BadValue(key, v.to_string()))
    }

    pub fn hex_u32(&self, key: &'static str) -> Result<u32, ParseError> {
        let v = self.req(key)?;
        u32::from_str_radix(v, 16).map_err(|_| ParseError::BadValue(key, v.to_string()))
    }

    pub fn hex_bytes(&self, key: &'static str) -> Result<Vec<u8>, ParseError> {
        let v = self.req(key)?;
        parse_hex(v).ok_or_else(|| ParseError::BadValue(key, v.to_string()))
    }

    pub fn mac(&self, key: &'static str) -> Result<[u8; 6], ParseError> {
        let v = self.req(key)?;
        parse_hex(v)
            .and_then(|b| <[u8; 6]>::try_from(b).ok())
            .ok_or_else(|| ParseError::BadValue(key, v.to_string()))
    }

    /// Signal strength arrives as a two's-complement hex byte.
    pub fn rssi(&self, key: &'static str) -> Result<i8, ParseError> {
        Ok(self.hex_u8(key)? as i8)
    }
}

/// One solicited reply. `result` 0x0000 means success.
#[derive(Debug, Clone)]
pub struct Response {
    pub opcode: String,
    pub result: u16,
    pub fields: Fields,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.result == 0
    }
}

/// One unsolicited event frame.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub fields: Fields,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Response(Response),
    Event(Event),
}

/// Incremental decoder over the raw byte stream. Bytes go in through
/// `extend`, complete frames come out of `next_frame`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or None when more bytes are needed. Blank lines
    /// are skipped; a malformed line is reported once and dropped, frames on
    /// later lines are unaffected.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ParseError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_FRAME_BYTES {
                    self.buf.clear();
                    return Some(Err(ParseError::Oversized));
                }
                return None;
            };
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = match std::str::from_utf8(&raw[..pos]) {
                Ok(s) => s.trim_end_matches('\r'),
                Err(_) => return Some(Err(ParseError::NotText)),
            };
            if line.is_empty() {
                continue;
            }
            return Some(parse_frame(line));
        }
    }
}

/// Parse one full line into a frame. Noise before the `@` marker is skipped
/// so a partial first line after attach still resynchronizes.
pub fn parse_frame(line: &str) -> Result<Frame, ParseError> {
    let Some(at) = line.find('@') else {
        return Err(ParseError::NoMarker(line.to_string()));
    };
    let line = &line[at..];

    let mut parts = line.splitn(3, ',');
    let disc = parts.next().unwrap_or("");
    let len_s = parts.next().ok_or(ParseError::Truncated)?;
    let body = parts.next().ok_or(ParseError::Truncated)?;

    if len_s.len() != 4 {
        return Err(ParseError::BadLength(len_s.to_string()));
    }
    let declared =
        usize::from_str_radix(len_s, 16).map_err(|_| ParseError::BadLength(len_s.to_string()))?;
    if declared != body.len() {
        return Err(ParseError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    match disc {
        "@R" => {
            let mut it = body.splitn(3, ',');
            let opcode = it.next().ok_or(ParseError::Truncated)?;
            let result_s = it.next().ok_or(ParseError::Truncated)?;
            let result = u16::from_str_radix(result_s, 16)
                .map_err(|_| ParseError::BadValue("result", result_s.to_string()))?;
            Ok(Frame::Response(Response {
                opcode: opcode.to_string(),
                result,
                fields: Fields::parse(it.next().unwrap_or(""))?,
            }))
        }
        "@E" => {
            let mut it = body.splitn(2, ',');
            let name = it.next().ok_or(ParseError::Truncated)?;
            Ok(Frame::Event(Event {
                name: name.to_string(),
                fields: Fields::parse(it.next().unwrap_or(""))?,
            }))
        }
        other => Err(ParseError::BadDiscriminator(other.to_string())),
    }
}

/* ---------- tests ---------- */
