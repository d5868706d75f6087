//! Parser for the `<gfn> [pid]` request text written to the endpoint.
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("request contains no gfn token")]
    MissingGfn,
    #[error("token {token:?} is not an unsigned integer")]
    InvalidNumber { token: String },
}

/// One translation request. Only lives for the duration of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Full guest physical address. Despite the name, the low 12 bits carry the in-page offset
    pub raw_gfn: u64,
    /// pid of the process owning the target VM
    pub vm_pid: Option<u64>,
}

impl Request {
    pub fn has_pid(&self) -> bool {
        self.vm_pid.is_some()
    }
}

const DELIMITERS: &[u8] = b" \t\n";

/// Parse the raw payload of a write.
///
/// Everything after the first NUL byte is ignored. Tokens are separated by space, tab
/// or newline; empty tokens are skipped. The first token is the gfn, the optional second
/// token the vm pid. Any further tokens are never looked at.
pub fn parse_request(payload: &[u8]) -> Result<Request, ParseError> {
    let payload = match payload.iter().position(|b| *b == 0) {
        Some(nul) => &payload[..nul],
        None => payload,
    };

    let mut tokens = payload
        .split(|b| DELIMITERS.contains(b))
        .filter(|t| !t.is_empty());

    let raw_gfn = parse_c_ulong(tokens.next().ok_or(ParseError::MissingGfn)?)?;
    let vm_pid = tokens.next().map(parse_c_ulong).transpose()?;

    Ok(Request { raw_gfn, vm_pid })
}

/// Parse an unsigned integer with C style base detection: `0x` prefix for hex, a leading
/// `0` for octal and decimal otherwise. A single leading `+` is allowed.
pub fn parse_c_ulong(token: &[u8]) -> Result<u64, ParseError> {
    let invalid = || ParseError::InvalidNumber {
        token: String::from_utf8_lossy(token).into_owned(),
    };

    let text = std::str::from_utf8(token).map_err(|_| invalid())?;
    let text = text.strip_prefix('+').unwrap_or(text);

    let bytes = text.as_bytes();
    let (digits, radix) = match bytes {
        [b'0', b'x' | b'X', d, ..] if d.is_ascii_hexdigit() => (&text[2..], 16),
        [b'0', ..] => (text, 8),
        _ => (text, 10),
    };

    //from_str_radix would accept a second sign
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}
