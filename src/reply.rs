//! Outcome of a request and its one-line wire representation.
use std::fmt::{self, Display, Write};

use crate::{
    request::ParseError,
    selector::SelectError,
    translate::{TranslateError, Translation},
};

/// Capacity of a session's reply buffer in bytes
pub const REPLY_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok(Translation),
    InvalidInput,
    NoVm { pid: u64 },
    NoVms,
    /// `raw_gfn` of the request, i.e. the full guest physical address
    InvalidHva { gfn: u64 },
    /// `0` if nothing was pinned, a negative error code otherwise
    PinFailed { code: i64 },
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(t) => writeln!(
                f,
                "ok phys=0x{:x} kind={} gpa=0x{:x} hva=0x{:x}",
                t.phys, t.kind, t.gpa, t.hva
            ),
            Reply::InvalidInput => writeln!(f, "err:invalid_input"),
            Reply::NoVm { pid } => writeln!(f, "err:no_vm pid={}", pid),
            Reply::NoVms => writeln!(f, "err:no_vms"),
            Reply::InvalidHva { gfn } => writeln!(f, "err:hva gfn=0x{:x}", gfn),
            Reply::PinFailed { code } => writeln!(f, "err:gup={}", code),
        }
    }
}

impl From<ParseError> for Reply {
    fn from(_: ParseError) -> Self {
        Reply::InvalidInput
    }
}

impl From<SelectError> for Reply {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoSuchVm { pid } => Reply::NoVm { pid },
            SelectError::NoVms => Reply::NoVms,
        }
    }
}

impl From<TranslateError> for Reply {
    fn from(e: TranslateError) -> Self {
        match e {
            TranslateError::InvalidHva { gpa } => Reply::InvalidHva { gfn: gpa },
            TranslateError::Pin(p) => Reply::PinFailed { code: p.code() },
        }
    }
}

/// Fixed capacity buffer holding a formatted reply. Formatting into it silently
/// truncates at [`REPLY_MAX`] bytes.
#[derive(Clone)]
pub struct ReplyBuffer {
    buf: [u8; REPLY_MAX],
    len: usize,
}

impl ReplyBuffer {
    pub const fn new() -> Self {
        ReplyBuffer {
            buf: [0; REPLY_MAX],
            len: 0,
        }
    }

    /// Overwrite the buffer with the wire form of `reply`
    pub fn store(&mut self, reply: &Reply) {
        self.len = 0;
        //writing to ReplyBuffer never fails, it truncates
        let _ = write!(self, "{}", reply);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for ReplyBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(REPLY_MAX - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

impl fmt::Debug for ReplyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReplyBuffer")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{PageKind, PinError};

    fn wire(reply: Reply) -> String {
        let mut buf = ReplyBuffer::new();
        buf.store(&reply);
        String::from_utf8(buf.as_bytes().to_vec()).expect("reply is ascii")
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            wire(Reply::Ok(Translation {
                phys: 0x1_2345_6789,
                kind: PageKind::Hugetlb,
                gpa: 0x1000,
                hva: 0x7fff_0000_1000,
            })),
            "ok phys=0x123456789 kind=hugetlb gpa=0x1000 hva=0x7fff00001000\n"
        );
        assert_eq!(wire(Reply::InvalidInput), "err:invalid_input\n");
        assert_eq!(wire(Reply::NoVm { pid: 42 }), "err:no_vm pid=42\n");
        assert_eq!(wire(Reply::NoVms), "err:no_vms\n");
        assert_eq!(wire(Reply::InvalidHva { gfn: 0xdead000 }), "err:hva gfn=0xdead000\n");
        assert_eq!(wire(Reply::PinFailed { code: -14 }), "err:gup=-14\n");
        assert_eq!(wire(Reply::PinFailed { code: 0 }), "err:gup=0\n");
    }

    #[test]
    fn error_conversions() {
        assert_eq!(
            Reply::from(ParseError::MissingGfn),
            Reply::InvalidInput
        );
        assert_eq!(
            Reply::from(SelectError::NoSuchVm { pid: 9 }),
            Reply::NoVm { pid: 9 }
        );
        assert_eq!(Reply::from(SelectError::NoVms), Reply::NoVms);
        assert_eq!(
            Reply::from(TranslateError::InvalidHva { gpa: 0x5000 }),
            Reply::InvalidHva { gfn: 0x5000 }
        );
        assert_eq!(
            Reply::from(TranslateError::Pin(PinError::NoPages)),
            Reply::PinFailed { code: 0 }
        );
        assert_eq!(
            Reply::from(TranslateError::Pin(PinError::Failed(-1))),
            Reply::PinFailed { code: -1 }
        );
    }

    #[test]
    fn longest_reply_fits() {
        let reply = Reply::Ok(Translation {
            phys: u64::MAX,
            kind: PageKind::Hugetlb,
            gpa: u64::MAX,
            hva: u64::MAX,
        });
        let expected = reply.to_string();
        assert!(expected.len() < REPLY_MAX);
        assert_eq!(wire(reply), expected);
    }

    #[test]
    fn truncates_at_capacity() {
        let mut buf = ReplyBuffer::new();
        let long = "x".repeat(REPLY_MAX + 10);
        write!(buf, "{}", long).expect("truncating write");
        write!(buf, "more").expect("truncating write");
        assert_eq!(buf.len(), REPLY_MAX);
        assert!(buf.as_bytes().iter().all(|b| *b == b'x'));

        buf.store(&Reply::NoVms);
        assert_eq!(buf.as_bytes(), b"err:no_vms\n");
    }
}
