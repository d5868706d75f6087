//! Request/reply sessions on the translation endpoint.
//!
//! Every open of the endpoint gets its own [`Session`]. A write runs the whole
//! parse -> select -> translate pipeline synchronously on the caller's thread and stores
//! the resulting reply line. A read hands that line out, blocking (or failing with
//! `EAGAIN` in non-blocking mode) until a write produced one. [`Session::poll`] reports
//! readiness without blocking.
//!
//! Session fields are guarded by a mutex. An accepted write first clears readiness, so
//! the previous reply is no longer handed out while the new one is computed. The
//! pipeline runs without holding the lock; when several writers race on one session
//! the last one to store wins and readers never observe a mix of two replies.
use std::{
    io::{self, Read},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use crossbeam::channel::{Receiver, TryRecvError};
use log::debug;
use nix::{errno::Errno, fcntl::OFlag, poll::PollFlags};
use thiserror::Error;

use crate::{
    registry::VmRegistry,
    reply::{Reply, ReplyBuffer},
    request::parse_request,
    selector::select_vm,
    translate::{translate, PageResolver},
};

/// Size of the buffer a write payload is copied into. One byte is reserved for the
/// terminator, so payloads must be strictly shorter than this.
pub const WRITE_MAX: usize = 64;

/// How often a blocked reader checks its abort channel
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("failed to transfer payload : {source}")]
    BadTransfer {
        #[source]
        source: io::Error,
    },
    #[error("no reply ready")]
    WouldBlock,
    #[error("wait for reply interrupted")]
    Interrupted,
}

impl SessionError {
    pub fn errno(&self) -> Errno {
        match self {
            SessionError::TooLarge { .. } => Errno::E2BIG,
            SessionError::BadTransfer { .. } => Errno::EFAULT,
            SessionError::WouldBlock => Errno::EAGAIN,
            SessionError::Interrupted => Errno::EINTR,
        }
    }
}

impl From<SessionError> for Errno {
    fn from(e: SessionError) -> Self {
        e.errno()
    }
}

/// The translation endpoint. Holds the collaborators every session's pipeline needs.
pub struct Endpoint {
    registry: Arc<dyn VmRegistry>,
    resolver: Arc<dyn PageResolver>,
}

impl Endpoint {
    pub fn new(registry: Arc<dyn VmRegistry>, resolver: Arc<dyn PageResolver>) -> Arc<Self> {
        Arc::new(Endpoint { registry, resolver })
    }

    /// Open a new session.
    /// # Arguments
    /// - `flags`: open flags, only `O_NONBLOCK` is looked at
    /// - `abort`: receiving on this channel interrupts a read blocked waiting for a reply
    pub fn open(self: &Arc<Self>, flags: OFlag, abort: Receiver<()>) -> Session {
        let nonblocking = flags.contains(OFlag::O_NONBLOCK);
        debug!("opening session, nonblocking={}", nonblocking);
        Session {
            endpoint: self.clone(),
            state: Mutex::new(SessionState {
                reply_ready: false,
                reply: ReplyBuffer::new(),
                pos: 0,
            }),
            ready: Condvar::new(),
            nonblocking,
            abort,
        }
    }

    /// Run the full pipeline for one payload. Every failure becomes an error reply.
    pub fn handle(&self, payload: &[u8]) -> Reply {
        let req = match parse_request(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!("rejecting request: {}", e);
                return e.into();
            }
        };

        let vm = match select_vm(self.registry.as_ref(), &req) {
            Ok(v) => v,
            Err(e) => {
                debug!("vm lookup for {:x?} failed: {}", req, e);
                return e.into();
            }
        };

        match translate(vm.as_ref(), self.resolver.as_ref(), req.raw_gfn) {
            Ok(t) => {
                debug!("gpa 0x{:x} of pid {} -> {:x?}", req.raw_gfn, vm.owner_pid(), t);
                Reply::Ok(t)
            }
            Err(e) => {
                debug!("translating gpa 0x{:x} failed: {}", req.raw_gfn, e);
                e.into()
            }
        }
    }
}

struct SessionState {
    reply_ready: bool,
    reply: ReplyBuffer,
    /// stream position inside `reply`
    pos: usize,
}

pub struct Session {
    endpoint: Arc<Endpoint>,
    state: Mutex<SessionState>,
    ready: Condvar,
    nonblocking: bool,
    abort: Receiver<()>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        //a panic while holding the lock cannot leave the state half written
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Submit a request. The outcome of the request, successful or not, is delivered as
    /// the reply; only an oversized payload fails the call itself.
    pub fn write(&self, payload: &[u8]) -> Result<usize, SessionError> {
        self.write_from(payload, payload.len())
    }

    /// Like [`write`](Self::write) but copies `count` bytes out of `src` first. A failing
    /// or short copy fails the call with [`SessionError::BadTransfer`].
    pub fn write_from<R: Read>(&self, mut src: R, count: usize) -> Result<usize, SessionError> {
        if count >= WRITE_MAX {
            return Err(SessionError::TooLarge {
                len: count,
                max: WRITE_MAX - 1,
            });
        }

        let mut kbuf = [0u8; WRITE_MAX];
        src.read_exact(&mut kbuf[..count])
            .map_err(|source| SessionError::BadTransfer { source })?;

        {
            let mut state = self.lock();
            state.reply_ready = false;
            state.pos = 0;
        }

        let reply = self.endpoint.handle(&kbuf[..count]);

        let mut state = self.lock();
        state.reply.store(&reply);
        state.pos = 0;
        state.reply_ready = true;
        drop(state);
        self.ready.notify_all();

        Ok(count)
    }

    /// Read (part of) the current reply into `buf`. Returns `0` once the reply has been
    /// consumed completely.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let mut state = self.lock();

        while !state.reply_ready {
            if self.nonblocking {
                return Err(SessionError::WouldBlock);
            }
            match self.abort.try_recv() {
                Ok(()) => {
                    debug!("blocked read interrupted");
                    return Err(SessionError::Interrupted);
                }
                Err(TryRecvError::Empty) => (),
                //nobody can interrupt us anymore, keep waiting for a write
                Err(TryRecvError::Disconnected) => (),
            }
            state = self
                .ready
                .wait_timeout(state, ABORT_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }

        if state.reply.is_empty() {
            return Ok(0);
        }

        let available = state.reply.len().saturating_sub(state.pos);
        let n = available.min(buf.len());
        let start = state.pos;
        buf[..n].copy_from_slice(&state.reply.as_bytes()[start..start + n]);
        state.pos += n;
        Ok(n)
    }

    /// Read until the current reply is exhausted
    pub fn read_reply(&self) -> Result<Vec<u8>, SessionError> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            match self.read(&mut chunk)? {
                0 => return Ok(reply),
                n => reply.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Readable exactly when a reply is ready. Never blocks.
    pub fn poll(&self) -> PollFlags {
        if self.lock().reply_ready {
            PollFlags::POLLIN | PollFlags::POLLRDNORM
        } else {
            PollFlags::empty()
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Release the session. Dropping it has the same effect.
    pub fn close(self) {
        debug!("closing session");
    }
}
