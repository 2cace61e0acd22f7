//! Log-phase request context.
//!
//! The serving component hands a finalized request/response view to the
//! metrics pipeline through [`LogContext`]. [`RequestSnapshot`] is an owned
//! implementation a host can fill in field by field.

use chrono::Utc;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Millisecond wall-clock source.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// `Utc::now()` in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock stuck at a fixed instant. Used for replays and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenClock(pub i64);

impl Clock for FrozenClock {
    #[inline]
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// Read-only view of a request at the moment its response is finalized.
pub trait LogContext {
    /// Wall-clock time the request began, in milliseconds.
    fn request_start_ms(&self) -> i64;

    /// Current wall-clock time, same clock as `request_start_ms`.
    fn now_ms(&self) -> i64;

    /// Final response status; `None` until the response is finalized.
    fn status(&self) -> Option<u16>;

    /// Resolved address of the upstream peer, if the request was proxied.
    fn upstream_peer(&self) -> Option<&str>;

    /// Local listening socket that accepted the connection.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Owned [`LogContext`] populated by the host.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub request_start_ms: i64,
    pub status: Option<u16>,
    pub upstream_peer: Option<String>,
    pub local_addr: Option<SocketAddr>,
    clock: Arc<dyn Clock>,
}

impl RequestSnapshot {
    pub fn new(request_start_ms: i64) -> Self {
        Self {
            request_start_ms,
            status: None,
            upstream_peer: None,
            local_addr: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Snapshot whose request starts at the current system time.
    pub fn started_now() -> Self {
        Self::new(SystemClock.now_ms())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_upstream_peer(mut self, peer: impl Into<String>) -> Self {
        self.upstream_peer = Some(peer.into());
        self
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }
}

impl LogContext for RequestSnapshot {
    fn request_start_ms(&self) -> i64 {
        self.request_start_ms
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn status(&self) -> Option<u16> {
        self.status
    }

    fn upstream_peer(&self) -> Option<&str> {
        self.upstream_peer.as_deref()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
