//! Turns a finalized [`LogContext`] into a [`MetricRecord`].

use crate::record::{MetricRecord, PEER_ABSENT};
use perfmetrics_core::config::{Ipv6Style, PeerMode};
use perfmetrics_core::context::LogContext;
use std::collections::TryReserveError;
use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use thiserror::Error;

/// Longest dotted-quad text, NUL included (`INET_ADDRSTRLEN`).
pub const INET_ADDRSTRLEN: usize = 16;
/// Longest IPv6 text, NUL included (`INET6_ADDRSTRLEN`).
pub const INET6_ADDRSTRLEN: usize = 46;
/// Brackets plus `:65535`.
const ADDR_DECORATION_LEN: usize = 2 + 6;

const MAX_IDENTITY_LEN: usize = INET6_ADDRSTRLEN + ADDR_DECORATION_LEN;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("response status is not finalized")]
    NotFinalized,

    #[error("peer identity allocation failed: {0}")]
    Alloc(#[from] TryReserveError),

    #[error("socket address does not fit the identity buffer")]
    AddrRender,
}

/// Derives timing and identity fields at the log phase.
///
/// Both timing fields come from the same millisecond clock:
/// `response_time_ms` is the signed difference, `duration_ms` the same
/// value clamped at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsExtractor {
    ipv6_style: Ipv6Style,
}

impl MetricsExtractor {
    pub fn new(ipv6_style: Ipv6Style) -> Self {
        Self { ipv6_style }
    }

    pub fn extract<C: LogContext + ?Sized>(
        &self,
        mode: PeerMode,
        ctx: &C,
    ) -> Result<MetricRecord, ExtractError> {
        let status = ctx.status().ok_or(ExtractError::NotFinalized)?;

        let request_start_ms = ctx.request_start_ms();
        let response_time_ms = ctx.now_ms().saturating_sub(request_start_ms);
        let duration_ms = u64::try_from(response_time_ms).unwrap_or(0);

        let peer = match mode {
            PeerMode::Upstream => owned(ctx.upstream_peer().unwrap_or(PEER_ABSENT))?,
            PeerMode::LocalAddr => match ctx.local_addr() {
                Some(addr) => self.render_socket_addr(addr)?,
                None => owned(PEER_ABSENT)?,
            },
        };

        Ok(MetricRecord {
            mode,
            request_start_ms,
            response_time_ms,
            duration_ms,
            status,
            peer,
        })
    }

    /// `a.b.c.d:port`, or an IPv6 address in the configured style.
    pub fn render_socket_addr(&self, addr: SocketAddr) -> Result<String, ExtractError> {
        let mut buf = FixedBuf::<MAX_IDENTITY_LEN>::new();
        let written = match (addr, self.ipv6_style) {
            (SocketAddr::V4(v4), _) => write!(buf, "{}:{}", v4.ip(), v4.port()),
            (SocketAddr::V6(v6), Ipv6Style::Bracketed) => write!(buf, "[{}]:{}", v6.ip(), v6.port()),
            (SocketAddr::V6(v6), Ipv6Style::Bare) => write!(buf, "{}:{}", v6.ip(), v6.port()),
        };
        written.map_err(|_| ExtractError::AddrRender)?;
        owned(buf.as_str()?)
    }
}

/// Copy into a fallibly reserved `String`.
fn owned(s: &str) -> Result<String, ExtractError> {
    let mut out = String::new();
    out.try_reserve_exact(s.len())?;
    out.push_str(s);
    Ok(out)
}

/// Stack buffer that refuses to grow.
struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    fn new() -> Self {
        Self { bytes: [0; N], len: 0 }
    }

    fn as_str(&self) -> Result<&str, ExtractError> {
        std::str::from_utf8(&self.bytes[..self.len]).map_err(|_| ExtractError::AddrRender)
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > N {
            return Err(fmt::Error);
        }
        self.bytes[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}
