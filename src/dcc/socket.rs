//! TCP plumbing for DCC: listening on a configured port range, connecting
//! with a timeout, and accepting exactly one peer.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use super::error::{DccError, Result};

/// Inclusive range of local ports to listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }
}

/// Bind a listener on all interfaces.
///
/// Without a range the OS picks an ephemeral port. With one, ports are
/// tried in order and the first free one wins.
pub async fn listen(range: Option<PortRange>) -> Result<(TcpListener, u16)> {
    let Some(range) = range else {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        return Ok((listener, port));
    };

    for port in range.start..=range.end {
        // Port 0 would hand out an ephemeral port outside the range.
        if port == 0 {
            continue;
        }
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => tracing::trace!(port, error = %e, "port unavailable"),
        }
    }
    Err(DccError::PortRangeExhausted {
        start: range.start,
        end: range.end,
    })
}

/// Open an outbound connection, giving up after `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(DccError::ConnectRefused { addr })
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(DccError::ConnectTimeout { addr }),
    }
}

/// Wait for a single peer, then close the listener.
pub async fn accept_one(listener: TcpListener, timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
    let accepted = tokio::time::timeout(timeout, listener.accept()).await;
    drop(listener);
    match accepted {
        Ok(Ok((stream, peer))) => {
            stream.set_nodelay(true).ok();
            Ok((stream, peer))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(DccError::AcceptTimeout {
            secs: timeout.as_secs(),
        }),
    }
}
