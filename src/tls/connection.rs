//! Per-connection TLS state machine
//!
//! One `Connection` exists per accepted or dialed socket. The caller drives
//! it: `connect`/`accept` through the handshake, then `read`/`write`, then
//! `shutdown`. Every primitive returns a typed result; network and protocol
//! conditions never panic. With `io_timeout_ms == 0` the connection is fully
//! non-blocking and surfaces `WantRead`/`WantWrite` for the caller's own
//! event loop (`socket()` exposes the fd to poll on).
//!
//! ```text
//! Idle -> Connecting -> Connected -> Closing -> Finalized
//!                \          \----------\
//!                 \----------------------> Error (terminal)
//! ```

use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use openssl::ssl::{ErrorCode, ShutdownResult, Ssl, SslStream};
use tracing::{debug, info, warn};

use super::extensions::{flags_index, HandshakeFlags};
use super::{io_deadline, wait_for};
use crate::types::CertError;

/// How long a close handshake may block at most, matching the bounded waits
/// everywhere else even when the configured I/O timeout is larger.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Finalized,
    Error,
}

/// Non-success outcomes of the I/O primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsIoError {
    /// Non-blocking mode: retry the same call once the socket is readable.
    WantRead,
    /// Non-blocking mode: retry the same call once the socket is writable.
    WantWrite,
    /// The configured timeout expired; partial progress is kept.
    Timeout,
    /// The connection is closed (cleanly, or the call arrived after close).
    Closed,
    /// Unrecoverable fault; the connection is in the terminal `Error` state.
    Failed,
}

pub struct Connection {
    stream: SslStream<TcpStream>,
    state: ConnectionState,
    peer_address: String,
    io_timeout_ms: u32,
    flags: Arc<HandshakeFlags>,
    expected_hostname: Option<String>,
    allow_wildcards: bool,
}

impl Connection {
    /// Wrap a prepared `Ssl` (accept or connect state already set) around a
    /// connected socket. The socket is switched to non-blocking; all waiting
    /// happens through `poll` under this connection's timeout.
    pub(crate) fn new(
        mut ssl: Ssl,
        socket: TcpStream,
        peer_address: String,
        io_timeout_ms: u32,
        expected_hostname: Option<String>,
        allow_wildcards: bool,
    ) -> Result<Self, CertError> {
        socket.set_nonblocking(true)?;

        let flags = Arc::new(HandshakeFlags::default());
        ssl.set_ex_data(flags_index(), flags.clone());

        let stream = SslStream::new(ssl, socket)
            .map_err(CertError::Crypto)?;

        Ok(Self {
            stream,
            state: ConnectionState::Idle,
            peer_address,
            io_timeout_ms,
            flags,
            expected_hostname,
            allow_wildcards,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Underlying socket for integration into a caller event loop.
    pub fn socket(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    /// Handshake extension flags recorded while accepting.
    pub fn handshake_flags(&self) -> &HandshakeFlags {
        &self.flags
    }

    /// Stapled OCSP response received from the server, if any (client side).
    pub fn ocsp_response(&self) -> Option<Vec<u8>> {
        self.stream.ssl().ocsp_status().map(|r| r.to_vec())
    }

    pub fn peer_certificate(&self) -> Option<openssl::x509::X509> {
        self.stream.ssl().peer_certificate()
    }

    /// Drive the client-side handshake.
    pub fn connect(&mut self) -> Result<(), TlsIoError> {
        self.handshake()
    }

    /// Drive the server-side handshake.
    pub fn accept(&mut self) -> Result<(), TlsIoError> {
        self.handshake()
    }

    fn handshake(&mut self) -> Result<(), TlsIoError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Connecting => {}
            // Already connected: succeed without a second "connected" event.
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Finalized => return Err(TlsIoError::Closed),
            ConnectionState::Error => return Err(TlsIoError::Failed),
        }
        self.state = ConnectionState::Connecting;

        let deadline = io_deadline(self.io_timeout_ms);
        loop {
            match self.stream.do_handshake() {
                Ok(()) => {
                    if !self.verify_peer_hostname() {
                        warn!(peer = %self.peer_address, "peer hostname verification failed");
                        let _ = self.stream.shutdown();
                        self.state = ConnectionState::Error;
                        return Err(TlsIoError::Failed);
                    }
                    self.state = ConnectionState::Connected;
                    info!(peer = %self.peer_address, "TLS connection established");
                    return Ok(());
                }
                Err(e) => self.block_or_fail("handshake", e, deadline)?,
            }
        }
    }

    /// Read decrypted bytes. Returns the number of bytes read; zero only for
    /// an empty buffer.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsIoError> {
        self.check_connected()?;

        let deadline = io_deadline(self.io_timeout_ms);
        loop {
            match self.stream.ssl_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) => self.block_or_fail("read", e, deadline)?,
            }
        }
    }

    /// Write plaintext bytes. Returns the number of bytes consumed.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, TlsIoError> {
        self.check_connected()?;

        let deadline = io_deadline(self.io_timeout_ms);
        loop {
            match self.stream.ssl_write(buf) {
                Ok(n) => return Ok(n),
                Err(e) => self.block_or_fail("write", e, deadline)?,
            }
        }
    }

    /// Close the connection. Sends close_notify; does not wait for the peer's
    /// reply beyond the bounded shutdown timeout.
    pub fn shutdown(&mut self) -> Result<(), TlsIoError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Closing => {}
            ConnectionState::Finalized => return Err(TlsIoError::Closed),
            ConnectionState::Error => return Err(TlsIoError::Failed),
            ConnectionState::Idle | ConnectionState::Connecting => {
                self.state = ConnectionState::Finalized;
                return Ok(());
            }
        }
        self.state = ConnectionState::Closing;

        let deadline = if self.io_timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + SHUTDOWN_TIMEOUT)
        };

        loop {
            match self.stream.shutdown() {
                Ok(ShutdownResult::Sent) | Ok(ShutdownResult::Received) => {
                    self.state = ConnectionState::Finalized;
                    debug!(peer = %self.peer_address, "TLS connection closed");
                    return Ok(());
                }
                Err(e) => match e.code() {
                    ErrorCode::ZERO_RETURN => {
                        self.state = ConnectionState::Finalized;
                        return Ok(());
                    }
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                        let for_write = e.code() == ErrorCode::WANT_WRITE;
                        if self.io_timeout_ms == 0 {
                            // Stay in Closing; caller re-invokes on readiness.
                            return Err(if for_write {
                                TlsIoError::WantWrite
                            } else {
                                TlsIoError::WantRead
                            });
                        }
                        match wait_for(self.socket(), for_write, deadline) {
                            Ok(true) => continue,
                            Ok(false) => {
                                self.state = ConnectionState::Finalized;
                                return Err(TlsIoError::Timeout);
                            }
                            Err(_) => {
                                self.state = ConnectionState::Error;
                                return Err(TlsIoError::Failed);
                            }
                        }
                    }
                    _ => {
                        // A failed close still releases the socket.
                        self.state = ConnectionState::Finalized;
                        return Ok(());
                    }
                },
            }
        }
    }

    fn check_connected(&self) -> Result<(), TlsIoError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closing | ConnectionState::Finalized => Err(TlsIoError::Closed),
            ConnectionState::Error => Err(TlsIoError::Failed),
            ConnectionState::Idle | ConnectionState::Connecting => Err(TlsIoError::Failed),
        }
    }

    /// Common error path for handshake/read/write: wait and retry, or map to
    /// the typed result and adjust the connection state.
    fn block_or_fail(
        &mut self,
        operation: &str,
        error: openssl::ssl::Error,
        deadline: Option<Instant>,
    ) -> Result<(), TlsIoError> {
        match error.code() {
            ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                let for_write = error.code() == ErrorCode::WANT_WRITE;
                if self.io_timeout_ms == 0 {
                    return Err(if for_write {
                        TlsIoError::WantWrite
                    } else {
                        TlsIoError::WantRead
                    });
                }
                match wait_for(self.socket(), for_write, deadline) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(TlsIoError::Timeout),
                    Err(e) => {
                        warn!(peer = %self.peer_address, operation, error = %e, "poll failed");
                        self.state = ConnectionState::Error;
                        Err(TlsIoError::Failed)
                    }
                }
            }
            ErrorCode::ZERO_RETURN => {
                // Peer sent close_notify: answer it and finalize.
                debug!(peer = %self.peer_address, operation, "peer closed the connection");
                self.state = ConnectionState::Closing;
                let _ = self.stream.shutdown();
                self.state = ConnectionState::Finalized;
                Err(TlsIoError::Closed)
            }
            ErrorCode::SYSCALL => {
                debug!(peer = %self.peer_address, operation, error = %error, "socket fault");
                self.state = ConnectionState::Error;
                Err(TlsIoError::Failed)
            }
            _ => {
                warn!(peer = %self.peer_address, operation, error = %error, "TLS protocol failure");
                let _ = self.stream.shutdown();
                self.state = ConnectionState::Error;
                Err(TlsIoError::Failed)
            }
        }
    }

    /// Manual post-handshake hostname check.
    ///
    /// The subjectAltName DNS entries are authoritative when present; the
    /// subject CN is only consulted for certificates without any DNS SAN.
    fn verify_peer_hostname(&mut self) -> bool {
        let Some(expected) = self.expected_hostname.clone() else {
            return true;
        };
        let Some(peer) = self.stream.ssl().peer_certificate() else {
            return false;
        };

        if let Some(sans) = peer.subject_alt_names() {
            let mut saw_dns = false;
            for san in sans.iter() {
                if let Some(dns) = san.dnsname() {
                    saw_dns = true;
                    if hostname_matches(&expected, dns, self.allow_wildcards) {
                        return true;
                    }
                }
            }
            if saw_dns {
                return false;
            }
        }

        peer.subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|cn| hostname_matches(&expected, &cn, self.allow_wildcards))
            .unwrap_or(false)
    }
}

/// Match `expected` against a certificate name, exact or (optionally) with a
/// single leading `*.` label.
pub(crate) fn hostname_matches(expected: &str, pattern: &str, allow_wildcards: bool) -> bool {
    if pattern.eq_ignore_ascii_case(expected) {
        return true;
    }
    if !allow_wildcards {
        return false;
    }

    if let Some(pattern_suffix) = pattern.strip_prefix("*.") {
        // The wildcard covers exactly one label.
        if let Some((first_label, expected_suffix)) = expected.split_once('.') {
            return !first_label.is_empty() && expected_suffix.eq_ignore_ascii_case(pattern_suffix);
        }
    }
    false
}
