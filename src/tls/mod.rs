//! Non-blocking TLS layer
//!
//! A caller-driven TLS stack for the charging use cases: a server that can
//! rotate certificates without dropping live connections, and a client with
//! status-request (OCSP stapling) and trusted-CA-keys support. No background
//! threads are hidden in here; every wait is an explicit, bounded `poll(2)`
//! and each connection is an independent state machine the caller advances.

pub mod client;
pub mod connection;
pub mod extensions;
pub mod server;

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use client::{Client, ClientState, ReconnectPolicy};
pub use connection::{Connection, ConnectionState, TlsIoError};
pub use extensions::TrustedCaKeysData;
pub use server::{Server, ServerController, ServerState};

/// TLS extension numbers handled via custom-extension callbacks.
pub(crate) const TLSEXT_TRUSTED_CA_KEYS: u16 = 3;
pub(crate) const TLSEXT_STATUS_REQUEST_V2: u16 = 17;

/// Explicit runtime context for the TLS layer.
///
/// Owns the process-wide concerns the servers and clients would otherwise
/// reach for implicitly: crypto-library initialisation and, on request,
/// suppression of `SIGPIPE` so writes to a torn-down peer surface as I/O
/// errors instead of killing the process. Constructed once by the hosting
/// application and passed to every [`Server`] and [`Client`].
pub struct TlsRuntime {
    sigpipe_ignored: AtomicBool,
}

impl TlsRuntime {
    pub fn new() -> Arc<Self> {
        openssl::init();
        Arc::new(Self {
            sigpipe_ignored: AtomicBool::new(false),
        })
    }

    /// Explicit registration call; made at most once per process.
    pub fn ignore_sigpipe(&self) {
        if !self.sigpipe_ignored.swap(true, Ordering::SeqCst) {
            #[cfg(unix)]
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            }
        }
    }
}

/// One certificate chain a server can present: leaf chain, key, the trust
/// anchors the chain descends from (used to answer `trusted_ca_keys`), and
/// the OCSP responses for stapling, in chain order.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    pub certificate_chain_file: PathBuf,
    pub private_key_file: PathBuf,
    pub private_key_password: Option<String>,
    pub trust_anchor_file: Option<PathBuf>,
    /// One optional response file per chain certificate, leaf first.
    pub ocsp_response_files: Vec<Option<PathBuf>>,
}

/// TLS server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TLS 1.2 cipher list; None uses the library default.
    pub cipher_list: Option<String>,
    /// TLS 1.3 ciphersuites; None uses the default, Some("") disables TLS 1.3.
    pub ciphersuites: Option<String>,
    pub chains: Vec<ChainConfig>,
    /// Trust anchors for client-certificate verification.
    pub verify_locations_file: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub ipv6_only: bool,
    pub verify_client: bool,
    /// Per-primitive I/O timeout in milliseconds; 0 selects fully
    /// non-blocking semantics.
    pub io_timeout_ms: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cipher_list: None,
            ciphersuites: None,
            chains: Vec::new(),
            verify_locations_file: None,
            host: "localhost".to_string(),
            port: 0,
            ipv6_only: false,
            verify_client: true,
            io_timeout_ms: 30_000,
        }
    }
}

/// TLS client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub cipher_list: Option<String>,
    pub ciphersuites: Option<String>,
    pub certificate_chain_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
    pub private_key_password: Option<String>,
    /// Trust anchors for server verification.
    pub verify_locations_file: Option<PathBuf>,
    pub io_timeout_ms: u32,
    pub verify_server: bool,
    /// Expected peer hostname, checked manually after the handshake.
    pub expected_hostname: Option<String>,
    /// Accept wildcard certificates during the manual hostname check.
    pub allow_wildcards: bool,
    /// Request OCSP stapling via status_request.
    pub status_request: bool,
    /// Request OCSP stapling via status_request_v2.
    pub status_request_v2: bool,
    /// Send the trusted_ca_keys hello extension.
    pub trusted_ca_keys: bool,
    pub trusted_ca_keys_data: TrustedCaKeysData,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cipher_list: None,
            ciphersuites: None,
            certificate_chain_file: None,
            private_key_file: None,
            private_key_password: None,
            verify_locations_file: None,
            io_timeout_ms: 30_000,
            verify_server: true,
            expected_hostname: None,
            allow_wildcards: false,
            status_request: false,
            status_request_v2: false,
            trusted_ca_keys: false,
            trusted_ca_keys_data: TrustedCaKeysData::default(),
        }
    }
}

/// Wait until `fd` is readable (or writable), bounded by `deadline`.
///
/// Returns `Ok(true)` when ready, `Ok(false)` on timeout. `EINTR` retries.
pub(crate) fn wait_for(fd: RawFd, for_write: bool, deadline: Option<Instant>) -> io::Result<bool> {
    loop {
        let timeout_ms: i32 = match deadline {
            None => -1,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(false);
                }
                left.as_millis().min(i32::MAX as u128) as i32
            }
        };

        let events = if for_write { libc::POLLOUT } else { libc::POLLIN };
        let mut fds = [libc::pollfd {
            fd,
            events,
            revents: 0,
        }];

        let res = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        match res {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            0 => return Ok(false),
            _ => return Ok(true),
        }
    }
}

/// Deadline for one I/O primitive under the configured timeout; `None` stands
/// for non-blocking mode and is handled before waiting.
pub(crate) fn io_deadline(timeout_ms: u32) -> Option<Instant> {
    (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
}
