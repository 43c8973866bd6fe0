//! TLS server orchestration
//!
//! The server owns a non-blocking listener and a bounded worker pool; each
//! accepted socket becomes one [`Connection`] handed to the caller's handler
//! on a pool worker. TLS configuration lives in a swappable slot so
//! `suspend`/`update` rotate certificates without touching connections that
//! are already established: only the acceptance of *new* connections is
//! gated on the configuration state.
//!
//! ```text
//! Uninitialized -> InitSocket -> InitComplete -> Running -> Stopped
//!                      ^   (suspend)  |  (grace elapsed)
//!                      +--------------+
//! ```

use std::fs;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use openssl::pkey::PKey;
use openssl::ssl::{
    ExtensionContext, Ssl, SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::extensions::{
    flags_index, load_trust_anchors, should_staple_v1, OcspStapleCache, TrustedCaKeysData,
};
use super::{wait_for, ChainConfig, ServerConfig, TlsRuntime};
use super::{TLSEXT_STATUS_REQUEST_V2, TLSEXT_TRUSTED_CA_KEYS};
use crate::certificate::Certificate;
use crate::types::CertError;

/// Accept-loop tick; also bounds how quickly `stop()` takes effect.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between a configuration update and autonomous resumption.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not initialised; call `init`.
    Uninitialized,
    /// Listening socket up, TLS configuration absent or invalidated.
    InitSocket,
    /// Fully configured, not yet accepting.
    InitComplete,
    /// Accepting connections.
    Running,
    /// Stopped; reinitialisation required.
    Stopped,
}

/// One selectable certificate chain: its trust anchors (matched against the
/// client's trusted_ca_keys) and the context presenting it.
struct ChainSelection {
    anchors: Vec<Certificate>,
    ctx: SslContext,
}

struct ConfiguredTls {
    default_ctx: SslContext,
    /// Kept alive for the extension callbacks capturing it.
    _selections: Arc<OnceLock<Vec<ChainSelection>>>,
}

struct Shared {
    exit: AtomicBool,
    state: Mutex<ServerState>,
    running: Mutex<bool>,
    running_cv: Condvar,
    tls: RwLock<Option<Arc<ConfiguredTls>>>,
    resume_at: Mutex<Option<Instant>>,
}

pub struct Server {
    _runtime: Arc<TlsRuntime>,
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    staple_cache: Arc<OcspStapleCache>,
    pool: WorkerPool,
    io_timeout_ms: u32,
    grace_period: Duration,
}

impl Server {
    pub fn new(runtime: Arc<TlsRuntime>) -> Self {
        Self {
            _runtime: runtime,
            shared: Arc::new(Shared {
                exit: AtomicBool::new(false),
                state: Mutex::new(ServerState::Uninitialized),
                running: Mutex::new(false),
                running_cv: Condvar::new(),
                tls: RwLock::new(None),
                resume_at: Mutex::new(None),
            }),
            listener: None,
            staple_cache: Arc::new(OcspStapleCache::default()),
            pool: WorkerPool::new(DEFAULT_POOL_SIZE),
            io_timeout_ms: 0,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Grace period used when `update` re-arms a suspended server.
    pub fn set_grace_period(&mut self, grace: Duration) {
        self.grace_period = grace;
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock().unwrap()
    }

    /// Listening address, once the socket is initialised. Useful when the
    /// configuration requested an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Connections currently queued or being handled.
    pub fn active_connections(&self) -> usize {
        self.pool.active()
    }

    /// Block until every dispatched connection handler finished.
    pub fn wait_all_closed(&self) {
        self.pool.wait_idle();
    }

    /// Initialise the listening socket and, when the configuration carries
    /// chains, the TLS state. Listening can start before certificates exist:
    /// the returned `InitSocket` state accepts `update` later.
    pub fn init(&mut self, config: &ServerConfig) -> ServerState {
        self.io_timeout_ms = config.io_timeout_ms;
        self.set_state(ServerState::Uninitialized);

        match bind_listener(&config.host, config.port, config.ipv6_only) {
            Ok(listener) => {
                self.listener = Some(listener);
                self.set_state(ServerState::InitSocket);
            }
            Err(e) => {
                error!(host = %config.host, port = config.port, error = %e, "could not bind listener");
                return self.state();
            }
        }

        if !config.chains.is_empty() && self.update(config) {
            self.set_state(ServerState::InitComplete);
            // The grace period guards live rotation, not first start.
            *self.shared.resume_at.lock().unwrap() = None;
        }
        self.state()
    }

    /// Build and swap in the TLS configuration plus the OCSP staple cache.
    ///
    /// Transitions `InitSocket` to `InitComplete`; the serve loop resumes
    /// accepting autonomously once the grace period elapses.
    pub fn update(&self, config: &ServerConfig) -> bool {
        apply_update(&self.shared, &self.staple_cache, self.grace_period, config)
    }

    /// Invalidate the TLS configuration for new connections without touching
    /// established ones. `Running` falls back to `InitSocket` until the next
    /// `update`.
    pub fn suspend(&self) {
        info!("suspending TLS acceptance");
        *self.shared.tls.write().unwrap() = None;

        let mut state = self.shared.state.lock().unwrap();
        if matches!(*state, ServerState::Running | ServerState::InitComplete) {
            *state = ServerState::InitSocket;
        }
    }

    /// Accept connections until `stop` is called; blocking.
    ///
    /// Each accepted socket is wrapped in a [`Connection`] (handshake not yet
    /// driven) and dispatched to the worker pool. While the server is not in
    /// `Running` state, new sockets are refused; established connections are
    /// the handlers' concern and unaffected.
    pub fn serve<F>(&mut self, handler: F) -> ServerState
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        let Some(listener) = self.listener.take() else {
            error!("serve called without an initialised socket");
            return self.state();
        };

        {
            let state = self.state();
            if !matches!(state, ServerState::InitSocket | ServerState::InitComplete) {
                error!(?state, "serve called in the wrong state");
                self.listener = Some(listener);
                return state;
            }
            if state == ServerState::InitComplete {
                self.set_state(ServerState::Running);
            }
        }

        self.shared.exit.store(false, Ordering::SeqCst);
        self.set_running(true);

        let handler = Arc::new(handler);
        let fd = {
            use std::os::fd::AsRawFd;
            listener.as_raw_fd()
        };

        while !self.shared.exit.load(Ordering::SeqCst) {
            self.promote_after_grace();

            match wait_for(fd, false, Some(Instant::now() + ACCEPT_POLL_INTERVAL)) {
                Ok(false) => continue,
                Err(e) => {
                    error!(error = %e, "listener poll failed");
                    break;
                }
                Ok(true) => {}
            }

            let (socket, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.state() != ServerState::Running {
                debug!(peer = %peer, "refusing connection while TLS configuration is suspended");
                continue;
            }
            let tls = self.shared.tls.read().unwrap().clone();
            let Some(tls) = tls else {
                debug!(peer = %peer, "refusing connection without TLS configuration");
                continue;
            };

            match server_connection(&tls, socket, peer, self.io_timeout_ms) {
                Ok(connection) => {
                    let handler = handler.clone();
                    self.pool.submit(move || handler(connection));
                }
                Err(e) => warn!(peer = %peer, error = %e, "could not set up connection"),
            }
        }

        drop(listener);
        self.set_state(ServerState::Stopped);
        self.set_running(false);
        ServerState::Stopped
    }

    /// Stop accepting; returns immediately and never hangs, even when no
    /// connection is active or a suspend/update races with it.
    pub fn stop(&self) {
        self.shared.exit.store(true, Ordering::SeqCst);
    }

    /// Block until the serve loop is running.
    pub fn wait_running(&self) {
        let guard = self.shared.running.lock().unwrap();
        let _guard = self
            .shared
            .running_cv
            .wait_while(guard, |running| !*running)
            .unwrap();
    }

    /// Block until the serve loop exited.
    pub fn wait_stopped(&self) {
        let guard = self.shared.running.lock().unwrap();
        let _guard = self
            .shared
            .running_cv
            .wait_while(guard, |running| *running)
            .unwrap();
    }

    /// Handle for controlling the server from another thread while `serve`
    /// blocks this one.
    pub fn controller(&self) -> ServerController {
        ServerController {
            shared: self.shared.clone(),
            staple_cache: self.staple_cache.clone(),
            grace_period: self.grace_period,
        }
    }

    fn promote_after_grace(&self) {
        let mut resume_at = self.shared.resume_at.lock().unwrap();
        if let Some(at) = *resume_at {
            if Instant::now() >= at {
                *resume_at = None;
                drop(resume_at);
                let mut state = self.shared.state.lock().unwrap();
                if *state == ServerState::InitComplete {
                    info!("configuration grace period elapsed, resuming acceptance");
                    *state = ServerState::Running;
                }
            }
        } else {
            drop(resume_at);
            // Entering serve with a complete configuration needs no grace.
            let mut state = self.shared.state.lock().unwrap();
            if *state == ServerState::InitComplete {
                *state = ServerState::Running;
            }
        }
    }

    fn set_state(&self, state: ServerState) {
        *self.shared.state.lock().unwrap() = state;
    }

    fn set_running(&self, running: bool) {
        *self.shared.running.lock().unwrap() = running;
        self.shared.running_cv.notify_all();
    }
}

/// Clonable control handle; `serve` borrows the server itself.
#[derive(Clone)]
pub struct ServerController {
    shared: Arc<Shared>,
    staple_cache: Arc<OcspStapleCache>,
    grace_period: Duration,
}

impl ServerController {
    pub fn stop(&self) {
        self.shared.exit.store(true, Ordering::SeqCst);
    }

    pub fn suspend(&self) {
        info!("suspending TLS acceptance");
        *self.shared.tls.write().unwrap() = None;
        let mut state = self.shared.state.lock().unwrap();
        if matches!(*state, ServerState::Running | ServerState::InitComplete) {
            *state = ServerState::InitSocket;
        }
    }

    pub fn update(&self, config: &ServerConfig) -> bool {
        apply_update(&self.shared, &self.staple_cache, self.grace_period, config)
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn wait_running(&self) {
        let guard = self.shared.running.lock().unwrap();
        let _guard = self
            .shared
            .running_cv
            .wait_while(guard, |running| !*running)
            .unwrap();
    }

    pub fn wait_stopped(&self) {
        let guard = self.shared.running.lock().unwrap();
        let _guard = self
            .shared
            .running_cv
            .wait_while(guard, |running| *running)
            .unwrap();
    }
}

fn apply_update(
    shared: &Shared,
    staple_cache: &Arc<OcspStapleCache>,
    grace_period: Duration,
    config: &ServerConfig,
) -> bool {
    match build_tls(config, staple_cache) {
        Ok(tls) => {
            if !load_staples(config, staple_cache) {
                warn!("one or more OCSP staples could not be loaded");
            }
            *shared.tls.write().unwrap() = Some(Arc::new(tls));

            let mut state = shared.state.lock().unwrap();
            if *state == ServerState::InitSocket {
                *state = ServerState::InitComplete;
                *shared.resume_at.lock().unwrap() = Some(Instant::now() + grace_period);
            }
            true
        }
        Err(e) => {
            error!(error = %e, "TLS configuration failed");
            false
        }
    }
}

fn server_connection(
    tls: &ConfiguredTls,
    socket: std::net::TcpStream,
    peer: SocketAddr,
    io_timeout_ms: u32,
) -> Result<Connection, CertError> {
    let mut ssl = Ssl::new(&tls.default_ctx)?;
    ssl.set_accept_state();
    Connection::new(ssl, socket, peer.to_string(), io_timeout_ms, None, false)
}

fn bind_listener(host: &str, port: u16, ipv6_only: bool) -> std::io::Result<TcpListener> {
    let addr = (host, port)
        .to_socket_addrs()?
        .find(|a| if ipv6_only { a.is_ipv6() } else { true })
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no usable address")
        })?;

    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Build one context per configured chain; the first chain is the default,
/// the others are switched to when the client's trusted_ca_keys request
/// matches their trust anchors.
fn build_tls(
    config: &ServerConfig,
    staple_cache: &Arc<OcspStapleCache>,
) -> Result<ConfiguredTls, CertError> {
    if config.chains.is_empty() {
        return Err(CertError::InvalidOperation(
            "server configuration without certificate chains".into(),
        ));
    }

    let selections: Arc<OnceLock<Vec<ChainSelection>>> = Arc::new(OnceLock::new());

    let mut contexts = Vec::new();
    for chain in &config.chains {
        contexts.push(build_chain_context(
            config,
            chain,
            staple_cache.clone(),
            selections.clone(),
        )?);
    }

    let mut built = Vec::new();
    for (chain, ctx) in config.chains.iter().zip(contexts.iter()) {
        let anchors = chain
            .trust_anchor_file
            .as_deref()
            .map(load_trust_anchors)
            .unwrap_or_default();
        built.push(ChainSelection {
            anchors,
            ctx: ctx.clone(),
        });
    }
    let _ = selections.set(built);

    Ok(ConfiguredTls {
        default_ctx: contexts.swap_remove(0),
        _selections: selections,
    })
}

fn build_chain_context(
    config: &ServerConfig,
    chain: &ChainConfig,
    staple_cache: Arc<OcspStapleCache>,
    selections: Arc<OnceLock<Vec<ChainSelection>>>,
) -> Result<SslContext, CertError> {
    let mut builder = SslContext::builder(SslMethod::tls_server())?;
    configure_protocols(&mut builder, config.ciphersuites.as_deref(), config.cipher_list.as_deref())?;

    builder.set_certificate_chain_file(&chain.certificate_chain_file)?;
    let key = load_key(&chain.private_key_file, chain.private_key_password.as_deref())?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;

    if config.verify_client {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        if let Some(locations) = &config.verify_locations_file {
            builder.set_ca_file(locations)?;
        }
    } else {
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_default_verify_paths()?;
    }

    // status_request: staple from the cache unless the client also asked for
    // status_request_v2 (which wins on TLS 1.2 and below).
    builder.set_status_callback(move |ssl| {
        let v2_requested = ssl
            .ex_data(flags_index())
            .map(|f| f.saw_status_request_v2())
            .unwrap_or(false);
        let tls13 = ssl.version2() == Some(SslVersion::TLS1_3);

        if !should_staple_v1(v2_requested, tls13) {
            debug!("withholding status_request staple in favour of status_request_v2");
            return Ok(false);
        }

        let Some(cert) = ssl.certificate() else {
            return Ok(false);
        };
        let Some(digest) = OcspStapleCache::digest(&cert.to_owned()) else {
            return Ok(false);
        };
        match staple_cache.lookup(&digest) {
            Some(response) => {
                ssl.set_ocsp_status(&response)?;
                Ok(true)
            }
            None => Ok(false),
        }
    })?;

    // status_request_v2: record the request; composing the v2 response needs
    // CertificateStatus support the library does not expose, so none is sent.
    builder.add_custom_ext(
        TLSEXT_STATUS_REQUEST_V2,
        ExtensionContext::TLS_ONLY
            | ExtensionContext::CLIENT_HELLO
            | ExtensionContext::TLS1_2_SERVER_HELLO
            | ExtensionContext::IGNORE_ON_RESUMPTION,
        |_, _, _| Ok(None::<Vec<u8>>),
        |ssl, ctx, _data, _cert| {
            if ctx.contains(ExtensionContext::CLIENT_HELLO) {
                if let Some(flags) = ssl.ex_data(flags_index()) {
                    flags.status_request_v2.store(true, Ordering::Relaxed);
                }
            }
            Ok(())
        },
    )?;

    // trusted_ca_keys: switch to the chain whose trust anchors the client
    // asked for.
    builder.add_custom_ext(
        TLSEXT_TRUSTED_CA_KEYS,
        ExtensionContext::TLS_ONLY | ExtensionContext::CLIENT_HELLO,
        |_, _, _| Ok(None::<Vec<u8>>),
        move |ssl, _ctx, data, _cert| {
            if let Some(flags) = ssl.ex_data(flags_index()) {
                flags.trusted_ca_keys_seen.store(true, Ordering::Relaxed);
            }
            let Some(request) = TrustedCaKeysData::decode(data) else {
                warn!("malformed trusted_ca_keys extension, keeping default chain");
                return Ok(());
            };
            if let Some(chains) = selections.get() {
                for selection in chains {
                    if request.matches_any(&selection.anchors) {
                        if ssl.set_ssl_context(&selection.ctx).is_err() {
                            warn!("could not switch certificate chain");
                        }
                        break;
                    }
                }
            }
            Ok(())
        },
    )?;

    Ok(builder.build())
}

pub(crate) fn configure_protocols(
    builder: &mut SslContextBuilder,
    ciphersuites: Option<&str>,
    cipher_list: Option<&str>,
) -> Result<(), CertError> {
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    match ciphersuites {
        // Empty string disables TLS 1.3 entirely.
        Some("") => builder.set_max_proto_version(Some(SslVersion::TLS1_2))?,
        Some(suites) => builder.set_ciphersuites(suites)?,
        None => {}
    }
    if let Some(list) = cipher_list {
        builder.set_cipher_list(list)?;
    }
    Ok(())
}

pub(crate) fn load_key(
    path: &Path,
    password: Option<&str>,
) -> Result<PKey<openssl::pkey::Private>, CertError> {
    let data = fs::read(path)?;
    let key = match password {
        Some(pass) => PKey::private_key_from_pem_passphrase(&data, pass.as_bytes())?,
        None => PKey::private_key_from_pem(&data)?,
    };
    Ok(key)
}

/// Pair every chain certificate with its configured OCSP response file and
/// (re)load the staple cache. Chains whose response list does not line up
/// with the certificate count contribute nothing.
fn load_staples(config: &ServerConfig, cache: &Arc<OcspStapleCache>) -> bool {
    let mut entries = Vec::new();
    let mut complete = true;

    for chain in &config.chains {
        if chain.ocsp_response_files.is_empty() {
            continue;
        }

        let certs = match fs::read(&chain.certificate_chain_file)
            .map_err(CertError::Io)
            .and_then(|data| X509::stack_from_pem(&data).map_err(CertError::Crypto))
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not read chain for staple pairing");
                complete = false;
                continue;
            }
        };

        if certs.len() != chain.ocsp_response_files.len() {
            warn!(
                certificates = certs.len(),
                responses = chain.ocsp_response_files.len(),
                "OCSP response files do not match the chain, skipping"
            );
            complete = false;
            continue;
        }

        for (cert, file) in certs.iter().zip(&chain.ocsp_response_files) {
            if let (Some(digest), Some(file)) = (OcspStapleCache::digest(cert), file) {
                entries.push((digest, file.clone()));
            }
        }
    }

    cache.load(&entries) && complete
}

// ----------------------------------------------------------------------------
// Worker pool

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of connection-handling workers. Submissions queue when all
/// workers are busy; `wait_idle` blocks until queued and running work drains.
pub(crate) struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<std::thread::JoinHandle<()>>,
    active: Arc<(Mutex<usize>, Condvar)>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let active: Arc<(Mutex<usize>, Condvar)> = Arc::new((Mutex::new(0), Condvar::new()));

        let workers = (0..size.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let active = active.clone();
                std::thread::Builder::new()
                    .name(format!("tls-conn-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = receiver.lock().unwrap();
                            guard.recv()
                        };
                        match job {
                            Ok(job) => {
                                job();
                                let (count, cv) = &*active;
                                *count.lock().unwrap() -= 1;
                                cv.notify_all();
                            }
                            Err(_) => break,
                        }
                    })
                    .expect("worker thread spawn")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            active,
        }
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        let (count, _) = &*self.active;
        *count.lock().unwrap() += 1;

        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                let (count, cv) = &*self.active;
                *count.lock().unwrap() -= 1;
                cv.notify_all();
            }
        }
    }

    pub fn active(&self) -> usize {
        *self.active.0.lock().unwrap()
    }

    pub fn wait_idle(&self) {
        let (count, cv) = &*self.active;
        let guard = count.lock().unwrap();
        let _guard = cv.wait_while(guard, |active| *active > 0).unwrap();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_runs_and_drains() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(Mutex::new(0));

        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(5));
                *counter.lock().unwrap() += 1;
            });
        }

        pool.wait_idle();
        assert_eq!(*counter.lock().unwrap(), 8);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_stop_without_serve_does_not_hang() {
        let runtime = TlsRuntime::new();
        let server = Server::new(runtime);
        // No listener, no serve loop; stop must return immediately.
        server.stop();
        assert_eq!(server.state(), ServerState::Uninitialized);
    }

    #[test]
    fn test_build_tls_requires_chains() {
        let config = ServerConfig::default();
        let cache = Arc::new(OcspStapleCache::default());
        assert!(build_tls(&config, &cache).is_err());
    }
}
