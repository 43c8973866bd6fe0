//! TLS client
//!
//! Dials TCP and hands back a [`Connection`] in its initial state; the caller
//! drives the handshake, which keeps both blocking-with-timeout and fully
//! non-blocking integration possible. Failed connects feed the configured
//! reconnect policy: bounded attempts (`-1` = unlimited) with a doubling,
//! capped backoff.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use openssl::ssl::{
    ExtensionContext, Ssl, SslContext, SslMethod, SslVerifyMode, StatusType,
};
use tracing::{debug, error, info, warn};

use super::connection::{Connection, TlsIoError};
use super::extensions::STATUS_REQUEST_V2_CLIENT_PAYLOAD;
use super::server::{configure_protocols, load_key};
use super::{ClientConfig, TlsRuntime, TLSEXT_STATUS_REQUEST_V2, TLSEXT_TRUSTED_CA_KEYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NeedInit,
    Init,
}

/// Retry shape for failed connection attempts. The delay doubles per attempt
/// from `initial_delay` up to `max_delay`; `max_attempts == -1` retries
/// without bound.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempts_made: u32) -> bool {
        self.max_attempts >= 0 && attempts_made >= self.max_attempts as u32
    }
}

pub struct Client {
    _runtime: Arc<TlsRuntime>,
    ctx: Option<SslContext>,
    state: ClientState,
    io_timeout_ms: u32,
    expected_hostname: Option<String>,
    allow_wildcards: bool,
    request_status: bool,
}

impl Client {
    pub fn new(runtime: Arc<TlsRuntime>) -> Self {
        Self {
            _runtime: runtime,
            ctx: None,
            state: ClientState::NeedInit,
            io_timeout_ms: 0,
            expected_hostname: None,
            allow_wildcards: false,
            request_status: false,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Build the client TLS context. Must be called again after certificate
    /// or trust changes; existing connections keep their old context.
    pub fn init(&mut self, config: &ClientConfig) -> bool {
        match build_client_context(config) {
            Ok(ctx) => {
                self.ctx = Some(ctx);
                self.io_timeout_ms = config.io_timeout_ms;
                self.expected_hostname = config.expected_hostname.clone();
                self.allow_wildcards = config.allow_wildcards;
                self.request_status = config.status_request || config.status_request_v2;
                self.state = ClientState::Init;
                true
            }
            Err(e) => {
                error!(error = %e, "client TLS configuration failed");
                false
            }
        }
    }

    /// Dial TCP and wrap the socket; the returned connection has not run its
    /// handshake yet — drive it with [`Connection::connect`].
    pub fn connect(&self, host: &str, port: u16) -> Option<Connection> {
        let ctx = match &self.ctx {
            Some(ctx) => ctx,
            None => {
                error!("connect called before init");
                return None;
            }
        };

        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next()?,
            Err(e) => {
                warn!(host, port, error = %e, "address resolution failed");
                return None;
            }
        };

        let socket = if self.io_timeout_ms > 0 {
            TcpStream::connect_timeout(&addr, Duration::from_millis(u64::from(self.io_timeout_ms)))
        } else {
            TcpStream::connect(addr)
        };
        let socket = match socket {
            Ok(s) => s,
            Err(e) => {
                warn!(host, port, error = %e, "TCP connect failed");
                return None;
            }
        };

        let mut ssl = match Ssl::new(ctx) {
            Ok(ssl) => ssl,
            Err(e) => {
                error!(error = %e, "could not create session");
                return None;
            }
        };
        ssl.set_connect_state();

        if self.request_status {
            // Required for the staple to be surfaced after the handshake.
            if let Err(e) = ssl.set_status_type(StatusType::OCSP) {
                warn!(error = %e, "could not request certificate status");
            }
        }

        match Connection::new(
            ssl,
            socket,
            format!("{host}:{port}"),
            self.io_timeout_ms,
            self.expected_hostname.clone(),
            self.allow_wildcards,
        ) {
            Ok(connection) => Some(connection),
            Err(e) => {
                error!(error = %e, "could not set up connection");
                None
            }
        }
    }

    /// Dial and drive the handshake, retrying failed attempts under
    /// `policy`. Gives up with `None` once attempts are exhausted.
    ///
    /// In non-blocking mode (`io_timeout_ms == 0`) a connection waiting on
    /// socket readiness is returned as-is for the caller to finish driving.
    pub fn connect_with_retry(
        &self,
        host: &str,
        port: u16,
        policy: &ReconnectPolicy,
    ) -> Option<Connection> {
        let mut attempts: u32 = 0;

        loop {
            if let Some(mut connection) = self.connect(host, port) {
                match connection.connect() {
                    Ok(()) => return Some(connection),
                    Err(TlsIoError::WantRead) | Err(TlsIoError::WantWrite) => {
                        return Some(connection)
                    }
                    Err(e) => {
                        warn!(host, port, attempt = attempts, ?e, "handshake failed");
                    }
                }
            }

            attempts += 1;
            if policy.exhausted(attempts) {
                info!(host, port, attempts, "reconnect attempts exhausted, giving up");
                return None;
            }

            let delay = policy.delay_for(attempts - 1);
            debug!(host, port, attempt = attempts, ?delay, "retrying connection");
            std::thread::sleep(delay);
        }
    }
}

fn build_client_context(config: &ClientConfig) -> Result<SslContext, crate::types::CertError> {
    let mut builder = SslContext::builder(SslMethod::tls_client())?;
    configure_protocols(
        &mut builder,
        config.ciphersuites.as_deref(),
        config.cipher_list.as_deref(),
    )?;

    if let Some(chain) = &config.certificate_chain_file {
        builder.set_certificate_chain_file(chain)?;
        if let Some(key_file) = &config.private_key_file {
            let key = load_key(key_file, config.private_key_password.as_deref())?;
            builder.set_private_key(&key)?;
            builder.check_private_key()?;
        }
    }

    if config.verify_server {
        builder.set_verify(SslVerifyMode::PEER);
        if let Some(locations) = &config.verify_locations_file {
            builder.set_ca_file(locations)?;
        }
    } else {
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_default_verify_paths()?;
    }

    if config.status_request || config.status_request_v2 {
        builder.set_status_callback(|ssl| {
            match ssl.ocsp_status() {
                Some(response) => {
                    debug!(bytes = response.len(), "received stapled OCSP response")
                }
                None => debug!("no OCSP response stapled by the server"),
            }
            // The response content is the application's to judge.
            Ok(true)
        })?;
    }

    if config.status_request_v2 {
        builder.add_custom_ext(
            TLSEXT_STATUS_REQUEST_V2,
            ExtensionContext::TLS_ONLY
                | ExtensionContext::CLIENT_HELLO
                | ExtensionContext::TLS1_2_SERVER_HELLO
                | ExtensionContext::IGNORE_ON_RESUMPTION,
            |_, ctx, _| {
                if ctx.contains(ExtensionContext::CLIENT_HELLO) {
                    Ok(Some(STATUS_REQUEST_V2_CLIENT_PAYLOAD.to_vec()))
                } else {
                    Ok(None)
                }
            },
            |_, _, _, _| Ok(()),
        )?;
    }

    if config.trusted_ca_keys && !config.trusted_ca_keys_data.is_empty() {
        let payload = config.trusted_ca_keys_data.encode();
        builder.add_custom_ext(
            TLSEXT_TRUSTED_CA_KEYS,
            ExtensionContext::TLS_ONLY | ExtensionContext::CLIENT_HELLO,
            move |_, ctx, _| {
                if ctx.contains(ExtensionContext::CLIENT_HELLO) {
                    Ok(Some(payload.clone()))
                } else {
                    Ok(None)
                }
            },
            |_, _, _, _| Ok(()),
        )?;
    }

    Ok(builder.build())
}
