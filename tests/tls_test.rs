//! TLS server/client integration tests over loopback sockets.

mod common;

use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;

use common::{ca_cert, make_cert, write_cert, write_chain, write_key, CertSpec};
use evse_pki::tls::{
    Client, ClientConfig, Connection, ReconnectPolicy, Server, ServerConfig, ServerState,
    TlsIoError, TlsRuntime, TrustedCaKeysData,
};
use evse_pki::Certificate;
use openssl::pkey::{PKey, Private};

const IO_TIMEOUT_MS: u32 = 5000;

/// Server-side PKI written into a temp directory.
struct ServerPki {
    _dir: tempfile::TempDir,
    root: Certificate,
    root_file: std::path::PathBuf,
    chain_file: std::path::PathBuf,
    key_file: std::path::PathBuf,
    _root_key: PKey<Private>,
}

fn server_pki(name: &str) -> ServerPki {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (root, root_key) = ca_cert(&format!("{name} Root"), None).unwrap();
    let (leaf, leaf_key) = make_cert(CertSpec {
        cn: &format!("{name} Server"),
        issuer: Some((&root, &root_key)),
        san_dns: Some("localhost"),
        ..Default::default()
    })
    .unwrap();

    let root_file = dir.path().join("root.pem");
    let chain_file = dir.path().join("server_chain.pem");
    let key_file = dir.path().join("server.key");
    write_cert(&root_file, &root).unwrap();
    write_chain(&chain_file, &[&leaf]).unwrap();
    write_key(&key_file, &leaf_key).unwrap();

    ServerPki {
        _dir: dir,
        root,
        root_file,
        chain_file,
        key_file,
        _root_key: root_key,
    }
}

fn server_config(pki: &ServerPki) -> ServerConfig {
    ServerConfig {
        cipher_list: Some("ECDHE-ECDSA-AES128-SHA256".to_string()),
        ciphersuites: Some(String::new()), // TLS 1.2 only
        chains: vec![evse_pki::tls::ChainConfig {
            certificate_chain_file: pki.chain_file.clone(),
            private_key_file: pki.key_file.clone(),
            trust_anchor_file: Some(pki.root_file.clone()),
            ..Default::default()
        }],
        host: "127.0.0.1".to_string(),
        port: 0,
        ipv6_only: false,
        verify_client: false,
        io_timeout_ms: IO_TIMEOUT_MS,
        ..Default::default()
    }
}

fn client_config(pki: &ServerPki) -> ClientConfig {
    ClientConfig {
        verify_locations_file: Some(pki.root_file.clone()),
        io_timeout_ms: IO_TIMEOUT_MS,
        verify_server: true,
        ..Default::default()
    }
}

/// Echo handler: read one byte, write it back, repeat until the peer closes.
fn echo_handler(mut connection: Connection) {
    if connection.accept().is_err() {
        return;
    }
    let mut buf = [0u8; 64];
    loop {
        match connection.read(&mut buf) {
            Ok(n) => {
                if connection.write(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = connection.shutdown();
}

struct RunningServer {
    controller: evse_pki::tls::ServerController,
    addr: SocketAddr,
    handle: JoinHandle<ServerState>,
}

fn start_echo_server(config: &ServerConfig, grace: Duration) -> RunningServer {
    let runtime = TlsRuntime::new();
    runtime.ignore_sigpipe();

    let mut server = Server::new(runtime);
    server.set_grace_period(grace);
    let state = server.init(config);
    assert_eq!(state, ServerState::InitComplete);

    let addr = server.local_addr().unwrap();
    let controller = server.controller();

    let handle = std::thread::spawn(move || server.serve(echo_handler));
    controller.wait_running();

    RunningServer {
        controller,
        addr,
        handle,
    }
}

fn stop(server: RunningServer) {
    server.controller.stop();
    server.controller.wait_stopped();
    assert_eq!(server.handle.join().unwrap(), ServerState::Stopped);
}

fn connect_client(config: &ClientConfig, addr: SocketAddr) -> (Client, Connection) {
    let client = {
        let mut c = Client::new(TlsRuntime::new());
        assert!(c.init(config));
        c
    };
    let connection = client.connect("127.0.0.1", addr.port()).unwrap();
    (client, connection)
}

#[test]
fn start_and_stop_does_not_hang() {
    let pki = server_pki("StartStop");
    let server = start_echo_server(&server_config(&pki), Duration::from_millis(100));
    assert_eq!(server.controller.state(), ServerState::Running);
    stop(server);
}

#[test]
fn echo_round_trip() {
    let pki = server_pki("Echo");
    let server = start_echo_server(&server_config(&pki), Duration::from_millis(100));

    let (_client, mut connection) = connect_client(&client_config(&pki), server.addr);
    assert_eq!(connection.connect(), Ok(()));

    assert_eq!(connection.write(b"x"), Ok(1));
    let mut buf = [0u8; 1];
    assert_eq!(connection.read(&mut buf), Ok(1));
    assert_eq!(&buf, b"x");

    assert_eq!(connection.shutdown(), Ok(()));
    assert_eq!(
        connection.read(&mut buf),
        Err(TlsIoError::Closed),
        "post-shutdown reads report Closed"
    );

    stop(server);
}

#[test]
fn untrusted_server_is_rejected() {
    let pki = server_pki("Untrusted");
    let other = server_pki("OtherRoot");
    let server = start_echo_server(&server_config(&pki), Duration::from_millis(100));

    // Client trusts a different root.
    let (_client, mut connection) = connect_client(&client_config(&other), server.addr);
    assert_eq!(connection.connect(), Err(TlsIoError::Failed));

    stop(server);
}

#[test]
fn hostname_verification_is_manual_and_post_handshake() {
    let pki = server_pki("Hostname");
    let server = start_echo_server(&server_config(&pki), Duration::from_millis(100));

    // The certificate carries SAN DNS:localhost.
    let mut good = client_config(&pki);
    good.expected_hostname = Some("localhost".to_string());
    let (_c1, mut conn) = connect_client(&good, server.addr);
    assert_eq!(conn.connect(), Ok(()));
    let _ = conn.shutdown();

    let mut bad = client_config(&pki);
    bad.expected_hostname = Some("elsewhere.example".to_string());
    let (_c2, mut conn) = connect_client(&bad, server.addr);
    assert_eq!(conn.connect(), Err(TlsIoError::Failed));

    stop(server);
}

#[test]
fn nonblocking_client_surfaces_want_events() {
    let pki = server_pki("NonBlocking");
    let server = start_echo_server(&server_config(&pki), Duration::from_millis(100));

    let mut config = client_config(&pki);
    config.io_timeout_ms = 0;

    let (_client, mut connection) = connect_client(&config, server.addr);

    // Drive the handshake manually; WantRead/WantWrite are normal progress.
    let mut spins = 0;
    loop {
        match connection.connect() {
            Ok(()) => break,
            Err(TlsIoError::WantRead) | Err(TlsIoError::WantWrite) => {
                spins += 1;
                assert!(spins < 10_000, "handshake made no progress");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("handshake failed: {e:?}"),
        }
    }

    assert_eq!(connection.write(b"n"), Ok(1));
    let mut buf = [0u8; 1];
    loop {
        match connection.read(&mut buf) {
            Ok(1) => break,
            Err(TlsIoError::WantRead) => std::thread::sleep(Duration::from_millis(1)),
            other => panic!("unexpected read result: {other:?}"),
        }
    }
    assert_eq!(&buf, b"n");

    loop {
        match connection.shutdown() {
            Ok(()) | Err(TlsIoError::Timeout) => break,
            Err(TlsIoError::WantRead) | Err(TlsIoError::WantWrite) => {
                std::thread::sleep(Duration::from_millis(1))
            }
            Err(_) => break,
        }
    }

    stop(server);
}

#[test]
fn suspend_keeps_live_connections_and_update_resumes() {
    let pki = server_pki("Suspend");
    let config = server_config(&pki);
    let grace = Duration::from_millis(300);
    let server = start_echo_server(&config, grace);

    // Established before suspension.
    let (_c1, mut live) = connect_client(&client_config(&pki), server.addr);
    assert_eq!(live.connect(), Ok(()));

    server.controller.suspend();
    assert_eq!(server.controller.state(), ServerState::InitSocket);

    // The live connection keeps working.
    assert_eq!(live.write(b"a"), Ok(1));
    let mut buf = [0u8; 1];
    assert_eq!(live.read(&mut buf), Ok(1));

    // New attempts fail while suspended.
    let mut refused = client_config(&pki);
    refused.io_timeout_ms = 500;
    let (_c2, mut attempt) = connect_client(&refused, server.addr);
    assert!(attempt.connect().is_err());

    // Update re-arms; after the grace period new connections succeed.
    assert!(server.controller.update(&config));
    assert_eq!(server.controller.state(), ServerState::InitComplete);
    std::thread::sleep(grace + Duration::from_millis(300));
    assert_eq!(server.controller.state(), ServerState::Running);

    let (_c3, mut fresh) = connect_client(&client_config(&pki), server.addr);
    assert_eq!(fresh.connect(), Ok(()));

    // The pre-suspend connection survived the whole rotation.
    assert_eq!(live.write(b"b"), Ok(1));
    assert_eq!(live.read(&mut buf), Ok(1));
    assert_eq!(&buf, b"b");

    let _ = live.shutdown();
    let _ = fresh.shutdown();
    stop(server);
}

#[test]
fn reconnect_policy_gives_up_after_bounded_attempts() {
    let pki = server_pki("Reconnect");
    let mut client = Client::new(TlsRuntime::new());
    let mut config = client_config(&pki);
    config.io_timeout_ms = 200;
    assert!(client.init(&config));

    // Nobody listens on this port.
    let policy = ReconnectPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
    };
    let started = std::time::Instant::now();
    assert!(client.connect_with_retry("127.0.0.1", 1, &policy).is_none());
    // One backoff delay between the two attempts.
    assert!(started.elapsed() >= Duration::from_millis(10));
}

#[test]
fn status_request_staples_cached_response() {
    let pki = server_pki("Staple");

    let response_file = pki.chain_file.parent().unwrap().join("leaf.ocsp.der");
    std::fs::write(&response_file, b"\x30\x0a\x0a\x01\x00\xa0\x03\x02\x01\x00").unwrap();

    let mut config = server_config(&pki);
    config.chains[0].ocsp_response_files = vec![Some(response_file.clone())];
    let server = start_echo_server(&config, Duration::from_millis(100));

    // status_request alone: the staple arrives.
    let mut with_v1 = client_config(&pki);
    with_v1.status_request = true;
    let (_c1, mut conn) = connect_client(&with_v1, server.addr);
    assert_eq!(conn.connect(), Ok(()));
    assert_eq!(
        conn.ocsp_response().as_deref(),
        Some(&b"\x30\x0a\x0a\x01\x00\xa0\x03\x02\x01\x00"[..])
    );
    let _ = conn.shutdown();

    // Both extensions requested: v2 takes precedence on TLS 1.2, and since a
    // v2 response cannot be composed, no v1 staple is sent.
    let mut with_both = client_config(&pki);
    with_both.status_request = true;
    with_both.status_request_v2 = true;
    let (_c2, mut conn) = connect_client(&with_both, server.addr);
    assert_eq!(conn.connect(), Ok(()));
    assert_eq!(conn.ocsp_response(), None);
    let _ = conn.shutdown();

    stop(server);
}

#[test]
fn trusted_ca_keys_selects_the_matching_chain() {
    let pki_a = server_pki("ChainA");
    let pki_b = server_pki("ChainB");

    // Default chain is A; B is selectable via trusted_ca_keys.
    let mut config = server_config(&pki_a);
    config.chains.push(evse_pki::tls::ChainConfig {
        certificate_chain_file: pki_b.chain_file.clone(),
        private_key_file: pki_b.key_file.clone(),
        trust_anchor_file: Some(pki_b.root_file.clone()),
        ..Default::default()
    });
    let server = start_echo_server(&config, Duration::from_millis(100));

    // Without the extension the default chain (A) is presented: a client
    // trusting only B fails.
    let mut plain_b = client_config(&pki_b);
    plain_b.io_timeout_ms = 1000;
    let (_c1, mut conn) = connect_client(&plain_b, server.addr);
    assert_eq!(conn.connect(), Err(TlsIoError::Failed));

    // Advertising B's root switches the server to chain B.
    let mut hinted_b = client_config(&pki_b);
    hinted_b.trusted_ca_keys = true;
    hinted_b.trusted_ca_keys_data =
        TrustedCaKeysData::from_certificates(std::slice::from_ref(&pki_b.root)).unwrap();
    let (_c2, mut conn) = connect_client(&hinted_b, server.addr);
    assert_eq!(conn.connect(), Ok(()));
    let _ = conn.shutdown();

    // Chain A clients keep working against the default.
    let (_c3, mut conn) = connect_client(&client_config(&pki_a), server.addr);
    assert_eq!(conn.connect(), Ok(()));
    let _ = conn.shutdown();

    stop(server);
}

#[test]
fn client_certificate_is_required_when_verifying_clients() {
    let server_side = server_pki("MutualServer");
    let client_side = server_pki("MutualClient");

    let mut config = server_config(&server_side);
    config.verify_client = true;
    config.verify_locations_file = Some(client_side.root_file.clone());
    let server = start_echo_server(&config, Duration::from_millis(100));

    // Without a client certificate the handshake fails.
    let mut anon = client_config(&server_side);
    anon.io_timeout_ms = 1000;
    let (_c1, mut conn) = connect_client(&anon, server.addr);
    assert!(conn.connect().is_err());

    // With a certificate from the trusted client PKI it succeeds.
    let mut authed = client_config(&server_side);
    authed.certificate_chain_file = Some(client_side.chain_file.clone());
    authed.private_key_file = Some(client_side.key_file.clone());
    let (_c2, mut conn) = connect_client(&authed, server.addr);
    assert_eq!(conn.connect(), Ok(()));
    let _ = conn.shutdown();

    stop(server);
}
