#![forbid(unsafe_code)]

//! End-to-end session tests over real QUIC on loopback: a scripted backend
//! that verifies referrals, a stub session service, and a game client
//! driving the full authentication handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::{Bytes, BytesMut};
use numdrassl_protocol::framing::{MAX_FRAME_SIZE, encode_frame, try_decode_frame};
use numdrassl_protocol::packets::{Connect, Frame};
use numdrassl_protocol::plugin_message::PluginMessage;
use numdrassl_protocol::referral;
use numdrassl_proxy::config::{BackendServer, ProxyConfig};
use numdrassl_proxy::quic::{TlsMaterial, client_endpoint, server_endpoint};
use numdrassl_proxy::session::SessionState;
use numdrassl_proxy::{NoopHooks, Proxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(10);
const SECRET: &str = "session-flow-test-secret";

fn install_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

// ---- stub session service ---------------------------------------------------

async fn run_session_service(listener: TcpListener, fail_exchange: Arc<AtomicBool>) {
	loop {
		let Ok((mut stream, _)) = listener.accept().await else {
			return;
		};
		let fail_exchange = Arc::clone(&fail_exchange);

		tokio::spawn(async move {
			let mut raw = Vec::new();
			let mut tmp = [0u8; 2048];

			// Read headers.
			let header_end = loop {
				let Ok(n) = stream.read(&mut tmp).await else {
					return;
				};
				if n == 0 {
					return;
				}
				raw.extend_from_slice(&tmp[..n]);
				if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
					break pos + 4;
				}
			};

			let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
			let content_length = head
				.lines()
				.find_map(|line| {
					let (name, value) = line.split_once(':')?;
					if name.eq_ignore_ascii_case("content-length") {
						value.trim().parse::<usize>().ok()
					} else {
						None
					}
				})
				.unwrap_or(0);

			while raw.len() < header_end + content_length {
				let Ok(n) = stream.read(&mut tmp).await else {
					return;
				};
				if n == 0 {
					break;
				}
				raw.extend_from_slice(&tmp[..n]);
			}

			let path = head.lines().next().and_then(|l| l.split_whitespace().nth(1)).unwrap_or("");

			let (status, body) = match path {
				"/session/grant" => (
					"200 OK",
					r#"{"authorizationGrant":"grant-1","serverIdentityToken":"sit-1"}"#.to_string(),
				),
				"/session/exchange" => {
					if fail_exchange.load(Ordering::Acquire) {
						("403 Forbidden", r#"{"error":"grant rejected"}"#.to_string())
					} else {
						("200 OK", r#"{"serverAccessToken":"sat-1"}"#.to_string())
					}
				}
				_ => ("404 Not Found", "{}".to_string()),
			};

			let response = format!(
				"HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
				body.len()
			);
			let _ = stream.write_all(response.as_bytes()).await;
			let _ = stream.shutdown().await;
		});
	}
}

// ---- scripted backend -------------------------------------------------------

#[derive(Debug)]
enum BackendEvent {
	PlayerConnect {
		backend: String,
		username: String,
	},
	ControlHandshake {
		backend: String,
	},
}

async fn run_fake_backend(endpoint: quinn::Endpoint, name: String, events: mpsc::UnboundedSender<BackendEvent>) {
	while let Some(incoming) = endpoint.accept().await {
		let name = name.clone();
		let events = events.clone();

		tokio::spawn(async move {
			let Ok(connection) = incoming.await else {
				return;
			};
			let Ok((send, mut recv)) = connection.accept_bi().await else {
				return;
			};
			let mut send = send;
			let mut buf = BytesMut::new();
			let mut tmp = [0u8; 8192];
			let mut is_control: Option<bool> = None;

			loop {
				let n = match recv.read(&mut tmp).await {
					Ok(Some(n)) => n,
					_ => return,
				};
				buf.extend_from_slice(&tmp[..n]);

				if is_control.is_none() && buf.len() >= 4 {
					is_control = Some(PluginMessage::is_plugin_message(&buf));
				}

				match is_control {
					Some(true) => {
						while let Ok(Some(message)) = PluginMessage::try_decode(&mut buf) {
							if message.channel == "numdrassl:control_handshake" {
								let verified = referral::verify_control_referral(
									&message.payload,
									&name,
									numdrassl_proxy::util::unix_ms_now(),
									SECRET.as_bytes(),
								);
								if verified.is_ok() {
									let _ = events.send(BackendEvent::ControlHandshake { backend: name.clone() });
								}
							}
						}
					}
					Some(false) => loop {
						match try_decode_frame(&mut buf, MAX_FRAME_SIZE) {
							Ok(Some(Frame::Connect(connect))) => {
								let referral_data = connect.referral_data.as_deref().unwrap_or_default();
								let verified = referral::verify_player_referral(
									referral_data,
									connect.uuid,
									&connect.username,
									&name,
									numdrassl_proxy::util::unix_ms_now(),
									SECRET.as_bytes(),
								);

								if verified.is_err() {
									let frame = Frame::Disconnect {
										reason: "referral rejected".to_string(),
									};
									let _ = send.write_all(&encode_frame(&frame, MAX_FRAME_SIZE).expect("encode")).await;
									return;
								}

								let _ = events.send(BackendEvent::PlayerConnect {
									backend: name.clone(),
									username: connect.username.clone(),
								});
								let accept = encode_frame(&Frame::ConnectAccept, MAX_FRAME_SIZE).expect("encode");
								if send.write_all(&accept).await.is_err() {
									return;
								}
							}
							Ok(Some(Frame::Raw { packet_id, body })) => {
								// Echo opaque traffic back through the proxy.
								let echo = encode_frame(&Frame::Raw { packet_id, body }, MAX_FRAME_SIZE).expect("encode");
								if send.write_all(&echo).await.is_err() {
									return;
								}
							}
							Ok(Some(_)) => {}
							Ok(None) => break,
							Err(_) => return,
						}
					},
					None => {}
				}
			}
		});
	}
}

// ---- test client ------------------------------------------------------------

struct TestClient {
	connection: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
}

impl TestClient {
	async fn connect(endpoint: &quinn::Endpoint, addr: SocketAddr) -> anyhow::Result<TestClient> {
		let connection = tokio::time::timeout(TIMEOUT, endpoint.connect(addr, "localhost")?)
			.await
			.context("connect timeout")??;
		let (send, recv) = connection.open_bi().await?;
		Ok(TestClient {
			connection,
			send,
			recv,
			buf: BytesMut::new(),
		})
	}

	async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
		let wire = encode_frame(frame, MAX_FRAME_SIZE)?;
		self.send.write_all(&wire).await?;
		Ok(())
	}

	async fn next_frame(&mut self) -> anyhow::Result<Frame> {
		let deadline = tokio::time::Instant::now() + TIMEOUT;
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(frame) = try_decode_frame(&mut self.buf, MAX_FRAME_SIZE)? {
				return Ok(frame);
			}

			let n = tokio::time::timeout_at(deadline, self.recv.read(&mut tmp))
				.await
				.context("timed out waiting for frame")??
				.ok_or_else(|| anyhow!("stream closed while waiting for frame"))?;
			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	async fn handshake(&mut self, uuid: Uuid, username: &str, server_grant: &str) -> anyhow::Result<Frame> {
		self.send_frame(&Frame::Connect(Connect {
			uuid,
			username: username.to_string(),
			protocol_hash: "hash-1".to_string(),
			identity_token: "identity-token-1".to_string(),
			referral_data: None,
		}))
		.await?;

		let grant = self.next_frame().await?;
		match &grant {
			Frame::AuthGrant { .. } => {}
			other => return Err(anyhow!("expected AuthGrant, got {other:?}")),
		}

		self.send_frame(&Frame::AuthToken {
			access_token: "access-token-1".to_string(),
			server_authorization_grant: server_grant.to_string(),
		})
		.await?;

		self.next_frame().await
	}
}

// ---- harness ----------------------------------------------------------------

struct Harness {
	proxy: Proxy,
	proxy_addr: SocketAddr,
	client_endpoint: quinn::Endpoint,
	events: mpsc::UnboundedReceiver<BackendEvent>,
	fail_exchange: Arc<AtomicBool>,
	_tempdir: tempfile::TempDir,
}

impl Harness {
	async fn next_player_connect(&mut self) -> anyhow::Result<(String, String)> {
		let deadline = tokio::time::Instant::now() + TIMEOUT;
		loop {
			let event = tokio::time::timeout_at(deadline, self.events.recv())
				.await
				.context("timed out waiting for backend event")?
				.ok_or_else(|| anyhow!("backend event channel closed"))?;
			if let BackendEvent::PlayerConnect { backend, username } = event {
				return Ok((backend, username));
			}
		}
	}
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) -> anyhow::Result<()> {
	for _ in 0..200 {
		if condition() {
			return Ok(());
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	Err(anyhow!("timed out waiting for {what}"))
}

async fn start_harness(max_connections: usize) -> anyhow::Result<Harness> {
	install_crypto_provider();

	// Stub identity service.
	let http_listener = TcpListener::bind("127.0.0.1:0").await?;
	let http_addr = http_listener.local_addr()?;
	let fail_exchange = Arc::new(AtomicBool::new(false));
	tokio::spawn(run_session_service(http_listener, Arc::clone(&fail_exchange)));

	// Two scripted backends.
	let (events_tx, events_rx) = mpsc::unbounded_channel();
	let mut backend_addrs = Vec::new();
	for name in ["lobby", "arena"] {
		let tls = TlsMaterial::ephemeral("localhost")?;
		let endpoint = server_endpoint("127.0.0.1:0".parse()?, &tls, Duration::from_secs(30))?;
		backend_addrs.push(endpoint.local_addr()?);
		tokio::spawn(run_fake_backend(endpoint, name.to_string(), events_tx.clone()));
	}

	let tempdir = tempfile::tempdir()?;
	let mut config = ProxyConfig::default();
	config.bind_address = "127.0.0.1".to_string();
	config.bind_port = 0;
	config.certificate_path = tempdir.path().join("server.crt");
	config.private_key_path = tempdir.path().join("server.key");
	config.max_connections = max_connections;
	config.connection_timeout_seconds = 5;
	config.proxy_secret = Some(SECRET.to_string());
	config.session_service.base_url = format!("http://{http_addr}");
	config.session_service.timeout_seconds = 5;
	config.backends = vec![
		BackendServer {
			name: "lobby".to_string(),
			host: "127.0.0.1".to_string(),
			port: backend_addrs[0].port(),
			default_server: true,
			hostname: Some("localhost".to_string()),
		},
		BackendServer {
			name: "arena".to_string(),
			host: "127.0.0.1".to_string(),
			port: backend_addrs[1].port(),
			default_server: false,
			hostname: Some("localhost".to_string()),
		},
	];

	let proxy = Proxy::start(config, Arc::new(NoopHooks)).await?;
	let proxy_addr = proxy.local_addr()?;

	{
		let proxy = proxy.clone();
		tokio::spawn(async move {
			let _ = proxy.run().await;
		});
	}

	let client_tls = TlsMaterial::ephemeral("client")?;
	let client_endpoint = client_endpoint(&client_tls, Duration::from_secs(30), false)?;

	Ok(Harness {
		proxy,
		proxy_addr,
		client_endpoint,
		events: events_rx,
		fail_exchange,
		_tempdir: tempdir,
	})
}

// ---- scenarios --------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_handshake_and_forwarding() -> anyhow::Result<()> {
	let mut harness = start_harness(100).await?;
	let uuid = Uuid::new_v4();

	let mut client = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	let reply = client.handshake(uuid, "Steve", "server-grant-1").await?;

	match reply {
		Frame::ServerAuthToken { server_access_token } => {
			assert_eq!(server_access_token.as_deref(), Some("sat-1"));
		}
		other => panic!("expected ServerAuthToken, got {other:?}"),
	}

	let (backend, username) = harness.next_player_connect().await?;
	assert_eq!(backend, "lobby");
	assert_eq!(username, "Steve");

	let proxy = harness.proxy.clone();
	wait_until("session CONNECTED", || {
		proxy
			.get_player_by_uuid(uuid)
			.map(|s| s.state() == SessionState::Connected)
			.unwrap_or(false)
	})
	.await?;

	// Exactly one session under this uuid.
	assert_eq!(harness.proxy.player_count(), 1);
	let session = harness.proxy.get_player_by_uuid(uuid).expect("session");
	assert_eq!(session.username().as_deref(), Some("Steve"));
	assert_eq!(session.current_backend().map(|b| b.name), Some("lobby".to_string()));

	// Opaque traffic flows both ways (the backend echoes).
	client
		.send_frame(&Frame::Raw {
			packet_id: 0x4242,
			body: Bytes::from_static(b"movement-data"),
		})
		.await?;

	let echoed = client.next_frame().await?;
	assert_eq!(
		echoed,
		Frame::Raw {
			packet_id: 0x4242,
			body: Bytes::from_static(b"movement-data"),
		}
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_server_grant_skips_exchange() -> anyhow::Result<()> {
	let mut harness = start_harness(100).await?;
	let uuid = Uuid::new_v4();

	let mut client = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	let reply = client.handshake(uuid, "Alex", "").await?;

	match reply {
		Frame::ServerAuthToken { server_access_token } => assert!(server_access_token.is_none()),
		other => panic!("expected ServerAuthToken, got {other:?}"),
	}

	// Backend connect proceeds with the null server access token.
	let (backend, username) = harness.next_player_connect().await?;
	assert_eq!(backend, "lobby");
	assert_eq!(username, "Alex");

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_grant_exchange_disconnects() -> anyhow::Result<()> {
	let mut harness = start_harness(100).await?;
	harness.fail_exchange.store(true, Ordering::Release);
	let uuid = Uuid::new_v4();

	let mut client = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	let reply = client.handshake(uuid, "Steve", "server-grant-1").await?;

	match reply {
		Frame::Disconnect { reason } => assert_eq!(reason, "Server authentication failed"),
		other => panic!("expected Disconnect, got {other:?}"),
	}

	let proxy = harness.proxy.clone();
	wait_until("session removed", || proxy.get_player_by_uuid(uuid).is_none()).await?;

	// No backend transport was opened for this player.
	harness.fail_exchange.store(false, Ordering::Release);
	assert!(
		tokio::time::timeout(Duration::from_millis(500), harness.next_player_connect())
			.await
			.is_err()
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_session_transfer_keeps_client_connected() -> anyhow::Result<()> {
	let mut harness = start_harness(100).await?;
	let uuid = Uuid::new_v4();

	let mut client = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	client.handshake(uuid, "Steve", "server-grant-1").await?;
	harness.next_player_connect().await?;

	let proxy = harness.proxy.clone();
	wait_until("session CONNECTED", || {
		proxy
			.get_player_by_uuid(uuid)
			.map(|s| s.state() == SessionState::Connected)
			.unwrap_or(false)
	})
	.await?;

	let session = harness.proxy.get_player_by_uuid(uuid).expect("session");

	// Switching to the current backend is refused without side effects.
	assert!(!harness.proxy.switch_player_to(&session, "LOBBY").await);

	assert!(harness.proxy.switch_player_to(&session, "arena").await);

	let (backend, username) = harness.next_player_connect().await?;
	assert_eq!(backend, "arena");
	assert_eq!(username, "Steve");

	// The success notice arrives after the new backend accepted.
	let notice = client.next_frame().await?;
	match notice {
		Frame::ServerMessage { segments, .. } => {
			assert_eq!(segments[1].text, "arena");
		}
		other => panic!("expected ServerMessage, got {other:?}"),
	}

	let proxy = harness.proxy.clone();
	wait_until("transfer completed", || {
		proxy
			.get_player_by_uuid(uuid)
			.and_then(|s| s.current_backend())
			.map(|b| b.name == "arena")
			.unwrap_or(false)
	})
	.await?;

	let session = harness.proxy.get_player_by_uuid(uuid).expect("session survives transfer");
	assert_eq!(session.state(), SessionState::Connected);

	// Client side stayed up the whole time: traffic still flows.
	client
		.send_frame(&Frame::Raw {
			packet_id: 0x1111,
			body: Bytes::from_static(b"post-transfer"),
		})
		.await?;
	let echoed = client.next_frame().await?;
	assert_eq!(
		echoed,
		Frame::Raw {
			packet_id: 0x1111,
			body: Bytes::from_static(b"post-transfer"),
		}
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_uuid_closes_older_session() -> anyhow::Result<()> {
	let mut harness = start_harness(100).await?;
	let uuid = Uuid::new_v4();

	let mut first = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	first.handshake(uuid, "Steve", "server-grant-1").await?;
	harness.next_player_connect().await?;

	let proxy = harness.proxy.clone();
	wait_until("first session CONNECTED", || {
		proxy
			.get_player_by_uuid(uuid)
			.map(|s| s.state() == SessionState::Connected)
			.unwrap_or(false)
	})
	.await?;
	let first_session_id = harness.proxy.get_player_by_uuid(uuid).expect("session").id();

	let mut second = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	second.handshake(uuid, "Steve", "server-grant-1").await?;
	harness.next_player_connect().await?;

	// The older session is closed; only the newer one remains under the uuid.
	tokio::time::timeout(TIMEOUT, first.connection.closed())
		.await
		.context("first client connection should be closed")?;

	let proxy = harness.proxy.clone();
	wait_until("second session owns the uuid", || {
		proxy
			.get_player_by_uuid(uuid)
			.map(|s| s.id() != first_session_id && s.state() == SessionState::Connected)
			.unwrap_or(false)
	})
	.await?;

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_unreachable_degrades_to_single_node() -> anyhow::Result<()> {
	install_crypto_provider();

	// An unreachable broker: nothing listens on this port.
	let parked = TcpListener::bind("127.0.0.1:0").await?;
	let dead_port = parked.local_addr()?.port();
	drop(parked);

	let tempdir = tempfile::tempdir()?;
	let mut config = ProxyConfig::default();
	config.bind_address = "127.0.0.1".to_string();
	config.bind_port = 0;
	config.certificate_path = tempdir.path().join("server.crt");
	config.private_key_path = tempdir.path().join("server.key");
	config.proxy_secret = Some(SECRET.to_string());
	config.cluster.enabled = true;
	config.cluster.proxy_id = Some("degraded-proxy".to_string());
	config.cluster.redis_host = "127.0.0.1".to_string();
	config.cluster.redis_port = dead_port;

	let proxy = Proxy::start(config, Arc::new(NoopHooks)).await?;

	// Loopback fallback: single-node answers everywhere.
	assert!(!proxy.is_cluster_mode());
	assert_eq!(proxy.global_player_count(), proxy.player_count() as u32);
	assert_eq!(proxy.online_proxies().len(), 1);
	assert_eq!(proxy.online_proxies()[0].proxy_id, "degraded-proxy");

	// Server registration still works and does not throw.
	proxy.register_server("duels", "10.0.0.9", 5530, false).await;
	assert!(proxy.get_server("DUELS").is_some());

	// Re-registering the same case-insensitive name replaces the entry.
	proxy.register_server("Duels", "10.0.0.10", 5531, false).await;
	let replaced = proxy.get_server("duels").expect("present");
	assert_eq!(replaced.host, "10.0.0.10");
	assert_eq!(replaced.port, 5531);

	// A remote entry with the same name is shadowed by the local one and
	// becomes visible again once the local entry is unregistered.
	use numdrassl_protocol::cluster::{ServerListKind, ServerListMessage};
	proxy.cluster().server_list().handle_message(&ServerListMessage {
		source_proxy_id: "peer-1".to_string(),
		timestamp_ms: 0,
		kind: ServerListKind::Register,
		server_name: "duels".to_string(),
		host: Some("10.9.9.9".to_string()),
		port: Some(7000),
		is_default: false,
	});

	let shadowed = proxy.get_server("duels").expect("present");
	assert!(shadowed.is_local());

	assert!(proxy.unregister_server("duels").await);
	let remote = proxy.get_server("duels").expect("remote fallback");
	assert_eq!(remote.owner_proxy_id.as_deref(), Some("peer-1"));

	assert!(!proxy.unregister_server("duels").await);

	proxy.shutdown().await;
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_cap_refuses_excess_clients() -> anyhow::Result<()> {
	let harness = start_harness(1).await?;
	let uuid = Uuid::new_v4();

	let mut first = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await?;
	first.handshake(uuid, "Steve", "server-grant-1").await?;

	let proxy = harness.proxy.clone();
	wait_until("first session registered", || proxy.player_count() == 1).await?;

	// The second transport is refused outright; no session appears.
	let second = TestClient::connect(&harness.client_endpoint, harness.proxy_addr).await;
	assert!(second.is_err());
	assert_eq!(harness.proxy.player_count(), 1);

	Ok(())
}
