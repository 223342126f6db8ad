#![forbid(unsafe_code)]

//! QUIC endpoint construction for both sides of the proxy.
//!
//! The listener and the backend dialer share one TLS identity: backends pin
//! the proxy by certificate fingerprint, so the dialer must present exactly
//! the certificate the listener serves.

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use quinn::{ClientConfig, Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use tracing::info;

/// ALPN token shared by the listener and every backend connection.
pub const ALPN_PROTOCOL: &[u8] = b"hytale/1";

/// Flow-control windows for player and control connections.
const INITIAL_MAX_DATA: u32 = 10_000_000;
const STREAM_RECEIVE_WINDOW: u32 = 1_000_000;
const MAX_BIDI_STREAMS: u32 = 100;

/// TLS identity loaded once at startup and reused everywhere.
pub struct TlsMaterial {
	cert_chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
	fingerprint: String,
}

impl TlsMaterial {
	/// Load the configured certificate and key, generating a self-signed pair
	/// when the files do not exist yet.
	pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsMaterial> {
		if !cert_path.exists() || !key_path.exists() {
			info!(
				cert = %cert_path.display(),
				key = %key_path.display(),
				"TLS material not found, generating self-signed certificate"
			);
			generate_self_signed(cert_path, key_path)?;
		}

		let cert_chain = load_cert_chain(cert_path)?;
		let key = load_private_key(key_path)?;
		let fingerprint = certificate_fingerprint(&cert_chain[0]);

		info!(fingerprint = %fingerprint, "loaded proxy certificate");
		Ok(TlsMaterial {
			cert_chain,
			key,
			fingerprint,
		})
	}

	/// Self-signed, in-memory material for tests.
	pub fn ephemeral(subject: &str) -> anyhow::Result<TlsMaterial> {
		let ck = rcgen::generate_simple_self_signed(vec![subject.to_string()]).context("generate self-signed cert")?;
		let cert = CertificateDer::from(ck.cert.der().to_vec());
		let key = PrivateKeyDer::try_from(ck.signing_key.serialize_der()).map_err(|e| anyhow!("parse key der: {e}"))?;
		let fingerprint = certificate_fingerprint(&cert);
		Ok(TlsMaterial {
			cert_chain: vec![cert],
			key,
			fingerprint,
		})
	}

	/// base64url(SHA-256) of the leaf certificate; backends pin this value.
	pub fn fingerprint(&self) -> &str {
		&self.fingerprint
	}
}

/// Bind the client-facing QUIC server. Mutual TLS: clients must present a
/// certificate, but any certificate is accepted; the leaf is fingerprinted
/// per session instead of chain-validated.
pub fn server_endpoint(bind_addr: SocketAddr, tls: &TlsMaterial, idle_timeout: Duration) -> anyhow::Result<Endpoint> {
	let mut tls_config = rustls::ServerConfig::builder()
		.with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
		.with_single_cert(tls.cert_chain.clone(), tls.key.clone_key())
		.context("build rustls server config")?;
	tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
		.context("convert rustls ServerConfig -> quinn QuicServerConfig")?;

	let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));
	server_config.transport_config(Arc::new(transport_config(idle_timeout)?));

	let endpoint = Endpoint::server(server_config, bind_addr).context("bind quinn endpoint")?;
	Ok(endpoint)
}

/// Build the outbound endpoint used by the backend dialer and the control
/// manager. Presents the proxy's own certificate; server certificates are not
/// validated (backends authenticate the proxy through the shared secret).
pub fn client_endpoint(tls: &TlsMaterial, idle_timeout: Duration, bbr: bool) -> anyhow::Result<Endpoint> {
	let mut tls_config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoServerVerification))
		.with_client_auth_cert(tls.cert_chain.clone(), tls.key.clone_key())
		.context("build rustls client config")?;
	tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
		.context("convert rustls ClientConfig -> quinn QuicClientConfig")?;

	let mut client_config = ClientConfig::new(Arc::new(quic_tls));
	let mut transport = transport_config(idle_timeout)?;
	if bbr {
		transport.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
	}
	client_config.transport_config(Arc::new(transport));

	let mut endpoint = Endpoint::client("0.0.0.0:0".parse().expect("wildcard addr")).context("bind client endpoint")?;
	endpoint.set_default_client_config(client_config);
	Ok(endpoint)
}

fn transport_config(idle_timeout: Duration) -> anyhow::Result<TransportConfig> {
	let mut transport = TransportConfig::default();
	transport.receive_window(VarInt::from_u32(INITIAL_MAX_DATA));
	transport.stream_receive_window(VarInt::from_u32(STREAM_RECEIVE_WINDOW));
	transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_BIDI_STREAMS));
	transport.max_idle_timeout(Some(
		IdleTimeout::try_from(idle_timeout).map_err(|e| anyhow!("idle timeout out of range: {e}"))?,
	));
	Ok(transport)
}

/// base64url(SHA-256(der)).
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
	let digest = Sha256::digest(cert.as_ref());
	URL_SAFE_NO_PAD.encode(digest)
}

/// Fingerprint of the TLS leaf certificate the peer presented, if any.
pub fn peer_fingerprint(connection: &quinn::Connection) -> Option<String> {
	let identity = connection.peer_identity()?;
	let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
	certs.first().map(certificate_fingerprint)
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
	let ck =
		rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed certificate")?;

	if let Some(parent) = cert_path.parent() {
		fs::create_dir_all(parent).with_context(|| format!("create cert directory {}", parent.display()))?;
	}
	if let Some(parent) = key_path.parent() {
		fs::create_dir_all(parent).with_context(|| format!("create key directory {}", parent.display()))?;
	}

	fs::write(cert_path, ck.cert.pem()).with_context(|| format!("write certificate to {}", cert_path.display()))?;
	fs::write(key_path, ck.signing_key.serialize_pem()).with_context(|| format!("write key to {}", key_path.display()))?;
	Ok(())
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let certs = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if certs.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}

	Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let Some(key) = private_key(&mut reader).context("parse tls key")? else {
		return Err(anyhow!("no private key found in {}", path.display()));
	};
	Ok(key)
}

/// Requires a client certificate but accepts any; the session records the
/// leaf fingerprint instead of validating a chain.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl rustls::server::danger::ClientCertVerifier for AcceptAnyClientCert {
	fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
		&[]
	}

	fn verify_client_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
		Ok(rustls::server::danger::ClientCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

/// Skips server certificate validation on outbound connections.
#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}
