#![forbid(unsafe_code)]

//! HMAC-signed referral blobs.
//!
//! A referral authorizes a backend to accept a connection without consulting
//! the external session service. Player and control variants share the same
//! outer framing; the first length-prefixed field disambiguates: the player
//! variant starts with the 16-byte player uuid, the control variant with the
//! 17-byte ASCII marker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Marker identifying a control-connection handshake blob.
pub const CONTROL_MARKER: &str = "NUMDRASSL_CONTROL";

/// Accepted clock skew for referral timestamps, in milliseconds.
pub const TIMESTAMP_WINDOW_MS: i64 = 5 * 60 * 1000;

const HMAC_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferralError {
	/// Malformed data or signature mismatch.
	#[error("invalid referral")]
	InvalidReferral,

	/// Timestamp outside the accepted window.
	#[error("stale referral")]
	StaleReferral,

	/// Declared identity does not match the connection presenting the blob.
	#[error("referral identity mismatch")]
	IdentityMismatch,
}

/// Decoded player-info referral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerReferral {
	pub uuid: Uuid,
	pub username: String,
	pub backend_name: String,
	pub client_ip: String,
	pub timestamp_ms: i64,
}

/// Sign a player-info referral for the given destination backend.
pub fn sign_player_referral(
	uuid: Uuid,
	username: &str,
	backend_name: &str,
	client_ip: &str,
	timestamp_ms: i64,
	secret: &[u8],
) -> Bytes {
	let mut buf = BytesMut::new();
	buf.put_u16(16);
	buf.put_slice(uuid.as_bytes());
	buf.put_i64(timestamp_ms);
	put_field(&mut buf, backend_name.as_bytes());
	put_field(&mut buf, username.as_bytes());
	put_field(&mut buf, client_ip.as_bytes());

	let tag = hmac_tag(&buf, secret);
	buf.put_slice(&tag);
	buf.freeze()
}

/// Decode a player-info referral, checking only the signature and timestamp.
///
/// Used by the proxy when consuming a referral out of an inbound `Connect`:
/// the caller still owns the identity check against the presenting session.
pub fn decode_player_referral(data: &[u8], now_ms: i64, secret: &[u8]) -> Result<PlayerReferral, ReferralError> {
	verify_tag(data, secret)?;
	let signed = &data[..data.len() - HMAC_LEN];

	let mut buf = Bytes::copy_from_slice(signed);
	let uuid_field = get_field(&mut buf)?;
	if uuid_field.len() != 16 {
		return Err(ReferralError::InvalidReferral);
	}
	let mut raw = [0u8; 16];
	raw.copy_from_slice(&uuid_field);
	let uuid = Uuid::from_bytes(raw);

	if buf.remaining() < 8 {
		return Err(ReferralError::InvalidReferral);
	}
	let timestamp_ms = buf.get_i64();

	let backend_name = get_str_field(&mut buf)?;
	let username = get_str_field(&mut buf)?;
	let client_ip = get_str_field(&mut buf)?;

	if (now_ms - timestamp_ms).abs() > TIMESTAMP_WINDOW_MS {
		return Err(ReferralError::StaleReferral);
	}

	Ok(PlayerReferral {
		uuid,
		username,
		backend_name,
		client_ip,
		timestamp_ms,
	})
}

/// Full backend-side verification of a player referral.
pub fn verify_player_referral(
	data: &[u8],
	expected_uuid: Uuid,
	expected_username: &str,
	expected_backend: &str,
	now_ms: i64,
	secret: &[u8],
) -> Result<PlayerReferral, ReferralError> {
	let referral = decode_player_referral(data, now_ms, secret)?;

	if referral.uuid != expected_uuid || referral.username != expected_username {
		return Err(ReferralError::IdentityMismatch);
	}
	if !referral.backend_name.eq_ignore_ascii_case(expected_backend) {
		return Err(ReferralError::IdentityMismatch);
	}

	Ok(referral)
}

/// Sign a control-connection handshake blob.
pub fn sign_control_referral(backend_name: &str, timestamp_ms: i64, secret: &[u8]) -> Bytes {
	let mut buf = BytesMut::new();
	put_field(&mut buf, CONTROL_MARKER.as_bytes());
	buf.put_i64(timestamp_ms);
	put_field(&mut buf, backend_name.as_bytes());

	let tag = hmac_tag(&buf, secret);
	buf.put_slice(&tag);
	buf.freeze()
}

/// Verify a control-connection handshake blob on the backend side.
pub fn verify_control_referral(
	data: &[u8],
	expected_backend: &str,
	now_ms: i64,
	secret: &[u8],
) -> Result<(), ReferralError> {
	if !is_control_referral(data) {
		return Err(ReferralError::InvalidReferral);
	}
	verify_tag(data, secret)?;

	let signed = &data[..data.len() - HMAC_LEN];
	let mut buf = Bytes::copy_from_slice(signed);
	let _marker = get_field(&mut buf)?;

	if buf.remaining() < 8 {
		return Err(ReferralError::InvalidReferral);
	}
	let timestamp_ms = buf.get_i64();
	let backend_name = get_str_field(&mut buf)?;

	if (now_ms - timestamp_ms).abs() > TIMESTAMP_WINDOW_MS {
		return Err(ReferralError::StaleReferral);
	}
	if !backend_name.eq_ignore_ascii_case(expected_backend) {
		return Err(ReferralError::IdentityMismatch);
	}

	Ok(())
}

/// Peek at the first length-prefixed field to spot the control marker.
pub fn is_control_referral(data: &[u8]) -> bool {
	if data.len() < 2 + CONTROL_MARKER.len() {
		return false;
	}
	let len = u16::from_be_bytes([data[0], data[1]]) as usize;
	len == CONTROL_MARKER.len() && &data[2..2 + len] == CONTROL_MARKER.as_bytes()
}

fn hmac_tag(data: &[u8], secret: &[u8]) -> [u8; HMAC_LEN] {
	// HMAC accepts keys of any length.
	let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key");
	mac.update(data);
	mac.finalize().into_bytes().into()
}

fn verify_tag(data: &[u8], secret: &[u8]) -> Result<(), ReferralError> {
	if data.len() <= HMAC_LEN {
		return Err(ReferralError::InvalidReferral);
	}
	let (signed, tag) = data.split_at(data.len() - HMAC_LEN);
	let expected = hmac_tag(signed, secret);
	if !constant_time_eq(&expected, tag) {
		return Err(ReferralError::InvalidReferral);
	}
	Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
	buf.put_u16(field.len().min(u16::MAX as usize) as u16);
	buf.put_slice(&field[..field.len().min(u16::MAX as usize)]);
}

fn get_field(buf: &mut Bytes) -> Result<Bytes, ReferralError> {
	if buf.remaining() < 2 {
		return Err(ReferralError::InvalidReferral);
	}
	let len = buf.get_u16() as usize;
	if buf.remaining() < len {
		return Err(ReferralError::InvalidReferral);
	}
	Ok(buf.copy_to_bytes(len))
}

fn get_str_field(buf: &mut Bytes) -> Result<String, ReferralError> {
	let raw = get_field(buf)?;
	String::from_utf8(raw.to_vec()).map_err(|_| ReferralError::InvalidReferral)
}
