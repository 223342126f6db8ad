#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::packets::Frame;

/// Maximum on-wire frame size (length prefix value) the proxy will accept.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Size of the length prefix plus the packet id.
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("truncated frame body while reading {what}")]
	Truncated {
		what: &'static str,
	},

	#[error("invalid utf-8 in {what}")]
	InvalidUtf8 {
		what: &'static str,
	},

	#[error("field too long for wire encoding: {what}")]
	FieldTooLong {
		what: &'static str,
	},

	#[error("bad magic bytes")]
	BadMagic,
}

/// Encode a frame into its on-wire form.
///
/// Layout: `u32-le payload_len` (bytes after the prefix), `u32-le packet_id`,
/// body. `Raw` frames re-encode byte-identically.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Bytes, FramingError> {
	let mut body = BytesMut::new();
	frame.encode_body(&mut body)?;

	let payload_len = 4 + body.len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = BytesMut::with_capacity(4 + payload_len);
	out.put_u32_le(payload_len as u32);
	out.put_u32_le(frame.packet_id());
	out.extend_from_slice(&body);
	Ok(out.freeze())
}

/// Try to decode a single frame from the front of a growable buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame; the
/// buffer is only consumed once a full frame is present.
pub fn try_decode_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}
	if payload_len < 4 {
		return Err(FramingError::Truncated { what: "packet id" });
	}

	let need = 4 + payload_len;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need).freeze();
	frame.advance(4);
	let packet_id = frame.get_u32_le();

	Ok(Some(Frame::decode_body(packet_id, frame)?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packets::{ChatType, Connect, MessageSegment};
	use uuid::Uuid;

	fn sample_connect() -> Frame {
		Frame::Connect(Connect {
			uuid: Uuid::from_u128(0x1234_5678_9abc_def0_1122_3344_5566_7788),
			username: "Steve".to_string(),
			protocol_hash: "abcdef".to_string(),
			identity_token: "token".to_string(),
			referral_data: Some(Bytes::from_static(b"referral-bytes")),
		})
	}

	#[test]
	fn connect_roundtrip() {
		let frame = sample_connect();
		let wire = encode_frame(&frame, MAX_FRAME_SIZE).expect("encode");

		let mut buf = BytesMut::from(&wire[..]);
		let decoded = try_decode_frame(&mut buf, MAX_FRAME_SIZE).expect("decode").expect("complete");
		assert!(buf.is_empty());
		assert_eq!(decoded, frame);
	}

	#[test]
	fn decode_waits_for_full_frame() {
		let wire = encode_frame(&sample_connect(), MAX_FRAME_SIZE).expect("encode");

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&wire[..3]);
		assert!(try_decode_frame(&mut buf, MAX_FRAME_SIZE).expect("ok").is_none());

		buf.extend_from_slice(&wire[3..wire.len() - 1]);
		assert!(try_decode_frame(&mut buf, MAX_FRAME_SIZE).expect("ok").is_none());

		buf.extend_from_slice(&wire[wire.len() - 1..]);
		let decoded = try_decode_frame(&mut buf, MAX_FRAME_SIZE).expect("ok").expect("complete");
		assert_eq!(decoded, sample_connect());
	}

	#[test]
	fn unknown_packet_roundtrips_as_raw() {
		let frame = Frame::Raw {
			packet_id: 0x7777,
			body: Bytes::from_static(b"\x01\x02\x03\x04opaque"),
		};
		let wire = encode_frame(&frame, MAX_FRAME_SIZE).expect("encode");

		let mut buf = BytesMut::from(&wire[..]);
		let decoded = try_decode_frame(&mut buf, MAX_FRAME_SIZE).expect("ok").expect("complete");
		assert_eq!(decoded, frame);

		let rewire = encode_frame(&decoded, MAX_FRAME_SIZE).expect("encode");
		assert_eq!(&wire[..], &rewire[..]);
	}

	#[test]
	fn oversized_prefix_rejected() {
		let mut buf = BytesMut::new();
		buf.put_u32_le(MAX_FRAME_SIZE as u32 + 1);
		buf.put_u32_le(0x01);

		match try_decode_frame(&mut buf, MAX_FRAME_SIZE) {
			Err(FramingError::FrameTooLarge { .. }) => {}
			other => panic!("unexpected result: {other:?}"),
		}
	}

	#[test]
	fn every_variant_roundtrips() {
		let frames = vec![
			sample_connect(),
			Frame::Disconnect {
				reason: "kicked".to_string(),
			},
			Frame::ClientReferral {
				host: "proxy.example.com".to_string(),
				port: 24322,
				referral_data: Bytes::from_static(b"blob"),
			},
			Frame::AuthGrant {
				authorization_grant: "grant".to_string(),
				server_identity_token: "sit".to_string(),
			},
			Frame::AuthToken {
				access_token: "at".to_string(),
				server_authorization_grant: "sag".to_string(),
			},
			Frame::ServerAuthToken {
				server_access_token: Some("sat".to_string()),
			},
			Frame::ServerAuthToken { server_access_token: None },
			Frame::ConnectAccept,
			Frame::ServerMessage {
				chat_type: ChatType::Chat,
				segments: vec![
					MessageSegment {
						text: "Connecting to ".to_string(),
						color: Some("#FFAA00".to_string()),
						bold: false,
					},
					MessageSegment {
						text: "arena".to_string(),
						color: Some("#55FF55".to_string()),
						bold: true,
					},
				],
			},
		];

		for frame in frames {
			let wire = encode_frame(&frame, MAX_FRAME_SIZE).expect("encode");
			let mut buf = BytesMut::from(&wire[..]);
			let decoded = try_decode_frame(&mut buf, MAX_FRAME_SIZE).expect("ok").expect("complete");
			assert_eq!(decoded, frame);
		}
	}
}
