#![forbid(unsafe_code)]

//! Envelope for player-independent plugin messages carried over backend
//! control streams.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::framing::FramingError;

/// Wire magic prefixing every plugin message ("NDPM").
pub const PLUGIN_MESSAGE_MAGIC: [u8; 4] = [0x4E, 0x44, 0x50, 0x4D];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMessage {
	pub channel: String,
	pub payload: Bytes,
}

impl PluginMessage {
	pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> PluginMessage {
		PluginMessage {
			channel: channel.into(),
			payload: payload.into(),
		}
	}

	pub fn encode(&self) -> Result<Bytes, FramingError> {
		if self.channel.len() > u16::MAX as usize {
			return Err(FramingError::FieldTooLong { what: "channel" });
		}

		let mut buf = BytesMut::with_capacity(4 + 2 + self.channel.len() + 4 + self.payload.len());
		buf.put_slice(&PLUGIN_MESSAGE_MAGIC);
		buf.put_u16(self.channel.len() as u16);
		buf.put_slice(self.channel.as_bytes());
		buf.put_u32(self.payload.len() as u32);
		buf.put_slice(&self.payload);
		Ok(buf.freeze())
	}

	/// Try to decode one envelope from the front of a growable buffer.
	///
	/// Returns `Ok(None)` until a full envelope is buffered.
	pub fn try_decode(buf: &mut BytesMut) -> Result<Option<PluginMessage>, FramingError> {
		if buf.len() < 4 {
			return Ok(None);
		}
		if buf[..4] != PLUGIN_MESSAGE_MAGIC {
			return Err(FramingError::BadMagic);
		}
		if buf.len() < 6 {
			return Ok(None);
		}

		let channel_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
		let payload_off = 6 + channel_len;
		if buf.len() < payload_off + 4 {
			return Ok(None);
		}

		let payload_len = u32::from_be_bytes([
			buf[payload_off],
			buf[payload_off + 1],
			buf[payload_off + 2],
			buf[payload_off + 3],
		]) as usize;
		let total = payload_off + 4 + payload_len;
		if buf.len() < total {
			return Ok(None);
		}

		let mut raw = buf.split_to(total).freeze();
		raw.advance(6);
		let channel_raw = raw.copy_to_bytes(channel_len);
		let channel = String::from_utf8(channel_raw.to_vec()).map_err(|_| FramingError::InvalidUtf8 { what: "channel" })?;
		raw.advance(4);

		Ok(Some(PluginMessage { channel, payload: raw }))
	}

	pub fn is_plugin_message(data: &[u8]) -> bool {
		data.len() >= 4 && data[..4] == PLUGIN_MESSAGE_MAGIC
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_roundtrip() {
		let msg = PluginMessage::new("numdrassl:control_handshake", Bytes::from_static(b"payload-bytes"));
		let wire = msg.encode().expect("encode");
		assert!(PluginMessage::is_plugin_message(&wire));

		let mut buf = BytesMut::from(&wire[..]);
		let decoded = PluginMessage::try_decode(&mut buf).expect("ok").expect("complete");
		assert_eq!(decoded, msg);
		assert!(buf.is_empty());
	}

	#[test]
	fn partial_envelope_waits() {
		let msg = PluginMessage::new("luckperms:sync", Bytes::from_static(b"x"));
		let wire = msg.encode().expect("encode");

		let mut buf = BytesMut::new();
		for chunk in wire.chunks(3) {
			let before = PluginMessage::try_decode(&mut buf).expect("ok");
			if buf.len() + chunk.len() < wire.len() {
				assert!(before.is_none());
			}
			buf.extend_from_slice(chunk);
		}

		let decoded = PluginMessage::try_decode(&mut buf).expect("ok").expect("complete");
		assert_eq!(decoded, msg);
	}

	#[test]
	fn bad_magic_rejected() {
		let mut buf = BytesMut::from(&b"XXXXrest-of-data"[..]);
		assert!(PluginMessage::try_decode(&mut buf).is_err());
	}
}
