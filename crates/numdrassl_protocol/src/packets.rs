#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::framing::FramingError;

pub const CONNECT_ID: u32 = 0x01;
pub const DISCONNECT_ID: u32 = 0x02;
pub const CLIENT_REFERRAL_ID: u32 = 0x03;
pub const AUTH_GRANT_ID: u32 = 0x10;
pub const AUTH_TOKEN_ID: u32 = 0x11;
pub const SERVER_AUTH_TOKEN_ID: u32 = 0x12;
pub const CONNECT_ACCEPT_ID: u32 = 0x13;
pub const SERVER_MESSAGE_ID: u32 = 0x20;

/// First packet a client sends; carries identity and optional referral data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
	pub uuid: Uuid,
	pub username: String,
	pub protocol_hash: String,
	/// Opaque identity token issued by the session service; may be empty.
	pub identity_token: String,
	pub referral_data: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
	Chat,
	System,
}

impl ChatType {
	fn to_wire(self) -> u8 {
		match self {
			ChatType::Chat => 0,
			ChatType::System => 1,
		}
	}

	fn from_wire(v: u8) -> ChatType {
		match v {
			1 => ChatType::System,
			_ => ChatType::Chat,
		}
	}
}

/// One styled run of text in a `ServerMessage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSegment {
	pub text: String,
	/// Hex color string such as `#FFAA00`.
	pub color: Option<String>,
	pub bold: bool,
}

/// A single game-protocol frame.
///
/// Only the frames the proxy needs to intercept are typed; everything else is
/// carried through as `Raw` and re-encoded byte-identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Connect(Connect),
	Disconnect {
		reason: String,
	},
	ClientReferral {
		host: String,
		port: u16,
		referral_data: Bytes,
	},
	AuthGrant {
		authorization_grant: String,
		server_identity_token: String,
	},
	AuthToken {
		access_token: String,
		server_authorization_grant: String,
	},
	ServerAuthToken {
		server_access_token: Option<String>,
	},
	ConnectAccept,
	ServerMessage {
		chat_type: ChatType,
		segments: Vec<MessageSegment>,
	},
	Raw {
		packet_id: u32,
		body: Bytes,
	},
}

impl Frame {
	pub fn packet_id(&self) -> u32 {
		match self {
			Frame::Connect(_) => CONNECT_ID,
			Frame::Disconnect { .. } => DISCONNECT_ID,
			Frame::ClientReferral { .. } => CLIENT_REFERRAL_ID,
			Frame::AuthGrant { .. } => AUTH_GRANT_ID,
			Frame::AuthToken { .. } => AUTH_TOKEN_ID,
			Frame::ServerAuthToken { .. } => SERVER_AUTH_TOKEN_ID,
			Frame::ConnectAccept => CONNECT_ACCEPT_ID,
			Frame::ServerMessage { .. } => SERVER_MESSAGE_ID,
			Frame::Raw { packet_id, .. } => *packet_id,
		}
	}

	/// Short name for logging.
	pub fn name(&self) -> &'static str {
		match self {
			Frame::Connect(_) => "Connect",
			Frame::Disconnect { .. } => "Disconnect",
			Frame::ClientReferral { .. } => "ClientReferral",
			Frame::AuthGrant { .. } => "AuthGrant",
			Frame::AuthToken { .. } => "AuthToken",
			Frame::ServerAuthToken { .. } => "ServerAuthToken",
			Frame::ConnectAccept => "ConnectAccept",
			Frame::ServerMessage { .. } => "ServerMessage",
			Frame::Raw { .. } => "Raw",
		}
	}

	pub(crate) fn encode_body(&self, buf: &mut BytesMut) -> Result<(), FramingError> {
		match self {
			Frame::Connect(c) => {
				buf.put_slice(c.uuid.as_bytes());
				put_str(buf, &c.username, "username")?;
				put_str(buf, &c.protocol_hash, "protocol_hash")?;
				put_str(buf, &c.identity_token, "identity_token")?;
				put_opt_blob(buf, c.referral_data.as_deref(), "referral_data")?;
			}
			Frame::Disconnect { reason } => {
				put_str(buf, reason, "reason")?;
			}
			Frame::ClientReferral {
				host,
				port,
				referral_data,
			} => {
				put_str(buf, host, "host")?;
				buf.put_u16_le(*port);
				put_opt_blob(buf, Some(referral_data.as_ref()), "referral_data")?;
			}
			Frame::AuthGrant {
				authorization_grant,
				server_identity_token,
			} => {
				put_str(buf, authorization_grant, "authorization_grant")?;
				put_str(buf, server_identity_token, "server_identity_token")?;
			}
			Frame::AuthToken {
				access_token,
				server_authorization_grant,
			} => {
				put_str(buf, access_token, "access_token")?;
				put_str(buf, server_authorization_grant, "server_authorization_grant")?;
			}
			Frame::ServerAuthToken { server_access_token } => match server_access_token {
				Some(token) => {
					buf.put_u8(1);
					put_str(buf, token, "server_access_token")?;
				}
				None => buf.put_u8(0),
			},
			Frame::ConnectAccept => {}
			Frame::ServerMessage { chat_type, segments } => {
				buf.put_u8(chat_type.to_wire());
				if segments.len() > u16::MAX as usize {
					return Err(FramingError::FieldTooLong { what: "segments" });
				}
				buf.put_u16_le(segments.len() as u16);
				for seg in segments {
					put_str(buf, &seg.text, "segment text")?;
					match &seg.color {
						Some(color) => {
							buf.put_u8(1);
							put_str(buf, color, "segment color")?;
						}
						None => buf.put_u8(0),
					}
					buf.put_u8(u8::from(seg.bold));
				}
			}
			Frame::Raw { body, .. } => {
				buf.put_slice(body);
			}
		}
		Ok(())
	}

	pub(crate) fn decode_body(packet_id: u32, mut body: Bytes) -> Result<Frame, FramingError> {
		let frame = match packet_id {
			CONNECT_ID => {
				let uuid = get_uuid(&mut body)?;
				let username = get_str(&mut body, "username")?;
				let protocol_hash = get_str(&mut body, "protocol_hash")?;
				let identity_token = get_str(&mut body, "identity_token")?;
				let referral_data = get_opt_blob(&mut body, "referral_data")?;
				Frame::Connect(Connect {
					uuid,
					username,
					protocol_hash,
					identity_token,
					referral_data,
				})
			}
			DISCONNECT_ID => Frame::Disconnect {
				reason: get_str(&mut body, "reason")?,
			},
			CLIENT_REFERRAL_ID => {
				let host = get_str(&mut body, "host")?;
				if body.remaining() < 2 {
					return Err(FramingError::Truncated { what: "port" });
				}
				let port = body.get_u16_le();
				let referral_data = get_opt_blob(&mut body, "referral_data")?.unwrap_or_default();
				Frame::ClientReferral {
					host,
					port,
					referral_data,
				}
			}
			AUTH_GRANT_ID => Frame::AuthGrant {
				authorization_grant: get_str(&mut body, "authorization_grant")?,
				server_identity_token: get_str(&mut body, "server_identity_token")?,
			},
			AUTH_TOKEN_ID => Frame::AuthToken {
				access_token: get_str(&mut body, "access_token")?,
				server_authorization_grant: get_str(&mut body, "server_authorization_grant")?,
			},
			SERVER_AUTH_TOKEN_ID => {
				if body.remaining() < 1 {
					return Err(FramingError::Truncated { what: "token flag" });
				}
				let present = body.get_u8() != 0;
				let server_access_token = if present {
					Some(get_str(&mut body, "server_access_token")?)
				} else {
					None
				};
				Frame::ServerAuthToken { server_access_token }
			}
			CONNECT_ACCEPT_ID => Frame::ConnectAccept,
			SERVER_MESSAGE_ID => {
				if body.remaining() < 3 {
					return Err(FramingError::Truncated { what: "message header" });
				}
				let chat_type = ChatType::from_wire(body.get_u8());
				let count = body.get_u16_le() as usize;
				let mut segments = Vec::with_capacity(count.min(64));
				for _ in 0..count {
					let text = get_str(&mut body, "segment text")?;
					if body.remaining() < 1 {
						return Err(FramingError::Truncated { what: "color flag" });
					}
					let color = if body.get_u8() != 0 {
						Some(get_str(&mut body, "segment color")?)
					} else {
						None
					};
					if body.remaining() < 1 {
						return Err(FramingError::Truncated { what: "bold flag" });
					}
					let bold = body.get_u8() != 0;
					segments.push(MessageSegment { text, color, bold });
				}
				Frame::ServerMessage { chat_type, segments }
			}
			other => Frame::Raw {
				packet_id: other,
				body,
			},
		};
		Ok(frame)
	}
}

fn put_str(buf: &mut BytesMut, s: &str, what: &'static str) -> Result<(), FramingError> {
	if s.len() > u16::MAX as usize {
		return Err(FramingError::FieldTooLong { what });
	}
	buf.put_u16_le(s.len() as u16);
	buf.put_slice(s.as_bytes());
	Ok(())
}

fn get_str(buf: &mut Bytes, what: &'static str) -> Result<String, FramingError> {
	if buf.remaining() < 2 {
		return Err(FramingError::Truncated { what });
	}
	let len = buf.get_u16_le() as usize;
	if buf.remaining() < len {
		return Err(FramingError::Truncated { what });
	}
	let raw = buf.copy_to_bytes(len);
	String::from_utf8(raw.to_vec()).map_err(|_| FramingError::InvalidUtf8 { what })
}

/// Optional byte blob: u16-le length with 0 meaning absent.
fn put_opt_blob(buf: &mut BytesMut, blob: Option<&[u8]>, what: &'static str) -> Result<(), FramingError> {
	match blob {
		Some(data) => {
			if data.is_empty() || data.len() > u16::MAX as usize {
				return Err(FramingError::FieldTooLong { what });
			}
			buf.put_u16_le(data.len() as u16);
			buf.put_slice(data);
		}
		None => buf.put_u16_le(0),
	}
	Ok(())
}

fn get_opt_blob(buf: &mut Bytes, what: &'static str) -> Result<Option<Bytes>, FramingError> {
	if buf.remaining() < 2 {
		return Err(FramingError::Truncated { what });
	}
	let len = buf.get_u16_le() as usize;
	if len == 0 {
		return Ok(None);
	}
	if buf.remaining() < len {
		return Err(FramingError::Truncated { what });
	}
	Ok(Some(buf.copy_to_bytes(len)))
}

fn get_uuid(buf: &mut Bytes) -> Result<Uuid, FramingError> {
	if buf.remaining() < 16 {
		return Err(FramingError::Truncated { what: "uuid" });
	}
	let mut raw = [0u8; 16];
	buf.copy_to_slice(&mut raw);
	Ok(Uuid::from_bytes(raw))
}
