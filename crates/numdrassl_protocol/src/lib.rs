#![forbid(unsafe_code)]

//! Wire-level building blocks shared by the proxy and its tooling.
//!
//! The game protocol itself is treated as an opaque stream of length-prefixed
//! frames; only the handful of frames the proxy must intercept are modeled as
//! typed variants. Everything else round-trips as raw bytes.

pub mod cluster;
pub mod framing;
pub mod packets;
pub mod plugin_message;
pub mod referral;
pub mod secret;

pub use framing::{FramingError, MAX_FRAME_SIZE, encode_frame, try_decode_frame};
pub use packets::{ChatType, Frame, MessageSegment};
pub use referral::ReferralError;
