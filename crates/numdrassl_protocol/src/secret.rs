#![forbid(unsafe_code)]

//! Shared-secret material used to sign referral blobs.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tracing::{info, warn};

/// Environment variable that overrides the configured secret.
pub const SECRET_ENV_VAR: &str = "NUMDRASSL_SECRET";

/// Symmetric key shared between a proxy and its backends.
#[derive(Clone)]
pub struct ProxySecret {
	bytes: Vec<u8>,
}

impl std::fmt::Debug for ProxySecret {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxySecret").field("len", &self.bytes.len()).finish()
	}
}

impl ProxySecret {
	/// Resolve the secret, in priority order: environment variable,
	/// configuration field, freshly generated random key.
	///
	/// A generated key is logged so operators can copy it to the backends.
	pub fn resolve(config_secret: Option<&str>) -> ProxySecret {
		if let Ok(env) = std::env::var(SECRET_ENV_VAR) {
			let env = env.trim();
			if !env.is_empty() {
				info!("using proxy secret from {SECRET_ENV_VAR} environment variable");
				return ProxySecret::from_encoded(env);
			}
		}

		if let Some(cfg) = config_secret {
			let cfg = cfg.trim();
			if !cfg.is_empty() {
				info!("using proxy secret from config");
				return ProxySecret::from_encoded(cfg);
			}
		}

		let mut bytes = vec![0u8; 32];
		rand::thread_rng().fill_bytes(&mut bytes);
		let encoded = URL_SAFE_NO_PAD.encode(&bytes);
		warn!("no proxy secret configured! generated random secret: {encoded}");
		warn!("set it in config.yml or {SECRET_ENV_VAR}, and configure backends with the same secret");
		ProxySecret { bytes }
	}

	/// Accept either a base64url-encoded 32-byte key or a raw string.
	fn from_encoded(value: &str) -> ProxySecret {
		if let Ok(decoded) = URL_SAFE_NO_PAD.decode(value) {
			if decoded.len() == 32 {
				return ProxySecret { bytes: decoded };
			}
		}
		ProxySecret {
			bytes: value.as_bytes().to_vec(),
		}
	}

	pub fn from_bytes(bytes: Vec<u8>) -> ProxySecret {
		ProxySecret { bytes }
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.bytes
	}
}
