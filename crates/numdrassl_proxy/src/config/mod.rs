#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Proxy configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
	pub bind_address: String,
	pub bind_port: u16,
	/// Address advertised to clients (client referrals, heartbeats).
	pub public_address: Option<String>,
	pub public_port: Option<u16>,

	pub certificate_path: PathBuf,
	pub private_key_path: PathBuf,

	pub max_connections: usize,
	pub connection_timeout_seconds: u64,

	pub debug_mode: bool,
	pub passthrough_mode: bool,

	/// Shared secret for referral signing (raw or base64url). Overridden by
	/// the NUMDRASSL_SECRET environment variable.
	pub proxy_secret: Option<String>,

	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,

	pub backends: Vec<BackendServer>,

	pub cluster: ClusterConfig,

	pub session_service: SessionServiceConfig,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			bind_address: "0.0.0.0".to_string(),
			bind_port: 24322,
			public_address: None,
			public_port: None,
			certificate_path: PathBuf::from("certs/server.crt"),
			private_key_path: PathBuf::from("certs/server.key"),
			max_connections: 1000,
			connection_timeout_seconds: 30,
			debug_mode: false,
			passthrough_mode: false,
			proxy_secret: None,
			metrics_bind: None,
			backends: vec![BackendServer {
				name: "lobby".to_string(),
				host: "127.0.0.1".to_string(),
				port: 5520,
				default_server: true,
				hostname: None,
			}],
			cluster: ClusterConfig::default(),
			session_service: SessionServiceConfig::default(),
		}
	}
}

/// A backend game server the proxy can forward players to.
///
/// Names are unique case-insensitively within a proxy; descriptors are
/// immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendServer {
	pub name: String,
	pub host: String,
	pub port: u16,
	pub default_server: bool,
	/// Optional hostname used for SNI-based routing; falls back to `host`.
	pub hostname: Option<String>,
}

impl Default for BackendServer {
	fn default() -> Self {
		Self {
			name: String::new(),
			host: "127.0.0.1".to_string(),
			port: 5520,
			default_server: false,
			hostname: None,
		}
	}
}

impl BackendServer {
	pub fn same_name(&self, other_name: &str) -> bool {
		self.name.eq_ignore_ascii_case(other_name)
	}

	/// Server name presented during TLS handshakes to this backend.
	pub fn sni_name(&self) -> &str {
		self.hostname.as_deref().unwrap_or(&self.host)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
	pub enabled: bool,
	pub proxy_id: Option<String>,
	pub region: String,
	pub redis_host: String,
	pub redis_port: u16,
	pub redis_password: Option<String>,
	pub redis_ssl: bool,
	pub redis_database: i64,
}

impl Default for ClusterConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			proxy_id: None,
			region: "default".to_string(),
			redis_host: "localhost".to_string(),
			redis_port: 6379,
			redis_password: None,
			redis_ssl: false,
			redis_database: 0,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionServiceConfig {
	pub base_url: String,
	pub timeout_seconds: u64,
}

impl Default for SessionServiceConfig {
	fn default() -> Self {
		Self {
			base_url: "https://sessions.hytale.com".to_string(),
			timeout_seconds: 10,
		}
	}
}

impl ProxyConfig {
	/// Load the configuration, writing a commented default file when none
	/// exists yet.
	pub fn load(path: &Path) -> anyhow::Result<ProxyConfig> {
		if !path.exists() {
			let config = ProxyConfig::default();
			config.save(path).with_context(|| format!("write default config to {}", path.display()))?;
			info!(path = %path.display(), "wrote default configuration");
			return Ok(config);
		}

		let raw = fs::read_to_string(path).with_context(|| format!("read config from {}", path.display()))?;
		let config: ProxyConfig = serde_yaml::from_str(&raw).context("parse YAML config")?;
		config.validate()?;
		Ok(config)
	}

	pub fn save(&self, path: &Path) -> anyhow::Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).with_context(|| format!("create config directory {}", parent.display()))?;
		}
		let body = serde_yaml::to_string(self).context("serialize config")?;
		let contents = format!("# Numdrassl Proxy Configuration\n\n{body}");
		fs::write(path, contents).with_context(|| format!("write config to {}", path.display()))?;
		Ok(())
	}

	fn validate(&self) -> anyhow::Result<()> {
		if let Some(id) = self.cluster.proxy_id.as_deref() {
			if id.len() > 32 {
				return Err(anyhow!("cluster.proxyId must be at most 32 characters (got {})", id.len()));
			}
		}

		let mut seen = std::collections::HashSet::new();
		for backend in &self.backends {
			if backend.name.trim().is_empty() {
				return Err(anyhow!("backend with empty name"));
			}
			if !seen.insert(backend.name.to_lowercase()) {
				return Err(anyhow!("duplicate backend name (case-insensitive): {}", backend.name));
			}
		}

		Ok(())
	}

	/// The configured default backend, falling back to the first entry.
	pub fn default_backend(&self) -> Option<&BackendServer> {
		self.backends.iter().find(|b| b.default_server).or_else(|| self.backends.first())
	}

	pub fn backend_by_name(&self, name: &str) -> Option<&BackendServer> {
		self.backends.iter().find(|b| b.same_name(name))
	}

	/// Host clients should reconnect to, resolved like the original chain:
	/// public address, then a concrete bind address, then localhost.
	pub fn advertised_host(&self) -> String {
		if let Some(public) = self.public_address.as_deref() {
			if !public.is_empty() && public != "0.0.0.0" {
				return public.to_string();
			}
		}
		if !self.bind_address.is_empty() && self.bind_address != "0.0.0.0" {
			return self.bind_address.clone();
		}
		"127.0.0.1".to_string()
	}

	pub fn advertised_port(&self) -> u16 {
		match self.public_port {
			Some(port) if port > 0 => port,
			_ => self.bind_port,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_roundtrips_through_yaml() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("config.yml");

		let written = ProxyConfig::load(&path).expect("create default");
		assert!(path.exists());

		let reloaded = ProxyConfig::load(&path).expect("reload");
		assert_eq!(reloaded.bind_port, written.bind_port);
		assert_eq!(reloaded.backends.len(), 1);
		assert_eq!(reloaded.backends[0].name, "lobby");
		assert!(reloaded.backends[0].default_server);
	}

	#[test]
	fn parses_cluster_block() {
		let yaml = r#"
bindAddress: 0.0.0.0
bindPort: 24322
backends:
  - name: lobby
    host: 10.0.0.5
    port: 5520
    defaultServer: true
  - name: arena
    host: 10.0.0.6
    port: 5521
cluster:
  enabled: true
  proxyId: proxy-eu-1
  region: eu
  redisHost: redis.internal
  redisPort: 6380
  redisSsl: true
"#;
		let config: ProxyConfig = serde_yaml::from_str(yaml).expect("parse");
		assert!(config.cluster.enabled);
		assert_eq!(config.cluster.proxy_id.as_deref(), Some("proxy-eu-1"));
		assert_eq!(config.cluster.redis_port, 6380);
		assert_eq!(config.backends.len(), 2);
		assert_eq!(config.default_backend().map(|b| b.name.as_str()), Some("lobby"));
		assert!(config.backend_by_name("ARENA").is_some());
	}

	#[test]
	fn rejects_long_proxy_id() {
		let mut config = ProxyConfig::default();
		config.cluster.proxy_id = Some("x".repeat(33));
		assert!(config.validate().is_err());
	}

	#[test]
	fn rejects_duplicate_backend_names() {
		let mut config = ProxyConfig::default();
		config.backends.push(BackendServer {
			name: "LOBBY".to_string(),
			host: "10.0.0.9".to_string(),
			port: 5599,
			default_server: false,
			hostname: None,
		});
		assert!(config.validate().is_err());
	}

	#[test]
	fn advertised_address_resolution_chain() {
		let mut config = ProxyConfig::default();
		assert_eq!(config.advertised_host(), "127.0.0.1");
		assert_eq!(config.advertised_port(), 24322);

		config.bind_address = "192.0.2.10".to_string();
		assert_eq!(config.advertised_host(), "192.0.2.10");

		config.public_address = Some("proxy.example.com".to_string());
		config.public_port = Some(443);
		assert_eq!(config.advertised_host(), "proxy.example.com");
		assert_eq!(config.advertised_port(), 443);
	}
}
