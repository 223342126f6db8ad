#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use numdrassl_proxy::{NoopHooks, Proxy, ProxyConfig};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: numdrassl_proxy [--config path]\n\
\n\
Options:\n\
\t--config  Path to the YAML configuration (default: config/proxy.yml)\n\
\t--bind    Override the bind address (host:port)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: PathBuf,
	bind_override: Option<(String, u16)>,
}

fn parse_args() -> Args {
	let mut config_path = PathBuf::from("config/proxy.yml");
	let mut bind_override = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = PathBuf::from(v);
			}
			"--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let Some((host, port)) = v.rsplit_once(':') else {
					eprintln!("--bind expects host:port");
					usage_and_exit();
				};
				let Ok(port) = port.parse::<u16>() else {
					eprintln!("--bind expects a numeric port");
					usage_and_exit();
				};
				bind_override = Some((host.to_string(), port));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	Args {
		config_path,
		bind_override,
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,numdrassl_proxy=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let mut config = ProxyConfig::load(&args.config_path)?;
	info!(path = %args.config_path.display(), "loaded configuration");

	if let Some((host, port)) = args.bind_override {
		info!(%host, port, "bind address overridden on the command line");
		config.bind_address = host;
		config.bind_port = port;
	}

	init_metrics(config.metrics_bind.as_deref());

	let proxy = Proxy::start(config, Arc::new(NoopHooks)).await?;

	let runner = {
		let proxy = proxy.clone();
		tokio::spawn(async move { proxy.run().await })
	};

	tokio::signal::ctrl_c().await?;
	info!("interrupt received, shutting down");
	proxy.shutdown().await;
	runner.abort();

	Ok(())
}
