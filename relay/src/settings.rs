use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
	pub ip: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Peer {
	/// Remote relay endpoint, `host:port`.
	pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chain {
	/// Hex encoded 32 byte chain id, checked against the peer's hello.
	pub chain_id: String,
	pub contract: String,
	pub peer_contract: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub node: Node,
	pub peer: Peer,
	pub chain: Chain,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,

	#[clap(long = "port", help = "Port to listen on for incoming peer connections")]
	pub port: Option<u16>,

	#[clap(long = "peer-endpoint", help = "Remote relay endpoint, host:port")]
	pub peer_endpoint: Option<String>,
}

const DEFAULT_CONFIG_PATH: &str = "config/relay";
const ENV_PREFIX: &str = "ICP_RELAY";

impl Settings {
	/// Layered configuration: file, then `ICP_RELAY__*` environment
	/// variables, then explicit command line overrides.
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let path = opts.config_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
		let mut builder = Config::builder()
			.add_source(File::with_name(path).required(opts.config_path.is_some()))
			.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
		if let Some(port) = opts.port {
			builder = builder.set_override("node.port", port as i64)?;
		}
		if let Some(endpoint) = opts.peer_endpoint {
			builder = builder.set_override("peer.endpoint", endpoint)?;
		}
		builder.build()?.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	const SETTINGS_TOML: &str = r#"
		[node]
		ip = "0.0.0.0"
		port = 9876

		[peer]
		endpoint = "10.0.0.2:9876"

		[chain]
		chain_id = "0101010101010101010101010101010101010101010101010101010101010101"
		contract = "icp.local"
		peer_contract = "icp.peer"
	"#;

	fn write_settings_file() -> tempfile::NamedTempFile {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		file.write_all(SETTINGS_TOML.as_bytes()).unwrap();
		file
	}

	#[test]
	fn loads_a_settings_file() {
		let file = write_settings_file();
		let settings = Settings::new(CommandLineOptions {
			config_path: Some(file.path().to_str().unwrap().to_owned()),
			..Default::default()
		})
		.unwrap();
		assert_eq!(settings.node.port, 9876);
		assert_eq!(settings.peer.endpoint, "10.0.0.2:9876");
		assert_eq!(settings.chain.contract, "icp.local");
	}

	#[test]
	fn command_line_overrides_the_file() {
		let file = write_settings_file();
		let settings = Settings::new(CommandLineOptions {
			config_path: Some(file.path().to_str().unwrap().to_owned()),
			port: Some(4000),
			peer_endpoint: Some("10.9.9.9:4000".to_owned()),
		})
		.unwrap();
		assert_eq!(settings.node.port, 4000);
		assert_eq!(settings.peer.endpoint, "10.9.9.9:4000");
	}

	#[test]
	fn a_missing_explicit_config_file_is_an_error() {
		assert!(Settings::new(CommandLineOptions {
			config_path: Some("does/not/exist.toml".to_owned()),
			..Default::default()
		})
		.is_err());
	}
}
