use std::path::PathBuf;

use log::Level;
use serde::Deserialize;
use thiserror::Error;

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): the `/etc/vanopticon/bifrost.json` file,
/// the user config folders (optional), and environment variables prefixed
/// with `BFT_` (e.g. `BFT_DATABASE`).
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Settings {
	/// Replica database file.
	pub database: PathBuf,
	pub log_level: Level,
	/// Also write logs to this file when set.
	pub log_file: Option<PathBuf>,
	/// Label attached to every exported metric.
	pub node_name: String,
	pub busy_timeout_ms: u64,
	/// Rows fetched per page while streaming changes.
	pub changes_page_size: usize,
	pub journal_wal: bool,
}

impl Default for Settings {
	fn default() -> Self {
		let node_name = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "localhost".to_string());

		Self {
			database: PathBuf::from("bifrost.db"),
			log_level: Level::Info,
			log_file: None,
			node_name,
			busy_timeout_ms: 5000,
			changes_page_size: 512,
			journal_wal: true,
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/bifrost.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix("BFT").separator("__"));

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Direct variables win over whatever the layered sources produced; the
	// environment source maps nested keys and leaves flat ones ambiguous.
	if let Ok(d) = std::env::var("BFT_DATABASE") {
		if !d.is_empty() {
			s.database = PathBuf::from(d);
		}
	}
	if let Ok(l) = std::env::var("BFT_LOG_LEVEL") {
		if let Ok(parsed) = l.parse::<Level>() {
			s.log_level = parsed;
		}
	}
	if let Ok(f) = std::env::var("BFT_LOG_FILE") {
		s.log_file = (!f.is_empty()).then(|| PathBuf::from(f));
	}
	if let Ok(n) = std::env::var("BFT_NODE_NAME") {
		if !n.is_empty() {
			s.node_name = n;
		}
	}
	if let Ok(t) = std::env::var("BFT_BUSY_TIMEOUT_MS") {
		if let Ok(parsed) = t.parse::<u64>() {
			s.busy_timeout_ms = parsed;
		}
	}
	if let Ok(p) = std::env::var("BFT_CHANGES_PAGE_SIZE") {
		if let Ok(parsed) = p.parse::<usize>() {
			if parsed > 0 {
				s.changes_page_size = parsed;
			}
		}
	}
	if let Ok(w) = std::env::var("BFT_JOURNAL_WAL") {
		if let Ok(parsed) = w.parse::<bool>() {
			s.journal_wal = parsed;
		}
	}

	Ok(s)
}
