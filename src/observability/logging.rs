use std::path::Path;

use fern::colors::{Color, ColoredLevelConfig};
use log::Level;

/// Initialize logging to stderr, and to `file` when given.
///
/// Terminal output is colored by level; file output is plain. Logging can
/// only be initialized once per process, later calls return an error.
pub fn init_logging(level: Level, file: Option<&Path>) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::BrightBlack);

	let stderr = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:>5} [{}] {}",
				chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.chain(std::io::stderr());

	let mut dispatch = fern::Dispatch::new()
		.level(level.to_level_filter())
		.chain(stderr);

	if let Some(path) = file {
		let plain = fern::Dispatch::new()
			.format(|out, message, record| {
				out.finish(format_args!(
					"{} {:>5} [{}] {}",
					chrono::Utc::now().to_rfc3339(),
					record.level(),
					record.target(),
					message
				))
			})
			.chain(fern::log_file(path)?);
		dispatch = dispatch.chain(plain);
	}

	dispatch
		.apply()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	use log::Level;

	#[test]
	fn logging_initialization() {
		// Only the first initialization in a process can succeed
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("bifrost.log");
		let first = super::init_logging(Level::Debug, Some(&path));
		let second = super::init_logging(Level::Info, None);
		assert!(first.is_err() || second.is_err());
	}
}
