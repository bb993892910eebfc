pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{MetricsRegistry, init_metrics};

use std::sync::Arc;

use crate::config::Settings;

/// Global observability state
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

/// Initialize logging and the metrics registry from `settings`.
pub fn init_observability(settings: &Settings) -> anyhow::Result<ObservabilityState> {
	init_logging(settings.log_level, settings.log_file.as_deref())?;
	let metrics = init_metrics(&settings.node_name)?;

	log::info!(
		"observability initialized: level {}, node '{}'",
		settings.log_level,
		settings.node_name
	);

	Ok(ObservabilityState { metrics })
}
