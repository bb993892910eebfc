use once_cell::sync::OnceCell;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

static METRICS: OnceCell<Arc<MetricsRegistry>> = OnceCell::new();

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Transaction metrics
	pub commits_total: IntCounter,
	pub rollbacks_total: IntCounter,
	pub changes_recorded_total: IntCounter,
	pub db_version: IntGauge,

	// Merge metrics
	pub merge_records_received_total: IntCounter,
	pub merge_records_applied_total: IntCounter,
	pub merge_records_discarded_total: IntCounter,
	pub merge_failures_total: IntCounter,
	pub merge_duration_seconds: Histogram,
}

fn opts(name: &str, help: &str, node: &str) -> Opts {
	Opts::new(name, help)
		.namespace("bifrost")
		.const_label("node", node)
}

impl MetricsRegistry {
	/// Build a registry whose metrics carry `node` as a constant label.
	pub fn new(node: &str) -> prometheus::Result<Self> {
		let registry = Registry::new();

		// Transaction metrics
		let commits_total = IntCounter::with_opts(opts(
			"commits_total",
			"Committed replica transactions",
			node,
		))?;
		let rollbacks_total = IntCounter::with_opts(opts(
			"rollbacks_total",
			"Replica transactions rolled back or dropped without committing",
			node,
		))?;
		let changes_recorded_total = IntCounter::with_opts(opts(
			"changes_recorded_total",
			"Clock entries stamped by local writes",
			node,
		))?;
		let db_version = IntGauge::with_opts(opts(
			"db_version",
			"Current database version of the replica",
			node,
		))?;

		// Merge metrics
		let merge_records_received_total = IntCounter::with_opts(opts(
			"merge_records_received_total",
			"Change records received for merging",
			node,
		))?;
		let merge_records_applied_total = IntCounter::with_opts(opts(
			"merge_records_applied_total",
			"Change records that won and were applied",
			node,
		))?;
		let merge_records_discarded_total = IntCounter::with_opts(opts(
			"merge_records_discarded_total",
			"Change records that lost to local state",
			node,
		))?;
		let merge_failures_total = IntCounter::with_opts(opts(
			"merge_failures_total",
			"Merge batches rejected and rolled back",
			node,
		))?;
		let merge_duration_seconds = Histogram::with_opts(
			HistogramOpts::new("merge_duration_seconds", "Duration of merge batches in seconds")
				.namespace("bifrost")
				.const_label("node", node)
				.buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
		)?;

		// Register all metrics
		registry.register(Box::new(commits_total.clone()))?;
		registry.register(Box::new(rollbacks_total.clone()))?;
		registry.register(Box::new(changes_recorded_total.clone()))?;
		registry.register(Box::new(db_version.clone()))?;
		registry.register(Box::new(merge_records_received_total.clone()))?;
		registry.register(Box::new(merge_records_applied_total.clone()))?;
		registry.register(Box::new(merge_records_discarded_total.clone()))?;
		registry.register(Box::new(merge_failures_total.clone()))?;
		registry.register(Box::new(merge_duration_seconds.clone()))?;

		Ok(Self {
			registry,
			commits_total,
			rollbacks_total,
			changes_recorded_total,
			db_version,
			merge_records_received_total,
			merge_records_applied_total,
			merge_records_discarded_total,
			merge_failures_total,
			merge_duration_seconds,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Initialize the process-wide metrics registry. Later calls return the
/// registry built by the first one.
pub fn init_metrics(node: &str) -> prometheus::Result<Arc<MetricsRegistry>> {
	METRICS
		.get_or_try_init(|| MetricsRegistry::new(node).map(Arc::new))
		.cloned()
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn metrics_registry_creation() {
		let registry = super::MetricsRegistry::new("test").unwrap();
		let text = registry.encode();
		assert!(text.contains("bifrost_commits_total"));
		assert!(text.contains("node=\"test\""));
	}

	#[test]
	fn metrics_increment() {
		let registry = super::MetricsRegistry::new("test").unwrap();
		registry.merge_records_received_total.inc_by(10);
		registry.db_version.set(4);
		assert_eq!(registry.merge_records_received_total.get(), 10);
		assert!(registry.encode().contains("bifrost_db_version{node=\"test\"} 4"));
	}

	#[test]
	fn global_registry_is_shared() {
		let a = super::init_metrics("one").unwrap();
		let b = super::init_metrics("two").unwrap();
		assert!(std::sync::Arc::ptr_eq(&a, &b));
	}
}
