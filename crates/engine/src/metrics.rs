//! Engine metrics.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Gauges and counters tracking the engine's working set.
///
/// Registered against a caller-supplied registry so several chains can run
/// engines in one process without colliding.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Blocks currently pinned in memory.
    pub num_processing: IntGauge,
    /// Outstanding block fetch requests.
    pub num_requests: IntGauge,
    /// Blocks queued for issuance behind missing ancestors.
    pub num_blocked: IntGauge,
    /// Queries in flight.
    pub num_polls: IntGauge,
    /// Blocks accepted by consensus.
    pub blocks_accepted: IntCounter,
    /// Blocks rejected by consensus.
    pub blocks_rejected: IntCounter,
    /// Blocks dropped after failing verification.
    pub blocks_dropped: IntCounter,
}

impl EngineMetrics {
    /// Register the engine's metrics under `<namespace>_engine`.
    pub fn new(namespace: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let namespace = format!("{namespace}_engine");
        Ok(EngineMetrics {
            num_processing: gauge(
                registry,
                &namespace,
                "num_processing",
                "Blocks currently pinned in memory",
            )?,
            num_requests: gauge(
                registry,
                &namespace,
                "num_requests",
                "Outstanding block fetch requests",
            )?,
            num_blocked: gauge(
                registry,
                &namespace,
                "num_blocked",
                "Blocks queued for issuance behind missing ancestors",
            )?,
            num_polls: gauge(registry, &namespace, "num_polls", "Queries in flight")?,
            blocks_accepted: counter(
                registry,
                &namespace,
                "blocks_accepted",
                "Blocks accepted by consensus",
            )?,
            blocks_rejected: counter(
                registry,
                &namespace,
                "blocks_rejected",
                "Blocks rejected by consensus",
            )?,
            blocks_dropped: counter(
                registry,
                &namespace,
                "blocks_dropped",
                "Blocks dropped after failing verification",
            )?,
        })
    }
}

fn gauge(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(namespace.to_string()))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace.to_string()))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
