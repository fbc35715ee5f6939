use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use tracing::warn;

/// Metrics for durable buffer operations, labelled with the owning node
#[derive(Clone)]
pub struct BufferMetrics {
    // Counters
    pub put_total: IntCounter,
    pub put_errors: IntCounter,
    pub get_total: IntCounter,
    pub get_errors: IntCounter,
    pub missing_payload_total: IntCounter,
    pub expired_total: IntCounter,
    pub expire_errors: IntCounter,
    pub manifest_errors: IntCounter,

    // Histograms
    pub put_duration: Histogram,
    pub get_duration: Histogram,
    pub expire_duration: Histogram,
    pub manifest_write_duration: Histogram,

    // Gauges
    pub pending: IntGauge,
}

impl BufferMetrics {
    pub fn new(registry: &Registry, node_id: &str) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("node", node_id))
        };
        let histogram = |name: &str, help: &str| {
            Histogram::with_opts(
                HistogramOpts::new(name, help)
                    .const_label("node", node_id)
                    .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
            )
        };

        let put_total = counter("durable_buffer_put_total", "Total number of put operations")?;
        let put_errors = counter("durable_buffer_put_errors_total", "Total number of put errors")?;
        let get_total = counter("durable_buffer_get_total", "Total number of delivered payloads")?;
        let get_errors = counter("durable_buffer_get_errors_total", "Total number of get errors")?;
        let missing_payload_total = counter(
            "durable_buffer_missing_payload_total",
            "Queue entries skipped because their payload file was gone",
        )?;
        let expired_total = counter(
            "durable_buffer_expired_total",
            "Total number of messages dropped by expiry",
        )?;
        let expire_errors = counter(
            "durable_buffer_expire_errors_total",
            "Total number of failed expiry sweeps",
        )?;
        let manifest_errors = counter(
            "durable_buffer_manifest_errors_total",
            "Total number of failed manifest rewrites",
        )?;

        let put_duration = histogram(
            "durable_buffer_put_duration_milliseconds",
            "Duration of put operations in milliseconds",
        )?;
        let get_duration = histogram(
            "durable_buffer_get_duration_milliseconds",
            "Duration of payload delivery in milliseconds, excluding time spent waiting",
        )?;
        let expire_duration = histogram(
            "durable_buffer_expire_duration_milliseconds",
            "Duration of expiry sweeps in milliseconds",
        )?;
        let manifest_write_duration = histogram(
            "durable_buffer_manifest_write_duration_milliseconds",
            "Duration of manifest rewrites in milliseconds",
        )?;

        let pending = IntGauge::with_opts(
            Opts::new("durable_buffer_pending", "Number of messages waiting in the buffer")
                .const_label("node", node_id),
        )?;

        // Register all metrics
        registry.register(Box::new(put_total.clone()))?;
        registry.register(Box::new(put_errors.clone()))?;
        registry.register(Box::new(get_total.clone()))?;
        registry.register(Box::new(get_errors.clone()))?;
        registry.register(Box::new(missing_payload_total.clone()))?;
        registry.register(Box::new(expired_total.clone()))?;
        registry.register(Box::new(expire_errors.clone()))?;
        registry.register(Box::new(manifest_errors.clone()))?;
        registry.register(Box::new(put_duration.clone()))?;
        registry.register(Box::new(get_duration.clone()))?;
        registry.register(Box::new(expire_duration.clone()))?;
        registry.register(Box::new(manifest_write_duration.clone()))?;
        registry.register(Box::new(pending.clone()))?;

        Ok(Self {
            put_total,
            put_errors,
            get_total,
            get_errors,
            missing_payload_total,
            expired_total,
            expire_errors,
            manifest_errors,
            put_duration,
            get_duration,
            expire_duration,
            manifest_write_duration,
            pending,
        })
    }

    /// Record a put operation
    pub fn record_put(&self, duration_ms: f64, success: bool) {
        if success {
            self.put_total.inc();
            self.put_duration.observe(duration_ms);
        } else {
            self.put_errors.inc();
        }
    }

    /// Record a get operation
    pub fn record_get(&self, duration_ms: f64, success: bool) {
        if success {
            self.get_total.inc();
            self.get_duration.observe(duration_ms);
        } else {
            self.get_errors.inc();
        }
    }

    /// Record a queue entry whose payload file had disappeared
    pub fn record_missing_payload(&self, ident: &str) {
        self.missing_payload_total.inc();
        warn!(ident = ident, "Payload missing for queued message, skipping");
    }

    /// Record an expiry sweep
    pub fn record_expire(&self, expired: u64, duration_ms: f64, success: bool) {
        self.expired_total.inc_by(expired);
        if success {
            self.expire_duration.observe(duration_ms);
        } else {
            self.expire_errors.inc();
        }
    }

    /// Record a manifest rewrite
    pub fn record_manifest_write(&self, duration_ms: f64, success: bool) {
        if success {
            self.manifest_write_duration.observe(duration_ms);
        } else {
            self.manifest_errors.inc();
        }
    }

    pub fn update_pending(&self, pending: usize) {
        self.pending.set(pending as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_per_node() {
        let registry = Registry::new();
        let a = BufferMetrics::new(&registry, "node-a").unwrap();
        let b = BufferMetrics::new(&registry, "node-b").unwrap();

        a.record_put(1.0, true);
        a.record_put(0.0, false);
        b.record_expire(3, 2.0, true);
        b.update_pending(7);

        assert_eq!(a.put_total.get(), 1);
        assert_eq!(a.put_errors.get(), 1);
        assert_eq!(b.expired_total.get(), 3);
        assert_eq!(b.pending.get(), 7);

        // Registering the same node twice collides
        assert!(BufferMetrics::new(&registry, "node-a").is_err());
    }
}
