use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_in: CounterVec,
    operator_rows_out: CounterVec,
    operator_batches_out: CounterVec,
    operator_time_seconds: HistogramVec,
    spill_files: CounterVec,
    spill_bytes: CounterVec,
    spill_time_seconds: HistogramVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_operator(
        &self,
        operator: &str,
        rows_in: u64,
        rows_out: u64,
        batches_out: u64,
        secs: f64,
    ) {
        let labels = [operator];
        self.inner
            .operator_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc_by(batches_out as f64);
        self.inner
            .operator_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    /// Record spill files written by an operator; `kind` is `partition`, `run` or `sorted`.
    pub fn record_spill(&self, operator: &str, kind: &str, files: u64, bytes: u64, secs: f64) {
        let labels = [operator, kind];
        self.inner
            .spill_files
            .with_label_values(&labels)
            .inc_by(files as f64);
        self.inner
            .spill_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .spill_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_in = counter_vec(
            &registry,
            "nq_operator_rows_in_total",
            "Input rows processed per operator",
            &["operator"],
        );
        let operator_rows_out = counter_vec(
            &registry,
            "nq_operator_rows_out_total",
            "Output rows produced per operator",
            &["operator"],
        );
        let operator_batches_out = counter_vec(
            &registry,
            "nq_operator_batches_out_total",
            "Output batches written per operator",
            &["operator"],
        );
        let operator_time_seconds = histogram_vec(
            &registry,
            "nq_operator_time_seconds",
            "Time spent in each operator",
            &["operator"],
        );

        let spill_files = counter_vec(
            &registry,
            "nq_spill_files_total",
            "Partition/run files written",
            &["operator", "kind"],
        );
        let spill_bytes = counter_vec(
            &registry,
            "nq_spill_bytes_total",
            "Spill bytes written",
            &["operator", "kind"],
        );
        let spill_time_seconds = histogram_vec(
            &registry,
            "nq_spill_time_seconds",
            "Spill write time",
            &["operator", "kind"],
        );

        Self {
            registry,
            operator_rows_in,
            operator_rows_out,
            operator_batches_out,
            operator_time_seconds,
            spill_files,
            spill_bytes,
            spill_time_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_operator_and_spill_families() {
        let m = MetricsRegistry::new();
        m.record_operator("HashPartitionJoin", 10, 4, 1, 0.02);
        m.record_spill("HashPartitionJoin", "partition", 8, 4096, 0.01);
        m.record_spill("SortMergeJoin", "run", 3, 2048, 0.005);
        let text = m.render_prometheus();

        assert!(text.contains("nq_operator_rows_in_total"));
        assert!(text.contains("nq_operator_rows_out_total"));
        assert!(text.contains("nq_operator_batches_out_total"));
        assert!(text.contains("nq_operator_time_seconds"));
        assert!(text.contains("nq_spill_files_total"));
        assert!(text.contains("nq_spill_bytes_total"));
        assert!(text.contains("nq_spill_time_seconds"));
        assert!(text.contains("HashPartitionJoin"));
        assert!(text.contains("partition"));
    }
}
