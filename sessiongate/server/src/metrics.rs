use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ProxyMetrics {
    requests: Family<RequestLabels, Counter>,
    duration: Family<RequestLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    method: String,
    code: u16,
}

// === impl ProxyMetrics ===

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self {
            requests: Family::default(),
            // 1ms up to ~65s.
            duration: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 4.0, 9))
            }),
        }
    }
}

impl ProxyMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "requests",
            "Total number of requests forwarded to session clusters",
            metrics.requests.clone(),
        );
        reg.register_with_unit(
            "request_duration",
            "Time until the session cluster's response headers arrive",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        metrics
    }

    pub(crate) fn observe(&self, method: &http::Method, code: http::StatusCode, elapsed: Duration) {
        let labels = RequestLabels {
            method: method.as_str().to_string(),
            code: code.as_u16(),
        };
        self.requests.get_or_create(&labels).inc();
        self.duration
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn count(&self, method: &str, code: u16) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                code,
            })
            .get()
    }
}
