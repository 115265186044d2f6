use crate::Outcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use sessiongate_core::Result;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciles: Family<OutcomeLabels, Counter>,
    duration: Family<OutcomeLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl ReconcileMetrics ===

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            reconciles: Family::default(),
            // 10ms up to ~160s, which covers a full credential poll.
            duration: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 4.0, 8))
            }),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "reconciles",
            "Total number of session reconciliations by outcome",
            metrics.reconciles.clone(),
        );
        reg.register_with_unit(
            "reconcile_duration",
            "Time taken to reconcile a session",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        metrics
    }

    pub(crate) fn observe(&self, started: Instant, result: &Result<Outcome>) {
        let outcome = match result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        let labels = OutcomeLabels { outcome };
        self.reconciles.get_or_create(&labels).inc();
        self.duration
            .get_or_create(&labels)
            .observe(started.elapsed().as_secs_f64());
    }

    #[cfg(test)]
    #[allow(dead_code)]
    pub(crate) fn count(&self, outcome: &'static str) -> u64 {
        self.reconciles.get_or_create(&OutcomeLabels { outcome }).get()
    }
}
