use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    active: Gauge,
    registrations: Counter,
    unregistrations: Counter,
}

impl RegistryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "active_sessions",
            "The number of sessions currently registered",
            metrics.active.clone(),
        );
        reg.register(
            "registrations",
            "Total number of session registrations, including refreshes",
            metrics.registrations.clone(),
        );
        reg.register(
            "unregistrations",
            "Total number of sessions removed",
            metrics.unregistrations.clone(),
        );
        metrics
    }

    pub(crate) fn registered(&self, active: usize) {
        self.registrations.inc();
        self.active.set(active as i64);
    }

    pub(crate) fn unregistered(&self, active: usize) {
        self.unregistrations.inc();
        self.active.set(active as i64);
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> i64 {
        self.active.get()
    }
}
