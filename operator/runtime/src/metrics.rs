use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<ResultLabels, Counter>,
    duration: Family<KindLabels, Histogram>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    kind: &'static str,
    result: &'static str,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ResultLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of reconciliations by resource kind and result",
            reconciles.clone(),
        );

        let duration = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            // Provider actions wait for pods for up to a few minutes.
            Histogram::new([0.01, 0.1, 1.0, 10.0, 60.0, 300.0])
        });
        reg.register_with_unit(
            "reconcile_duration",
            "Histogram of reconciliation latency (seconds) by resource kind",
            Unit::Seconds,
            duration.clone(),
        );

        Self {
            reconciles,
            duration,
        }
    }

    pub(crate) fn observe(&self, kind: &'static str, ok: bool, elapsed: Duration) {
        let result = if ok { "ok" } else { "error" };
        self.reconciles
            .get_or_create(&ResultLabels { kind, result })
            .inc();
        self.duration
            .get_or_create(&KindLabels { kind })
            .observe(elapsed.as_secs_f64());
    }
}
