use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, RwLock};

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::Error;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("volume_populator")));

/// Per-claim population timers and outcome counters.
pub struct PopulationMetrics {
    results: Family<ResultLabels, Counter>,
    failures: Family<ErrorLabels, Counter>,
    duration: HistogramWithExemplars<TraceLabel>,
    /// claim uid -> population start; survives reconcile re-entries.
    in_flight: Mutex<HashMap<String, Instant>>,
}

impl PopulationMetrics {
    /// Register population metrics to start tracking them.
    pub fn new(controller_name: &str) -> Self {
        let mut guard = REGISTRY.write().unwrap();
        let registry = guard.sub_registry_with_label((
            Cow::Borrowed("controller_name"),
            Cow::Owned(controller_name.into()),
        ));
        let results = Family::<ResultLabels, Counter>::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration = HistogramWithExemplars::new(
            [0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0].into_iter(),
        );

        registry.register_with_unit(
            "population_duration",
            "volume population duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "population_results",
            "Number of finished population operations",
            results.clone(),
        );
        registry.register(
            "sync_failures",
            "Number of reconciliation errors",
            failures.clone(),
        );
        Self {
            results,
            failures,
            duration,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Marks the start of population for a claim. Idempotent across
    /// reconcile re-entries; the earliest start wins.
    pub fn operation_start(&self, uid: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.entry(uid.to_owned()).or_insert_with(Instant::now);
    }

    /// Records the terminal outcome for a claim. A no-op unless population
    /// was started.
    pub fn record_outcome(&self, uid: &str, result: &str) {
        let started = self.in_flight.lock().unwrap().remove(uid);
        let Some(started) = started else {
            return;
        };
        self.results
            .get_or_create(&ResultLabels {
                result: result.into(),
            })
            .inc();
        #[allow(clippy::cast_precision_loss)]
        let elapsed = started.elapsed().as_millis() as f64 / 1000.0;
        let labels = TraceLabel::try_from(&get_trace_id()).ok();
        self.duration.observe(elapsed, labels);
    }

    pub fn count_failure(&self, error: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                error: error.metric_label(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub trace_id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = crate::Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::ConversionError(
                "failed to convert trace id to label".into(),
            ))
        } else {
            let trace_id = id.to_string();
            Ok(Self { trace_id })
        }
    }
}

pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}
