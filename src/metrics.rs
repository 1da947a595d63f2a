use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission decisions
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    decisions: CounterVec,
    fallback_decisions: CounterVec,
    store_errors: CounterVec,
    decision_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "admission_decisions_total",
                "Admission decisions by limiter, algorithm and result",
            ),
            &["limiter", "algorithm", "result"],
        )?;

        let fallback_decisions = CounterVec::new(
            Opts::new(
                "admission_fallback_total",
                "Decisions taken by failure policy because the state store failed",
            ),
            &["limiter", "policy"],
        )?;

        let store_errors = CounterVec::new(
            Opts::new(
                "admission_store_errors_total",
                "State store failures by limiter and error kind",
            ),
            &["limiter", "kind"],
        )?;

        let decision_duration = HistogramVec::new(
            HistogramOpts::new(
                "admission_decision_duration_seconds",
                "Duration of admission decisions in seconds",
            ),
            &["limiter"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(fallback_decisions.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            fallback_decisions,
            store_errors,
            decision_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admit or reject
    pub fn record_decision(&self, limiter: &str, algorithm: &str, admitted: bool) {
        let result = if admitted { "admitted" } else { "rejected" };
        self.decisions
            .with_label_values(&[limiter, algorithm, result])
            .inc();
    }

    /// Record a decision produced by the failure policy
    pub fn record_fallback(&self, limiter: &str, policy: &str) {
        self.fallback_decisions
            .with_label_values(&[limiter, policy])
            .inc();
    }

    /// Record a failed store cycle
    pub fn record_store_error(&self, limiter: &str, kind: &str) {
        self.store_errors.with_label_values(&[limiter, kind]).inc();
    }

    /// Start a timer observing decision duration when dropped
    pub fn start_decision_timer(&self, limiter: &str) -> prometheus::HistogramTimer {
        self.decision_duration
            .with_label_values(&[limiter])
            .start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
