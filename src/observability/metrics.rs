use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_outcomes_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub orders_in_queue: IntGauge,
    pub assignment_races_lost_total: IntCounter,
    pub collaborator_failures_total: IntCounterVec,
    pub notifications_total: IntCounterVec,
    pub sweeper_redispatched_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_outcomes_total = IntCounterVec::new(
            Opts::new("dispatch_outcomes_total", "Dispatch decisions by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_outcomes_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of one dispatch decision cycle in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let orders_in_queue = IntGauge::new(
            "orders_in_queue",
            "Orders currently waiting in the driver queue",
        )
        .expect("valid orders_in_queue metric");

        let assignment_races_lost_total = IntCounter::new(
            "assignment_races_lost_total",
            "Conditional assignments that matched zero rows",
        )
        .expect("valid assignment_races_lost_total metric");

        let collaborator_failures_total = IntCounterVec::new(
            Opts::new(
                "collaborator_failures_total",
                "Collaborator calls that failed after retries",
            ),
            &["operation"],
        )
        .expect("valid collaborator_failures_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Notification deliveries by result"),
            &["result"],
        )
        .expect("valid notifications_total metric");

        let sweeper_redispatched_total = IntCounter::new(
            "sweeper_redispatched_total",
            "Stale pending orders re-driven by the sweeper",
        )
        .expect("valid sweeper_redispatched_total metric");

        registry
            .register(Box::new(dispatch_outcomes_total.clone()))
            .expect("register dispatch_outcomes_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(assignment_races_lost_total.clone()))
            .expect("register assignment_races_lost_total");
        registry
            .register(Box::new(collaborator_failures_total.clone()))
            .expect("register collaborator_failures_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(sweeper_redispatched_total.clone()))
            .expect("register sweeper_redispatched_total");

        Self {
            registry,
            dispatch_outcomes_total,
            dispatch_latency_seconds,
            orders_in_queue,
            assignment_races_lost_total,
            collaborator_failures_total,
            notifications_total,
            sweeper_redispatched_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
