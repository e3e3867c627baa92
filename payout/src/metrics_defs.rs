use shared::metrics_defs::{MetricDef, MetricType};

pub const PAYOUT_REQUESTS: MetricDef = MetricDef {
    name: "payout.requests",
    metric_type: MetricType::Counter,
    description: "Payout requests handled. Tagged with outcome.",
};

pub const PAYOUT_REQUEST_DURATION: MetricDef = MetricDef {
    name: "payout.request.duration",
    metric_type: MetricType::Histogram,
    description: "Payout request duration in seconds. Tagged with outcome.",
};

pub const SUBSCRIPTIONS_CREATED: MetricDef = MetricDef {
    name: "payout.subscriptions.created",
    metric_type: MetricType::Counter,
    description: "Sponsorships created on the payment gateway",
};

pub const CANCELLATION_ATTEMPTS: MetricDef = MetricDef {
    name: "payout.cancellation.attempts",
    metric_type: MetricType::Counter,
    description: "Cancellation attempts. Tagged with outcome, path (sync, background).",
};

pub const CANCELLATIONS_FAILED: MetricDef = MetricDef {
    name: "payout.cancellation.failed",
    metric_type: MetricType::Counter,
    description: "Payouts whose cancellation permanently failed and need manual action",
};

pub const PENDING_CANCELLATIONS: MetricDef = MetricDef {
    name: "payout.cancellation.pending",
    metric_type: MetricType::Gauge,
    description: "Cancellations due for a background retry at the last worker pass",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PAYOUT_REQUESTS,
    PAYOUT_REQUEST_DURATION,
    SUBSCRIPTIONS_CREATED,
    CANCELLATION_ATTEMPTS,
    CANCELLATIONS_FAILED,
    PENDING_CANCELLATIONS,
];
