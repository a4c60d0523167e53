//! OpenTelemetry instruments for routing, status transitions and A/B tests.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct RouteMetrics {
    pub routed_total: Counter<u64>,
    pub failed_total: Counter<u64>,
    pub predictor_errors_total: Counter<u64>,
    pub predict_latency_ms: Histogram<f64>,
}

pub struct LifecycleMetrics {
    pub status_transitions_total: Counter<u64>,
    pub ab_tests_opened_total: Counter<u64>,
    pub ab_tests_closed_total: Counter<u64>,
    pub registrations_total: Counter<u64>,
}

pub struct GatewayMetrics {
    pub route: RouteMetrics,
    pub lifecycle: LifecycleMetrics,
}

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("inference-gateway"));

pub static METRICS: Lazy<GatewayMetrics> = Lazy::new(|| GatewayMetrics {
    route: RouteMetrics {
        routed_total: METER.u64_counter("gateway_route_total").with_description("Requests routed to a model version").build(),
        failed_total: METER.u64_counter("gateway_route_failed_total").with_description("Route calls that failed before logging").build(),
        predictor_errors_total: METER.u64_counter("gateway_predictor_errors_total").with_description("Predictions returned with an error body").build(),
        predict_latency_ms: METER.f64_histogram("gateway_predict_latency_ms").with_description("Predictor call latency ms").with_unit("ms").build(),
    },
    lifecycle: LifecycleMetrics {
        status_transitions_total: METER.u64_counter("gateway_status_transitions_total").with_description("Committed status activations").build(),
        ab_tests_opened_total: METER.u64_counter("gateway_ab_tests_opened_total").with_description("A/B tests opened").build(),
        ab_tests_closed_total: METER.u64_counter("gateway_ab_tests_closed_total").with_description("A/B tests closed with a promotion").build(),
        registrations_total: METER.u64_counter("gateway_registrations_total").with_description("Model versions registered at bootstrap").build(),
    },
});
