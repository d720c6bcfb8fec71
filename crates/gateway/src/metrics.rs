use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static WATCH_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static WATCH_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static LABEL_UPDATE_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("hubgate_http_requests_total", "Gateway HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create hubgate_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "hubgate_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create hubgate_http_request_duration_seconds"),
        )
    })
}

fn watch_sessions() -> &'static IntGauge {
    WATCH_SESSIONS.get_or_init(|| {
        register_collector(
            IntGauge::new("hubgate_watch_sessions", "Live watch sessions.")
                .expect("create hubgate_watch_sessions"),
        )
    })
}

fn watch_events_total() -> &'static IntCounterVec {
    WATCH_EVENTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("hubgate_watch_events_total", "Watch events emitted."),
                &["type"],
            )
            .expect("create hubgate_watch_events_total"),
        )
    })
}

fn label_update_failures_total() -> &'static IntCounter {
    LABEL_UPDATE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "hubgate_label_update_failures_total",
                "Label updates that exhausted their retry budget or failed.",
            )
            .expect("create hubgate_label_update_failures_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn inc_watch_sessions() {
    watch_sessions().inc();
}

pub fn dec_watch_sessions() {
    watch_sessions().dec();
}

pub fn observe_watch_event(event_type: &str) {
    watch_events_total().with_label_values(&[event_type]).inc();
}

pub fn inc_label_update_failure() {
    label_update_failures_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
