//! Stream server metrics.
//!
//! Uses the global OpenTelemetry meter provider, which the host binary
//! installs. Without one every instrument is a no-op, so tests need no
//! setup.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::routing::DispatchOutcome;
use crate::types::{StanzaType, Transport};

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("hearth-xmpp"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stanzas leaving the router, by outcome.
pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.routed")
        .with_description("Total stanzas dispatched by the router")
        .with_unit("stanza")
        .build()
}

/// Counter for bounces generated.
pub fn stanzas_bounced() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.bounced")
        .with_description("Total stanzas bounced back to their sender")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas discarded without a reply.
pub fn stanzas_dropped() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.dropped")
        .with_description("Total stanzas dropped without a reply")
        .with_unit("stanza")
        .build()
}

/// Counter for reads suspended because of bad karma.
pub fn karma_throttled() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.karma.throttled")
        .with_description("Times a connection entered the karma penalty state")
        .with_unit("event")
        .build()
}

/// Counter for connections refused by the accept rate limiter.
pub fn connections_rate_limited() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.connections.rate_limited")
        .with_description("Connections refused by the per-IP rate limiter")
        .with_unit("connection")
        .build()
}

/// Counter for streams closed because they were not well-formed.
pub fn parse_errors() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.parse.errors")
        .with_description("Streams closed on a parse error")
        .with_unit("stream")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for active connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.connections.active")
        .with_description("Current number of active stream connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record the outcome of one dispatch.
pub fn record_dispatch(kind: StanzaType, outcome: &DispatchOutcome) {
    let attrs = [
        KeyValue::new("type", kind.to_string()),
        KeyValue::new("outcome", outcome.label()),
    ];
    stanzas_routed().add(1, &attrs);

    match outcome {
        DispatchOutcome::Bounced { condition, .. } => {
            stanzas_bounced().add(1, &[KeyValue::new("condition", condition.as_str())]);
        }
        DispatchOutcome::Dropped { .. } => stanzas_dropped().add(1, &attrs[..1]),
        DispatchOutcome::Delivered { .. } => {}
    }
}

/// Record a connection entering the karma penalty state.
pub fn record_karma_throttle(transport: Transport) {
    karma_throttled().add(1, &[KeyValue::new("transport", transport.to_string())]);
}

/// Record a connection refused by the rate limiter.
pub fn record_rate_limited() {
    connections_rate_limited().add(1, &[]);
}

/// Record a stream closed on a parse error.
pub fn record_parse_error() {
    parse_errors().add(1, &[]);
}

/// Record the current connection count.
pub fn record_connection_count(count: i64) {
    connections_active().record(count, &[]);
}
