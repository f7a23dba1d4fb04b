// DANS : src/monitoring/metrics.rs

use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge_vec,
};
use tracing::info;
use warp::Filter;

lazy_static! {
    // --- Inférence & Corrélation ---
    pub static ref TRADES_INFERRED: IntCounterVec = register_int_counter_vec!(
        "curve_feed_trades_inferred_total",
        "Trades provisoires déduits des deltas de réserves",
        &["direction"] // Labels: "buy", "sell"
    ).unwrap();
    pub static ref EVENTS_EMITTED: IntCounterVec = register_int_counter_vec!(
        "curve_feed_events_emitted_total",
        "Événements finaux diffusés, segmentés par origine",
        &["origin"] // Labels: "matched", "expired", "log", "amm"
    ).unwrap();
    pub static ref MATCH_SLOT_DISTANCE: Histogram = register_histogram!(
        "curve_feed_match_slot_distance",
        "Écart de slots entre un log et le trade provisoire apparié",
        vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
    ).unwrap();
    pub static ref DIRECTION_DIVERGENCES: IntCounter = register_int_counter!(
        "curve_feed_direction_divergences_total", "Logs dont le sens contredit le delta de réserves apparié"
    ).unwrap();
    pub static ref STALE_PENDING_DISCARDED: IntCounter = register_int_counter!(
        "curve_feed_stale_pending_discarded_total", "Trades provisoires jetés par le balayage de péremption"
    ).unwrap();
    pub static ref DUPLICATE_LOGS: IntCounter = register_int_counter!(
        "curve_feed_duplicate_logs_total", "Notifications de logs reçues plusieurs fois (même signature)"
    ).unwrap();

    // --- Décodage ---
    pub static ref DECODE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "curve_feed_decode_failures_total",
        "Données de compte ou d'événement illisibles",
        &["kind"] // Labels: "account_short", "account_layout", "event", "foreign_curve"
    ).unwrap();

    // --- Santé des abonnements ---
    pub static ref ACTIVE_SUBSCRIPTIONS: IntGaugeVec = register_int_gauge_vec!(
        "curve_feed_active_subscriptions",
        "Paires d'abonnements amont actuellement ouvertes",
        &["variant"] // Labels: "bonding_curve", "pump_amm"
    ).unwrap();
    pub static ref UPSTREAM_OPEN_FAILURES: IntCounter = register_int_counter!(
        "curve_feed_upstream_open_failures_total", "Ouvertures d'abonnements amont refusées"
    ).unwrap();
    pub static ref UPSTREAM_STREAMS_CLOSED: IntCounter = register_int_counter!(
        "curve_feed_upstream_streams_closed_total", "Flux amont interrompus en cours de route"
    ).unwrap();
    pub static ref LISTENERS_DROPPED: IntCounter = register_int_counter!(
        "curve_feed_listeners_dropped_total", "Auditeurs retirés après un échec de livraison"
    ).unwrap();
}

/// Encode toutes les métriques du registre global au format texte Prometheus.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub async fn start_metrics_server(port: u16) {
    let metrics_route = warp::path!("metrics").map(|| match render() {
        Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
        Err(e) => warp::reply::with_status(e.to_string(), warp::http::StatusCode::INTERNAL_SERVER_ERROR),
    });
    info!(port, "Serveur de métriques exposé sur /metrics");
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_registered_counters() {
        DUPLICATE_LOGS.inc();
        EVENTS_EMITTED.with_label_values(&["log"]).inc();
        let text = render().unwrap();
        assert!(text.contains("curve_feed_duplicate_logs_total"));
        assert!(text.contains("origin=\"log\""));
    }
}
