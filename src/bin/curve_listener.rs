// DANS : src/bin/curve_listener.rs
//
// Suit les courbes listées dans CURVE_KEYS et journalise chaque trade en JSON.

use anyhow::{Context, Result, bail};
use std::time::Duration;
use tracing::{error, info, warn};

use curve_feed::{
    CurveFeed, CurveKey, ListenerId, TradeEvent,
    config::Config,
    monitoring::{logging::setup_logging, metrics},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Chargement de la configuration")?;
    setup_logging(&config.log_format);

    let keys = config.curve_keys()?;
    if keys.is_empty() {
        bail!("CURVE_KEYS est vide : aucune courbe à suivre.");
    }

    if let Some(port) = config.metrics_port {
        tokio::spawn(metrics::start_metrics_server(port));
    }

    info!(rpc = %config.solana_rpc_url, ws = %config.ws_url(), curves = keys.len(), "[Listener] Connexion au nœud Solana...");
    let feed = CurveFeed::connect(&config).await?;

    let mut subscriptions: Vec<(CurveKey, ListenerId)> = Vec::with_capacity(keys.len());
    for key in keys {
        match feed.on_event(key, log_trade).await {
            Ok((listener_id, status)) => {
                info!(curve = %key, outcome = ?status.outcome, "[Listener] Courbe suivie.");
                subscriptions.push((key, listener_id));
            }
            Err(e) => error!(curve = %key, error = %e, "[Listener] Abonnement impossible."),
        }
    }
    if subscriptions.is_empty() {
        bail!("Aucune courbe n'a pu être suivie.");
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.status_interval_secs.max(1)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => report_statuses(&feed).await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "[Listener] Écoute du signal impossible, arrêt.");
                }
                break;
            }
        }
    }

    info!("[Listener] Arrêt demandé, désabonnement des courbes...");
    for (key, listener_id) in subscriptions {
        feed.unsubscribe(key, listener_id).await;
    }
    feed.shutdown().await;
    info!("[Listener] Terminé.");
    Ok(())
}

fn log_trade(key: &CurveKey, event: &TradeEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(curve = %key, trade = %json, "[Trade]"),
        Err(e) => warn!(curve = %key, error = %e, "[Trade] Sérialisation impossible."),
    }
}

async fn report_statuses(feed: &CurveFeed) {
    let statuses = match feed.statuses().await {
        Ok(statuses) => statuses,
        Err(e) => {
            warn!(error = %e, "[Status] Moteur indisponible.");
            return;
        }
    };
    for status in statuses {
        info!(
            curve = %status.key,
            subscribed = status.subscribed,
            listeners = status.listener_count,
            events = status.event_count,
            pending = status.pending_trades,
            last_event = ?status.last_event_time,
            "[Status]"
        );
    }
}
