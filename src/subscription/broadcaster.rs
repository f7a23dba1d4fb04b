// DANS : src/subscription/broadcaster.rs

use super::{listener::ListenerId, registry::SubscriptionEntry};
use crate::{monitoring::metrics, types::TradeEvent};
use chrono::Utc;
use tracing::{info, trace};

/// Bilan d'une diffusion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: Vec<ListenerId>,
}

/// Livre `event` à chaque auditeur de l'entrée.
///
/// Un échec ne concerne que son auditeur : il est retiré de l'entrée (déconnexion
/// implicite) et la diffusion continue. Au registre ensuite de supprimer l'entrée
/// si elle se retrouve vide.
pub fn broadcast(entry: &mut SubscriptionEntry, event: &TradeEvent) -> FanoutReport {
    let key = entry.key();
    entry.event_count += 1;
    entry.last_event_time = Some(Utc::now());

    let mut report = FanoutReport::default();
    for (id, listener) in &entry.listeners {
        match listener.deliver(&key, event) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                info!(curve = %key, listener = %id, reason = %e, "Livraison impossible, auditeur retiré.");
                report.dropped.push(*id);
            }
        }
    }
    for id in &report.dropped {
        entry.listeners.remove(id);
    }
    metrics::LISTENERS_DROPPED.inc_by(report.dropped.len() as u64);
    trace!(curve = %key, delivered = report.delivered, slot = event.slot, "Événement diffusé.");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        subscription::listener::{CallbackListener, TradeListener},
        types::{CurveKey, ProgramVariant, TradeDirection},
    };
    use solana_sdk::pubkey::Pubkey;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::sync::mpsc;

    fn event(slot: u64) -> TradeEvent {
        TradeEvent {
            direction: TradeDirection::Buy,
            amount_sol: 0.1,
            signature: None,
            trader_identity: None,
            slot,
            token_amount_delta: None,
        }
    }

    #[test]
    fn one_failing_listener_does_not_stop_the_others() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut entry = SubscriptionEntry::new(key, ProgramVariant::BondingCurve, 1);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback = CallbackListener::new(move |_: &CurveKey, _: &TradeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (closed_tx, closed_rx) = mpsc::channel::<TradeEvent>(4);
        drop(closed_rx);
        let (live_tx, mut live_rx) = mpsc::channel::<TradeEvent>(4);

        entry.listeners.insert(ListenerId::new(1), Arc::new(closed_tx) as Arc<dyn TradeListener>);
        entry.listeners.insert(ListenerId::new(2), Arc::new(callback));
        entry.listeners.insert(ListenerId::new(3), Arc::new(live_tx));

        let report = broadcast(&mut entry, &event(5));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, vec![ListenerId::new(1)]);
        assert_eq!(entry.listener_count(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(live_rx.try_recv().unwrap().slot, 5);
        assert_eq!(entry.event_count(), 1);
        assert!(entry.last_event_time.is_some());
    }

    #[test]
    fn slow_listener_is_dropped_when_its_queue_is_full() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut entry = SubscriptionEntry::new(key, ProgramVariant::BondingCurve, 1);
        let (tx, _rx) = mpsc::channel::<TradeEvent>(1);
        entry.listeners.insert(ListenerId::new(1), Arc::new(tx));

        assert!(broadcast(&mut entry, &event(1)).dropped.is_empty());
        assert_eq!(broadcast(&mut entry, &event(2)).dropped, vec![ListenerId::new(1)]);
        assert_eq!(entry.listener_count(), 0);
    }
}
