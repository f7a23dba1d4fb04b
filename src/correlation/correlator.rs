// DANS : src/correlation/correlator.rs

use super::{
    log_events::{LogTradeEvent, decode_log_trades},
    pending::{PendingBook, PendingTrade},
};
use crate::{
    config::EngineSettings,
    decoders::LayoutDecoder,
    monitoring::metrics,
    rpc::LogNotification,
    state::ProvisionalTrade,
    types::{CurveKey, ProgramVariant, TradeEvent},
};
use futures_util::future::poll_fn;
use std::{collections::HashMap, sync::Arc, task::Poll, time::Duration};
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

/// Chemin par lequel un événement final a été produit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Trade provisoire enrichi par son log.
    Matched,
    /// Trade provisoire émis seul après le délai de corrélation.
    Expired,
    /// Log pump.fun sans trade provisoire correspondant.
    Log,
    /// Log pump AMM, émis directement.
    Amm,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Expired => "expired",
            Self::Log => "log",
            Self::Amm => "amm",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub key: CurveKey,
    pub event: TradeEvent,
    pub origin: EventOrigin,
}

/// Rapproche les trades déduits des comptes et les événements lus dans les logs.
///
/// Toutes les tables et tous les timers vivent ici ; la boucle d'événements est
/// le seul propriétaire, d'où l'absence de verrou.
pub struct Correlator {
    decoder: Arc<dyn LayoutDecoder>,
    window_slots: u64,
    match_timeout: Duration,
    stale_after: Duration,
    memory: usize,
    books: HashMap<CurveKey, PendingBook>,
    timers: DelayQueue<(CurveKey, u64)>,
    next_id: u64,
}

impl Correlator {
    pub fn new(decoder: Arc<dyn LayoutDecoder>, settings: &EngineSettings) -> Self {
        Self {
            decoder,
            window_slots: settings.match_window_slots,
            match_timeout: settings.match_timeout,
            stale_after: settings.stale_after,
            memory: settings.signature_memory,
            books: HashMap::new(),
            timers: DelayQueue::new(),
            next_id: 0,
        }
    }

    /// Met un trade provisoire en attente de son log, avec un timer d'expiration.
    ///
    /// Si un log décrivant ce trade a déjà été émis seul, le trade est considéré
    /// comme déjà publié et n'est pas remis en table.
    pub fn track(&mut self, key: CurveKey, trade: ProvisionalTrade) {
        let book = self.books.entry(key).or_default();
        let not_before = Instant::now().checked_sub(self.stale_after);
        if book.claim_surfaced(trade.direction, trade.slot, self.window_slots, not_before) {
            debug!(curve = %key, slot = trade.slot, direction = %trade.direction, "Trade déjà publié par son log, non remis en attente.");
            return;
        }

        self.next_id += 1;
        let id = self.next_id;
        let timer = self.timers.insert((key, id), self.match_timeout);
        book.insert(PendingTrade { id, trade, timer });
    }

    /// Jette les trades restés en table au-delà du délai de péremption.
    pub fn sweep_stale(&mut self, key: &CurveKey) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.stale_after) else {
            return 0;
        };
        let Some(book) = self.books.get_mut(key) else {
            return 0;
        };
        let stale = book.drain_older_than(cutoff);
        for pending in &stale {
            self.timers.try_remove(&pending.timer);
            warn!(curve = %key, slot = pending.trade.slot, id = pending.id, "Trade provisoire périmé jeté par le balayage.");
        }
        metrics::STALE_PENDING_DISCARDED.inc_by(stale.len() as u64);
        stale.len()
    }

    /// Traite les logs d'une transaction et retourne les événements à diffuser.
    pub fn on_log_notification(
        &mut self,
        key: CurveKey,
        variant: ProgramVariant,
        notification: &LogNotification,
    ) -> Vec<Emission> {
        if notification.failed {
            debug!(curve = %key, signature = %notification.signature, "Transaction échouée, logs ignorés.");
            return Vec::new();
        }
        let book = self.books.entry(key).or_default();
        if !book.record_signature(&notification.signature, self.memory) {
            metrics::DUPLICATE_LOGS.inc();
            debug!(curve = %key, signature = %notification.signature, "Logs déjà traités pour cette signature.");
            return Vec::new();
        }

        let trades = decode_log_trades(self.decoder.as_ref(), variant, &key, notification);
        let mut emissions = Vec::with_capacity(trades.len());
        for log in trades {
            if !variant.correlates_account_deltas() {
                emissions.push(Emission { key, event: log.to_trade_event(), origin: EventOrigin::Amm });
                continue;
            }

            match book.take_match(log.slot, self.window_slots, log.direction) {
                Some(pending) => {
                    self.timers.try_remove(&pending.timer);
                    metrics::MATCH_SLOT_DISTANCE.observe(pending.trade.slot.abs_diff(log.slot) as f64);
                    emissions.push(Emission { key, event: merge(&key, &pending.trade, &log), origin: EventOrigin::Matched });
                }
                None => {
                    book.remember_surfaced(log.direction, log.slot, Instant::now(), self.memory);
                    emissions.push(Emission { key, event: log.to_trade_event(), origin: EventOrigin::Log });
                }
            }
        }
        emissions
    }

    /// Attend la prochaine expiration de timer et produit l'événement autonome correspondant.
    /// Reste en attente tant qu'aucun timer n'est armé.
    pub async fn next_expired(&mut self) -> Emission {
        loop {
            let (key, id) = poll_fn(|cx| match self.timers.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
                _ => Poll::Pending,
            })
            .await;

            let Some(pending) = self.books.get_mut(&key).and_then(|book| book.take(id)) else {
                continue;
            };
            debug!(curve = %key, slot = pending.trade.slot, "Aucun log apparié à temps, trade émis seul.");
            return Emission {
                key,
                event: TradeEvent {
                    direction: pending.trade.direction,
                    amount_sol: pending.trade.amount_sol,
                    signature: None,
                    trader_identity: None,
                    slot: pending.trade.slot,
                    token_amount_delta: Some(pending.trade.token_amount_delta.to_string()),
                },
                origin: EventOrigin::Expired,
            };
        }
    }

    /// Oublie tout l'état d'une courbe et désarme ses timers. Retourne le nombre de
    /// trades en attente abandonnés.
    pub fn forget(&mut self, key: &CurveKey) -> usize {
        let Some(mut book) = self.books.remove(key) else {
            return 0;
        };
        let dropped = book.drain_all();
        for pending in &dropped {
            self.timers.try_remove(&pending.timer);
        }
        if !dropped.is_empty() {
            info!(curve = %key, dropped = dropped.len(), "Trades provisoires abandonnés avec l'abonnement.");
        }
        dropped.len()
    }

    pub fn pending_count(&self, key: &CurveKey) -> usize {
        self.books.get(key).map_or(0, PendingBook::len)
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }
}

/// Le delta de réserves fait foi pour le sens, les montants et le slot ;
/// le log apporte la signature et l'identité du trader.
fn merge(key: &CurveKey, provisional: &ProvisionalTrade, log: &LogTradeEvent) -> TradeEvent {
    if provisional.direction != log.direction {
        metrics::DIRECTION_DIVERGENCES.inc();
        warn!(
            curve = %key,
            signature = %log.signature,
            delta = %provisional.direction,
            log = %log.direction,
            "Le sens du log contredit le delta de réserves ; le delta fait foi."
        );
    }
    TradeEvent {
        direction: provisional.direction,
        amount_sol: provisional.amount_sol,
        signature: Some(log.signature.clone()),
        trader_identity: Some(log.trader.to_string()),
        slot: provisional.slot,
        token_amount_delta: Some(provisional.token_amount_delta.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoders::PumpLayoutDecoder,
        testkit::{amm_sell_log, curve_trade_log, garbage_log, pump_curve_key},
        types::TradeDirection,
    };
    use solana_sdk::pubkey::Pubkey;

    fn correlator() -> Correlator {
        Correlator::new(Arc::new(PumpLayoutDecoder), &EngineSettings::default())
    }

    fn provisional(direction: TradeDirection, lamports: u64, slot: u64) -> ProvisionalTrade {
        ProvisionalTrade {
            direction,
            amount_sol: lamports as f64 / 1e9,
            token_amount_delta: 100,
            slot,
            created_at: Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn log_within_window_merges_with_pending_trade() {
        let mint = Pubkey::new_unique();
        let key = pump_curve_key(&mint);
        let user = Pubkey::new_unique();
        let mut correlator = correlator();

        correlator.track(key, provisional(TradeDirection::Buy, 50, 100));
        let log = curve_trade_log(&mint, true, 49, 99, &user, "sig-a", 102);
        let emissions = correlator.on_log_notification(key, ProgramVariant::BondingCurve, &log);

        assert_eq!(emissions.len(), 1);
        let emission = &emissions[0];
        assert_eq!(emission.origin, EventOrigin::Matched);
        // Les montants et le slot viennent du delta.
        assert_eq!(emission.event.amount_sol, 50.0 / 1e9);
        assert_eq!(emission.event.slot, 100);
        assert_eq!(emission.event.token_amount_delta.as_deref(), Some("100"));
        assert_eq!(emission.event.signature.as_deref(), Some("sig-a"));
        assert_eq!(emission.event.trader_identity, Some(user.to_string()));
        assert_eq!(correlator.pending_count(&key), 0);
        assert_eq!(correlator.armed_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn log_outside_window_is_standalone_and_trade_expires() {
        let mint = Pubkey::new_unique();
        let key = pump_curve_key(&mint);
        let mut correlator = correlator();

        correlator.track(key, provisional(TradeDirection::Buy, 50, 100));
        let log = curve_trade_log(&mint, true, 50, 100, &Pubkey::new_unique(), "sig-b", 106);
        let emissions = correlator.on_log_notification(key, ProgramVariant::BondingCurve, &log);
        assert_eq!(emissions[0].origin, EventOrigin::Log);
        assert_eq!(emissions[0].event.slot, 106);
        assert_eq!(correlator.pending_count(&key), 1);

        let start = Instant::now();
        let expired = correlator.next_expired().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(expired.origin, EventOrigin::Expired);
        assert_eq!(expired.event.signature, None);
        assert_eq!(expired.event.trader_identity, None);
        assert_eq!(expired.event.amount_sol, 50.0 / 1e9);
        assert_eq!(correlator.pending_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delta_direction_wins_on_divergence() {
        let mint = Pubkey::new_unique();
        let key = pump_curve_key(&mint);
        let mut correlator = correlator();

        correlator.track(key, provisional(TradeDirection::Sell, 70, 10));
        let before = metrics::DIRECTION_DIVERGENCES.get();
        let log = curve_trade_log(&mint, true, 70, 100, &Pubkey::new_unique(), "sig-c", 10);
        let emissions = correlator.on_log_notification(key, ProgramVariant::BondingCurve, &log);
        assert_eq!(emissions[0].event.direction, TradeDirection::Sell);
        assert!(metrics::DIRECTION_DIVERGENCES.get() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn log_first_then_matching_delta_is_not_published_twice() {
        let mint = Pubkey::new_unique();
        let key = pump_curve_key(&mint);
        let mut correlator = correlator();

        let log = curve_trade_log(&mint, false, 30, 10, &Pubkey::new_unique(), "sig-d", 200);
        let emissions = correlator.on_log_notification(key, ProgramVariant::BondingCurve, &log);
        assert_eq!(emissions[0].origin, EventOrigin::Log);

        correlator.track(key, provisional(TradeDirection::Sell, 30, 201));
        assert_eq!(correlator.pending_count(&key), 0);
        assert_eq!(correlator.armed_timers(), 0);

        // Un second trade, sans log, reste en attente normalement.
        correlator.track(key, provisional(TradeDirection::Sell, 30, 202));
        assert_eq!(correlator.pending_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_and_failed_logs_are_ignored() {
        let mint = Pubkey::new_unique();
        let key = pump_curve_key(&mint);
        let mut correlator = correlator();
        let log = curve_trade_log(&mint, true, 1, 1, &Pubkey::new_unique(), "sig-e", 5);

        assert_eq!(correlator.on_log_notification(key, ProgramVariant::BondingCurve, &log).len(), 1);
        assert!(correlator.on_log_notification(key, ProgramVariant::BondingCurve, &log).is_empty());

        let mut failed = curve_trade_log(&mint, true, 1, 1, &Pubkey::new_unique(), "sig-f", 6);
        failed.failed = true;
        assert!(correlator.on_log_notification(key, ProgramVariant::BondingCurve, &failed).is_empty());
        assert!(correlator.on_log_notification(key, ProgramVariant::BondingCurve, &garbage_log("sig-g", 7)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn amm_events_bypass_pending_trades() {
        let pool = Pubkey::new_unique();
        let key = CurveKey::new(pool);
        let mut correlator = correlator();
        correlator.track(key, provisional(TradeDirection::Sell, 5, 9));

        let log = amm_sell_log(&pool, 5, 1, &Pubkey::new_unique(), "sig-h", 9);
        let emissions = correlator.on_log_notification(key, ProgramVariant::PumpAmm, &log);
        assert_eq!(emissions[0].origin, EventOrigin::Amm);
        assert_eq!(correlator.pending_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_disarms_every_timer_of_the_key() {
        let key = pump_curve_key(&Pubkey::new_unique());
        let other = pump_curve_key(&Pubkey::new_unique());
        let mut correlator = correlator();
        correlator.track(key, provisional(TradeDirection::Buy, 1, 1));
        correlator.track(key, provisional(TradeDirection::Buy, 2, 2));
        correlator.track(other, provisional(TradeDirection::Buy, 3, 3));

        assert_eq!(correlator.forget(&key), 2);
        assert_eq!(correlator.armed_timers(), 1);

        let expired = correlator.next_expired().await;
        assert_eq!(expired.key, other);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_discards_trades_older_than_the_stale_bound() {
        let key = pump_curve_key(&Pubkey::new_unique());
        let mut correlator = correlator();
        let mut old = provisional(TradeDirection::Buy, 1, 1);
        correlator.track(key, old.clone());

        tokio::time::advance(Duration::from_secs(11)).await;
        old.created_at = Instant::now();
        correlator.track(key, old);

        assert_eq!(correlator.sweep_stale(&key), 1);
        assert_eq!(correlator.pending_count(&key), 1);
    }
}
