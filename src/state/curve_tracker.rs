// DANS : src/state/curve_tracker.rs

use super::{ProvisionalTrade, ReserveSnapshot, infer_trade};
use crate::{
    decoders::{AccountRecord, AccountSchema, LayoutDecoder, pump::bonding_curve::MIN_ACCOUNT_LEN},
    monitoring::metrics,
    types::CurveKey,
};
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Garde le dernier instantané de réserves de chaque courbe et en déduit les trades.
/// Un seul pas d'historique : l'inférence n'a besoin que du delta.
pub struct CurveStateTracker {
    decoder: Arc<dyn LayoutDecoder>,
    snapshots: HashMap<CurveKey, ReserveSnapshot>,
}

impl CurveStateTracker {
    pub fn new(decoder: Arc<dyn LayoutDecoder>) -> Self {
        Self { decoder, snapshots: HashMap::new() }
    }

    /// Traite une notification de compte.
    ///
    /// Des octets illisibles ne sont pas une erreur : on ne retient rien et on ne
    /// touche pas à l'instantané précédent. La première notification lisible ne
    /// fait que poser la référence.
    pub fn on_account_notification(
        &mut self,
        key: &CurveKey,
        data: &[u8],
        lamports: u64,
        slot: u64,
    ) -> Option<ProvisionalTrade> {
        if data.len() < MIN_ACCOUNT_LEN {
            metrics::DECODE_FAILURES.with_label_values(&["account_short"]).inc();
            debug!(curve = %key, len = data.len(), slot, "Notification de compte trop courte, ignorée.");
            return None;
        }
        let account = match self.decoder.decode_account(AccountSchema::BondingCurve, data) {
            Ok(AccountRecord::BondingCurve(account)) => account,
            Err(e) => {
                metrics::DECODE_FAILURES.with_label_values(&["account_layout"]).inc();
                debug!(curve = %key, slot, error = %e, "Compte illisible, ignoré.");
                return None;
            }
        };

        let next = ReserveSnapshot::from_account(&account, lamports, slot);
        let Some(prev) = self.snapshots.insert(*key, next.clone()) else {
            trace!(curve = %key, slot, "Instantané de référence enregistré.");
            return None;
        };

        let inferred = infer_trade(&prev, &next)?;
        metrics::TRADES_INFERRED.with_label_values(&[inferred.direction.as_str()]).inc();
        debug!(
            curve = %key,
            slot,
            direction = %inferred.direction,
            sol_lamports = inferred.sol_lamports,
            tokens = inferred.token_amount_delta,
            "Trade déduit du delta de réserves."
        );

        Some(ProvisionalTrade {
            direction: inferred.direction,
            amount_sol: inferred.amount_sol(),
            token_amount_delta: inferred.token_amount_delta,
            slot,
            created_at: Instant::now(),
        })
    }

    pub fn snapshot(&self, key: &CurveKey) -> Option<&ReserveSnapshot> {
        self.snapshots.get(key)
    }

    /// Oublie la référence d'une courbe (désabonnement ou flux coupé).
    pub fn forget(&mut self, key: &CurveKey) {
        self.snapshots.remove(key);
    }

    pub fn tracked_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoders::PumpLayoutDecoder,
        testkit::curve_account_data,
        types::TradeDirection,
    };
    use solana_sdk::pubkey::Pubkey;

    fn tracker() -> CurveStateTracker {
        CurveStateTracker::new(Arc::new(PumpLayoutDecoder))
    }

    #[tokio::test]
    async fn first_notification_only_sets_the_baseline() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut tracker = tracker();
        assert!(tracker.on_account_notification(&key, &curve_account_data(100, 1_000), 0, 10).is_none());
        assert_eq!(tracker.snapshot(&key).unwrap().sol_reserves, 100);
    }

    #[tokio::test]
    async fn consecutive_snapshots_produce_one_trade_each() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut tracker = tracker();
        tracker.on_account_notification(&key, &curve_account_data(100, 1_000), 0, 10);

        let buy = tracker.on_account_notification(&key, &curve_account_data(150, 900), 0, 11).unwrap();
        assert_eq!(buy.direction, TradeDirection::Buy);
        assert_eq!(buy.amount_sol, 50.0 / 1e9);
        assert_eq!(buy.token_amount_delta, 100);
        assert_eq!(buy.slot, 11);

        let sell = tracker.on_account_notification(&key, &curve_account_data(120, 960), 0, 12).unwrap();
        assert_eq!(sell.direction, TradeDirection::Sell);
        assert_eq!(sell.amount_sol, 30.0 / 1e9);
    }

    #[tokio::test]
    async fn non_trade_mutation_still_moves_the_baseline() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut tracker = tracker();
        tracker.on_account_notification(&key, &curve_account_data(100, 1_000), 0, 10);
        // Signes mixtes : pas de trade, mais la référence avance.
        assert!(tracker.on_account_notification(&key, &curve_account_data(200, 1_100), 0, 11).is_none());
        let buy = tracker.on_account_notification(&key, &curve_account_data(210, 1_090), 0, 12).unwrap();
        assert_eq!(buy.amount_sol, 10.0 / 1e9);
    }

    #[tokio::test]
    async fn unreadable_bytes_keep_the_previous_snapshot() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut tracker = tracker();
        tracker.on_account_notification(&key, &curve_account_data(100, 1_000), 0, 10);

        assert!(tracker.on_account_notification(&key, &[0u8; 12], 0, 11).is_none());
        let mut foreign = curve_account_data(500, 10);
        foreign[0] ^= 0xff;
        assert!(tracker.on_account_notification(&key, &foreign, 0, 12).is_none());
        assert_eq!(tracker.snapshot(&key).unwrap().sol_reserves, 100);

        tracker.forget(&key);
        assert_eq!(tracker.tracked_count(), 0);
    }
}
