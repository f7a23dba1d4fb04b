// DANS : src/correlation/log_events.rs

use crate::{
    decoders::{
        EventRecord, EventSchema, LayoutDecoder, program_data_payloads, pump::bonding_curve::bonding_curve_address,
    },
    monitoring::metrics,
    rpc::LogNotification,
    types::{CurveKey, ProgramVariant, TradeDirection, TradeEvent, lamports_to_sol},
};
use solana_sdk::pubkey::Pubkey;
use tracing::debug;

/// Un trade lu dans les logs d'une transaction. Éphémère : consommé tout de suite
/// par le corrélateur.
#[derive(Debug, Clone, PartialEq)]
pub struct LogTradeEvent {
    pub direction: TradeDirection,
    pub amount_sol: f64,
    pub token_amount_delta: u64,
    pub trader: Pubkey,
    pub signature: String,
    pub slot: u64,
}

impl LogTradeEvent {
    /// Événement autonome construit uniquement à partir du log.
    pub fn to_trade_event(&self) -> TradeEvent {
        TradeEvent {
            direction: self.direction,
            amount_sol: self.amount_sol,
            signature: Some(self.signature.clone()),
            trader_identity: Some(self.trader.to_string()),
            slot: self.slot,
            token_amount_delta: Some(self.token_amount_delta.to_string()),
        }
    }
}

/// Schémas d'événements à essayer pour un variant donné.
pub fn candidate_schemas(variant: ProgramVariant) -> &'static [EventSchema] {
    match variant {
        ProgramVariant::BondingCurve => &[EventSchema::CurveTrade],
        ProgramVariant::PumpAmm => &[EventSchema::AmmBuy, EventSchema::AmmSell],
    }
}

/// Extrait les trades de la courbe `key` contenus dans une notification de logs.
///
/// Les lignes illisibles, les discriminateurs inconnus et les événements d'une
/// autre courbe du même programme sont ignorés sans erreur.
pub fn decode_log_trades(
    decoder: &dyn LayoutDecoder,
    variant: ProgramVariant,
    key: &CurveKey,
    notification: &LogNotification,
) -> Vec<LogTradeEvent> {
    let candidates = candidate_schemas(variant);
    let mut trades = Vec::new();

    for payload in program_data_payloads(&notification.lines) {
        let (schema, record) = match decoder.decode_event(&payload, candidates) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::DECODE_FAILURES.with_label_values(&["event"]).inc();
                debug!(curve = %key, signature = %notification.signature, error = %e, "Événement de log ignoré.");
                continue;
            }
        };

        let (curve_ref, trade) = match record {
            EventRecord::CurveTrade(event) => (
                bonding_curve_address(&event.mint),
                LogTradeEvent {
                    direction: TradeDirection::from_is_buy(event.is_buy),
                    amount_sol: lamports_to_sol(event.sol_amount),
                    token_amount_delta: event.token_amount,
                    trader: event.user,
                    signature: notification.signature.clone(),
                    slot: notification.slot,
                },
            ),
            EventRecord::AmmBuy(event) => (
                event.pool,
                LogTradeEvent {
                    direction: TradeDirection::Buy,
                    amount_sol: lamports_to_sol(event.quote_amount_in),
                    token_amount_delta: event.base_amount_out,
                    trader: event.user,
                    signature: notification.signature.clone(),
                    slot: notification.slot,
                },
            ),
            EventRecord::AmmSell(event) => (
                event.pool,
                LogTradeEvent {
                    direction: TradeDirection::Sell,
                    amount_sol: lamports_to_sol(event.quote_amount_out),
                    token_amount_delta: event.base_amount_in,
                    trader: event.user,
                    signature: notification.signature.clone(),
                    slot: notification.slot,
                },
            ),
        };

        if curve_ref != key.pubkey() {
            metrics::DECODE_FAILURES.with_label_values(&["foreign_curve"]).inc();
            debug!(
                curve = %key,
                other = %curve_ref,
                event = schema.name(),
                "Événement d'une autre courbe du même programme, ignoré."
            );
            continue;
        }
        trades.push(trade);
    }
    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoders::PumpLayoutDecoder,
        testkit::{amm_buy_log, amm_sell_log, curve_trade_log, garbage_log, pump_curve_key},
    };

    #[test]
    fn curve_trade_for_watched_mint_is_decoded() {
        let mint = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let key = pump_curve_key(&mint);
        let log = curve_trade_log(&mint, true, 2_500_000_000, 1_000, &user, "sig-1", 77);

        let trades = decode_log_trades(&PumpLayoutDecoder, ProgramVariant::BondingCurve, &key, &log);
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.direction, TradeDirection::Buy);
        assert_eq!(trade.amount_sol, 2.5);
        assert_eq!(trade.trader, user);
        assert_eq!(trade.slot, 77);

        let event = trade.to_trade_event();
        assert_eq!(event.signature.as_deref(), Some("sig-1"));
        assert_eq!(event.token_amount_delta.as_deref(), Some("1000"));
    }

    #[test]
    fn curve_trade_for_another_mint_is_discarded() {
        let key = pump_curve_key(&Pubkey::new_unique());
        let log = curve_trade_log(&Pubkey::new_unique(), false, 10, 10, &Pubkey::new_unique(), "sig", 1);
        assert!(decode_log_trades(&PumpLayoutDecoder, ProgramVariant::BondingCurve, &key, &log).is_empty());
    }

    #[test]
    fn amm_events_must_name_the_watched_pool() {
        let pool = Pubkey::new_unique();
        let key = CurveKey::new(pool);
        let user = Pubkey::new_unique();

        let buy = amm_buy_log(&pool, 1_000_000_000, 5_000, &user, "b", 3);
        let trades = decode_log_trades(&PumpLayoutDecoder, ProgramVariant::PumpAmm, &key, &buy);
        assert_eq!(trades[0].direction, TradeDirection::Buy);
        assert_eq!(trades[0].amount_sol, 1.0);
        assert_eq!(trades[0].token_amount_delta, 5_000);

        let sell = amm_sell_log(&pool, 500_000_000, 2_000, &user, "s", 4);
        let trades = decode_log_trades(&PumpLayoutDecoder, ProgramVariant::PumpAmm, &key, &sell);
        assert_eq!(trades[0].direction, TradeDirection::Sell);
        assert_eq!(trades[0].amount_sol, 0.5);

        let foreign = amm_buy_log(&Pubkey::new_unique(), 1, 1, &user, "f", 5);
        assert!(decode_log_trades(&PumpLayoutDecoder, ProgramVariant::PumpAmm, &key, &foreign).is_empty());
    }

    #[test]
    fn variant_a_tags_are_not_read_as_variant_b() {
        let mint = Pubkey::new_unique();
        let log = curve_trade_log(&mint, true, 1, 1, &Pubkey::new_unique(), "x", 1);
        let key = pump_curve_key(&mint);
        assert!(decode_log_trades(&PumpLayoutDecoder, ProgramVariant::PumpAmm, &key, &log).is_empty());
    }

    #[test]
    fn garbage_lines_yield_nothing() {
        let key = pump_curve_key(&Pubkey::new_unique());
        let log = garbage_log("g", 9);
        assert!(decode_log_trades(&PumpLayoutDecoder, ProgramVariant::BondingCurve, &key, &log).is_empty());
    }
}
