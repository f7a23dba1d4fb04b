// DANS : src/decoders/pump/events.rs

use anyhow::{Context, Result};
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;

pub const TRADE_EVENT_DISCRIMINATOR: [u8; 8] = [189, 219, 127, 211, 78, 230, 97, 238];

/// Préfixe stable du `TradeEvent` pump.fun. Les champs ajoutés ensuite par le
/// programme (frais, créateur, volume...) sont ignorés.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Default)]
pub struct CurveTradeEvent {
    pub mint: Pubkey,
    pub sol_amount: u64,
    pub token_amount: u64,
    pub is_buy: bool,
    pub user: Pubkey,
    pub timestamp: i64,
    pub virtual_sol_reserves: u64,
    pub virtual_token_reserves: u64,
}

/// Décode la charge utile (sans discriminateur) d'un `TradeEvent`.
pub fn decode_trade_event(payload: &[u8]) -> Result<CurveTradeEvent> {
    // `deserialize` tolère les octets en trop, contrairement à `try_from_slice`.
    let mut reader = payload;
    CurveTradeEvent::deserialize(&mut reader).context("TradeEvent pump.fun illisible")
}

/// Encode un événement complet, discriminateur inclus (fixtures de test).
pub fn encode_trade_event(event: &CurveTradeEvent) -> Vec<u8> {
    let mut data = TRADE_EVENT_DISCRIMINATOR.to_vec();
    // L'écriture dans un Vec ne peut pas échouer.
    let _ = event.serialize(&mut data);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_fields_are_ignored() {
        let event = CurveTradeEvent {
            mint: Pubkey::new_unique(),
            sol_amount: 50,
            token_amount: 100,
            is_buy: true,
            user: Pubkey::new_unique(),
            timestamp: 1_700_000_000,
            virtual_sol_reserves: 150,
            virtual_token_reserves: 900,
        };
        let mut data = encode_trade_event(&event);
        data.extend_from_slice(&[7u8; 64]);
        assert_eq!(decode_trade_event(&data[8..]).unwrap(), event);
    }

    #[test]
    fn truncated_payload_fails() {
        let data = encode_trade_event(&CurveTradeEvent::default());
        assert!(decode_trade_event(&data[8..40]).is_err());
    }

    #[test]
    fn invalid_bool_fails() {
        let mut data = encode_trade_event(&CurveTradeEvent::default());
        // is_buy se trouve après mint (32) + sol_amount (8) + token_amount (8).
        data[8 + 48] = 2;
        assert!(decode_trade_event(&data[8..]).is_err());
    }
}
