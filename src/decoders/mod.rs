// src/decoders/mod.rs

use anyhow::{Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};

// --- 1. Déclarer les décodeurs par protocole ---
pub mod pump;

pub use pump::amm::events::{PumpBuyEvent, PumpSellEvent};
pub use pump::bonding_curve::BondingCurveAccount;
pub use pump::events::CurveTradeEvent;

/// Préfixe des logs émis par `emit!` (Anchor).
const PROGRAM_DATA_PREFIX: &str = "Program data: ";

// --- 2. Schémas connus ---

/// Layouts de comptes que l'on sait lire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSchema {
    BondingCurve,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccountRecord {
    BondingCurve(BondingCurveAccount),
}

/// Événements de logs que l'on sait lire, identifiés par leur discriminateur de 8 octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSchema {
    CurveTrade,
    AmmBuy,
    AmmSell,
}

impl EventSchema {
    pub fn discriminator(&self) -> [u8; 8] {
        match self {
            Self::CurveTrade => pump::events::TRADE_EVENT_DISCRIMINATOR,
            Self::AmmBuy => pump::amm::events::BUY_EVENT_DISCRIMINATOR,
            Self::AmmSell => pump::amm::events::SELL_EVENT_DISCRIMINATOR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CurveTrade => "TradeEvent",
            Self::AmmBuy => "BuyEvent",
            Self::AmmSell => "SellEvent",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    CurveTrade(CurveTradeEvent),
    AmmBuy(PumpBuyEvent),
    AmmSell(PumpSellEvent),
}

// --- 3. Le trait de décodage ---

/// Décodage pur (sans I/O) des comptes et des événements.
/// Un échec est un résultat normal : les octets ne correspondent simplement pas au layout.
pub trait LayoutDecoder: Send + Sync {
    fn decode_account(&self, schema: AccountSchema, data: &[u8]) -> Result<AccountRecord>;

    /// `data` contient le discriminateur suivi de la charge utile.
    fn decode_event(&self, data: &[u8], candidates: &[EventSchema]) -> Result<(EventSchema, EventRecord)>;
}

/// Implémentation canonique : layouts pump.fun / pump AMM à offsets fixes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PumpLayoutDecoder;

impl LayoutDecoder for PumpLayoutDecoder {
    fn decode_account(&self, schema: AccountSchema, data: &[u8]) -> Result<AccountRecord> {
        match schema {
            AccountSchema::BondingCurve => {
                pump::bonding_curve::decode_bonding_curve(data).map(AccountRecord::BondingCurve)
            }
        }
    }

    fn decode_event(&self, data: &[u8], candidates: &[EventSchema]) -> Result<(EventSchema, EventRecord)> {
        let Some((tag, payload)) = data.split_first_chunk::<8>() else {
            bail!("Données d'événement trop courtes ({} octets).", data.len());
        };
        let Some(schema) = candidates.iter().copied().find(|s| s.discriminator() == *tag) else {
            bail!("Discriminateur d'événement inconnu : {}", hex::encode(tag));
        };

        let record = match schema {
            EventSchema::CurveTrade => EventRecord::CurveTrade(pump::events::decode_trade_event(payload)?),
            EventSchema::AmmBuy => EventRecord::AmmBuy(pump::amm::events::decode_buy_event(payload)?),
            EventSchema::AmmSell => EventRecord::AmmSell(pump::amm::events::decode_sell_event(payload)?),
        };
        Ok((schema, record))
    }
}

/// Extrait les charges utiles binaires des lignes `Program data: <base64>`.
/// Les lignes illisibles sont ignorées.
pub fn program_data_payloads(logs: &[String]) -> impl Iterator<Item = Vec<u8>> + '_ {
    logs.iter()
        .filter_map(|line| line.strip_prefix(PROGRAM_DATA_PREFIX))
        .filter_map(|encoded| STANDARD.decode(encoded.trim()).ok())
}

/// Construit la ligne de log telle qu'émise on-chain pour une charge utile donnée.
pub fn encode_program_data(data: &[u8]) -> String {
    format!("{PROGRAM_DATA_PREFIX}{}", STANDARD.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_data_lines_are_extracted_and_others_skipped() {
        let logs = vec![
            "Program 6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P invoke [1]".to_string(),
            "Program log: Instruction: Buy".to_string(),
            encode_program_data(&[1, 2, 3]),
            "Program data: ***pas du base64***".to_string(),
        ];
        let payloads: Vec<Vec<u8>> = program_data_payloads(&logs).collect();
        assert_eq!(payloads, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let decoder = PumpLayoutDecoder;
        let data = [9u8; 40];
        assert!(decoder.decode_event(&data, &[EventSchema::CurveTrade]).is_err());
        assert!(decoder.decode_event(&data[..4], &[EventSchema::CurveTrade]).is_err());
    }

    #[test]
    fn tag_outside_candidate_list_is_rejected() {
        let decoder = PumpLayoutDecoder;
        let mut data = EventSchema::AmmBuy.discriminator().to_vec();
        data.extend_from_slice(&[0u8; 400]);
        assert!(decoder.decode_event(&data, &[EventSchema::CurveTrade]).is_err());
    }
}
