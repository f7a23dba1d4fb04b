// DANS : src/types.rs

use crate::decoders::pump::{PUMP_FUN_PROGRAM_ID, amm::PUMP_AMM_PROGRAM_ID};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use solana_sdk::pubkey::{ParsePubkeyError, Pubkey};
use std::{fmt, str::FromStr};

pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Convertit un montant en lamports vers des SOL.
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

/// Identité du compte "courbe" surveillé (bonding curve pump.fun ou pool pump AMM).
/// Sérialisée comme son adresse base58.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurveKey(Pubkey);

impl CurveKey {
    pub fn new(address: Pubkey) -> Self {
        Self(address)
    }

    pub fn pubkey(&self) -> Pubkey {
        self.0
    }
}

impl From<Pubkey> for CurveKey {
    fn from(address: Pubkey) -> Self {
        Self(address)
    }
}

impl FromStr for CurveKey {
    type Err = ParsePubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pubkey::from_str(s.trim()).map(Self)
    }
}

impl fmt::Display for CurveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for CurveKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CurveKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy { Self::Buy } else { Self::Sell }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schéma d'événements utilisé par le programme propriétaire de la courbe.
/// Déterminé une seule fois, à l'ouverture de l'abonnement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramVariant {
    /// pump.fun : un seul `TradeEvent` avec le drapeau `is_buy`, corrélé aux deltas de réserves.
    BondingCurve,
    /// pump AMM : `BuyEvent` / `SellEvent` déjà rattachés à un pool, émis directement.
    PumpAmm,
}

impl ProgramVariant {
    pub fn from_owner(owner: &Pubkey) -> Option<Self> {
        match *owner {
            id if id == PUMP_FUN_PROGRAM_ID => Some(Self::BondingCurve),
            id if id == PUMP_AMM_PROGRAM_ID => Some(Self::PumpAmm),
            _ => None,
        }
    }

    /// Les deltas de réserves ne sont exploités que pour la bonding curve.
    pub fn correlates_account_deltas(&self) -> bool {
        matches!(self, Self::BondingCurve)
    }
}

/// L'événement final, seul objet à traverser la frontière vers les auditeurs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    #[serde(rename = "type")]
    pub direction: TradeDirection,
    pub amount_sol: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trader_identity: Option<String>,
    pub slot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_amount_delta: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_event_serializes_with_wire_names() {
        let event = TradeEvent {
            direction: TradeDirection::Buy,
            amount_sol: 0.5,
            signature: Some("sig".into()),
            trader_identity: None,
            slot: 42,
            token_amount_delta: Some("1000".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "buy");
        assert_eq!(json["amountSol"], 0.5);
        assert_eq!(json["signature"], "sig");
        assert_eq!(json["tokenAmountDelta"], "1000");
        assert!(json.get("traderIdentity").is_none());
    }

    #[test]
    fn curve_key_round_trips_through_base58() {
        let key = CurveKey::new(Pubkey::new_unique());
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        let back: CurveKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!("pas-une-adresse".parse::<CurveKey>().is_err());
    }

    #[test]
    fn variant_is_selected_from_owner_program() {
        assert_eq!(ProgramVariant::from_owner(&PUMP_FUN_PROGRAM_ID), Some(ProgramVariant::BondingCurve));
        assert_eq!(ProgramVariant::from_owner(&PUMP_AMM_PROGRAM_ID), Some(ProgramVariant::PumpAmm));
        assert_eq!(ProgramVariant::from_owner(&Pubkey::new_unique()), None);
    }
}
