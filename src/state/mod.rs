// DANS : src/state/mod.rs

pub mod curve_tracker;
pub mod inference;

pub use curve_tracker::CurveStateTracker;
pub use inference::{InferredTrade, infer_trade};

use crate::{decoders::BondingCurveAccount, types::TradeDirection};
use solana_sdk::pubkey::Pubkey;
use tokio::time::Instant;

/// Vue figée des réserves d'une courbe, issue d'une notification de compte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveSnapshot {
    pub sol_reserves: u64,
    pub token_reserves: u64,
    pub total_supply: u64,
    pub complete: bool,
    pub creator: Pubkey,
    pub mayhem_mode: bool,
    pub lamports: u64,
    pub slot: u64,
}

impl ReserveSnapshot {
    /// Les réserves virtuelles sont celles qui fixent le prix de la courbe.
    pub fn from_account(account: &BondingCurveAccount, lamports: u64, slot: u64) -> Self {
        Self {
            sol_reserves: account.virtual_sol_reserves,
            token_reserves: account.virtual_token_reserves,
            total_supply: account.token_total_supply,
            complete: account.complete,
            creator: account.creator,
            mayhem_mode: account.mayhem_mode,
            lamports,
            slot,
        }
    }
}

/// Trade déduit d'un delta de réserves, en attente d'enrichissement par un log.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionalTrade {
    pub direction: TradeDirection,
    pub amount_sol: f64,
    pub token_amount_delta: u64,
    pub slot: u64,
    pub created_at: Instant,
}
