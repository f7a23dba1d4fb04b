// DANS : src/state/inference.rs

use super::ReserveSnapshot;
use crate::types::{TradeDirection, lamports_to_sol};

/// Résultat de la politique d'inférence pour deux instantanés consécutifs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferredTrade {
    pub direction: TradeDirection,
    /// |delta SOL| en lamports.
    pub sol_lamports: u64,
    /// |delta tokens| en unités de base.
    pub token_amount_delta: u64,
}

impl InferredTrade {
    pub fn amount_sol(&self) -> f64 {
        lamports_to_sol(self.sol_lamports)
    }
}

/// Le sens du trade vient uniquement du couple de signes (delta SOL, delta tokens).
///
/// - SOL entrant et tokens sortants : achat.
/// - SOL sortant et tokens entrants : vente.
/// - Tout le reste (deltas nuls, signes mixtes comme une migration) : pas un trade.
pub fn infer_trade(prev: &ReserveSnapshot, next: &ReserveSnapshot) -> Option<InferredTrade> {
    let sol_delta = i128::from(next.sol_reserves) - i128::from(prev.sol_reserves);
    let token_delta = i128::from(prev.token_reserves) - i128::from(next.token_reserves);

    let direction = match (sol_delta.signum(), token_delta.signum()) {
        (1, 1) => TradeDirection::Buy,
        (-1, -1) => TradeDirection::Sell,
        _ => return None,
    };

    // Les deux deltas tiennent dans un u64 : ce sont des différences de deux u64.
    Some(InferredTrade {
        direction,
        sol_lamports: sol_delta.unsigned_abs() as u64,
        token_amount_delta: token_delta.unsigned_abs() as u64,
    })
}
