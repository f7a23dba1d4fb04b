// DANS : src/error.rs

use crate::{subscription::ListenerId, types::CurveKey};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Erreurs renvoyées par l'API publique du flux (`CurveFeed`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("ouverture des abonnements amont impossible pour {key} : {reason}")]
    UpstreamOpen { key: CurveKey, reason: String },

    #[error("le compte {key} appartient au programme {owner}, qui n'est pas pris en charge")]
    UnsupportedProgram { key: CurveKey, owner: Pubkey },

    #[error("l'auditeur {listener} s'est désabonné de {key} avant la fin de l'ouverture")]
    Cancelled { key: CurveKey, listener: ListenerId },

    #[error("le moteur de flux est arrêté")]
    EngineStopped,
}

impl FeedError {
    pub fn upstream_open(key: CurveKey, error: &anyhow::Error) -> Self {
        Self::UpstreamOpen { key, reason: format!("{error:#}") }
    }
}
