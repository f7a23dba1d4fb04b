// DANS : src/decoders/pump/amm/mod.rs

use solana_sdk::pubkey::Pubkey;

pub mod events;

// --- CONSTANTES DU PROTOCOLE ---
pub const PUMP_AMM_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA");
