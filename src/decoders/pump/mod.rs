// DANS : src/decoders/pump/mod.rs

use solana_sdk::pubkey::Pubkey;

pub mod amm;
pub mod bonding_curve;
pub mod events;

/// Programme pump.fun (bonding curves).
pub const PUMP_FUN_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P");
