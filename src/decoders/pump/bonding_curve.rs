// DANS : src/decoders/pump/bonding_curve.rs

use anyhow::{Result, anyhow, bail};
use bytemuck::{Pod, Zeroable};
use solana_sdk::pubkey::Pubkey;

const BONDING_CURVE_SEED: &[u8] = b"bonding-curve";

// Trouvé dans l'IDL pump.fun : sha256("account:BondingCurve")[..8]
pub const BONDING_CURVE_ACCOUNT_DISCRIMINATOR: [u8; 8] = [23, 183, 248, 55, 96, 216, 172, 96];

// --- MODULE POUR LES STRUCTURES ON-CHAIN ---
pub mod onchain_layouts {
    use super::*;

    /// Partie fixe du compte, présente dans toutes les versions du programme.
    #[repr(C, packed)]
    #[derive(Clone, Copy, Pod, Zeroable, Debug)]
    pub struct BondingCurveHeader {
        pub virtual_token_reserves: u64,
        pub virtual_sol_reserves: u64,
        pub real_token_reserves: u64,
        pub real_sol_reserves: u64,
        pub token_total_supply: u64,
        pub complete: u8,
    }
}

const HEADER_LEN: usize = std::mem::size_of::<onchain_layouts::BondingCurveHeader>();

/// Taille minimale lisible : discriminateur + en-tête fixe.
pub const MIN_ACCOUNT_LEN: usize = 8 + HEADER_LEN;

// Champs ajoutés par les versions récentes du programme, lus s'ils sont présents.
const CREATOR_OFFSET: usize = MIN_ACCOUNT_LEN;
const MAYHEM_MODE_OFFSET: usize = CREATOR_OFFSET + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondingCurveAccount {
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
    /// `Pubkey::default()` pour les comptes créés avant l'ajout du champ.
    pub creator: Pubkey,
    pub mayhem_mode: bool,
}

/// Adresse (PDA) de la bonding curve d'un mint.
pub fn bonding_curve_address(mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[BONDING_CURVE_SEED, mint.as_ref()], &super::PUMP_FUN_PROGRAM_ID).0
}

/// Décode les données brutes d'un compte BondingCurve pump.fun.
pub fn decode_bonding_curve(data: &[u8]) -> Result<BondingCurveAccount> {
    if data.len() < MIN_ACCOUNT_LEN {
        bail!("BondingCurve trop court : {} octets (minimum {}).", data.len(), MIN_ACCOUNT_LEN);
    }
    if data[..8] != BONDING_CURVE_ACCOUNT_DISCRIMINATOR {
        bail!("Invalid discriminator. Not a pump.fun BondingCurve account.");
    }

    let header: &onchain_layouts::BondingCurveHeader = bytemuck::try_from_bytes(&data[8..MIN_ACCOUNT_LEN])
        .map_err(|e| anyhow!("Layout BondingCurve illisible : {e:?}"))?;

    let creator = data
        .get(CREATOR_OFFSET..MAYHEM_MODE_OFFSET)
        .and_then(|bytes| Pubkey::try_from(bytes).ok())
        .unwrap_or_default();
    let mayhem_mode = data.get(MAYHEM_MODE_OFFSET).is_some_and(|flag| *flag != 0);

    Ok(BondingCurveAccount {
        virtual_token_reserves: header.virtual_token_reserves,
        virtual_sol_reserves: header.virtual_sol_reserves,
        real_token_reserves: header.real_token_reserves,
        real_sol_reserves: header.real_sol_reserves,
        token_total_supply: header.token_total_supply,
        complete: header.complete != 0,
        creator,
        mayhem_mode,
    })
}

/// Sérialise un compte dans le layout on-chain complet (utilisé par les fixtures de test).
pub fn encode_bonding_curve(account: &BondingCurveAccount) -> Vec<u8> {
    let header = onchain_layouts::BondingCurveHeader {
        virtual_token_reserves: account.virtual_token_reserves,
        virtual_sol_reserves: account.virtual_sol_reserves,
        real_token_reserves: account.real_token_reserves,
        real_sol_reserves: account.real_sol_reserves,
        token_total_supply: account.token_total_supply,
        complete: u8::from(account.complete),
    };

    let mut data = Vec::with_capacity(MAYHEM_MODE_OFFSET + 1);
    data.extend_from_slice(&BONDING_CURVE_ACCOUNT_DISCRIMINATOR);
    data.extend_from_slice(bytemuck::bytes_of(&header));
    data.extend_from_slice(account.creator.as_ref());
    data.push(u8::from(account.mayhem_mode));
    data
}
