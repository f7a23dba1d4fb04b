pub mod logging;
pub mod metrics;

use crate::types::ProgramVariant;

/// Retourne une chaîne statique représentant le variant de programme.
/// Utile pour les labels Prometheus.
pub fn variant_label(variant: ProgramVariant) -> &'static str {
    match variant {
        ProgramVariant::BondingCurve => "bonding_curve",
        ProgramVariant::PumpAmm => "pump_amm",
    }
}
