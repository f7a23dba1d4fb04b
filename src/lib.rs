// src/lib.rs

// On déclare tous nos modules principaux pour les rendre publics et
// utilisables par le binaire (curve_listener.rs) et les tests d'intégration.
pub mod config;
pub mod correlation;
pub mod decoders;
pub mod error;
pub mod monitoring;
pub mod rpc;
pub mod state;
pub mod subscription;
pub mod types;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::FeedError;
pub use subscription::{CurveFeed, CurveStatus, ListenerId, SubscribeOutcome, SubscribeStatus};
pub use types::{CurveKey, ProgramVariant, TradeDirection, TradeEvent};
