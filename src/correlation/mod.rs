// DANS : src/correlation/mod.rs

pub mod correlator;
pub mod log_events;
pub mod pending;

pub use correlator::{Correlator, Emission, EventOrigin};
pub use log_events::{LogTradeEvent, decode_log_trades};
