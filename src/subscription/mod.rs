// DANS : src/subscription/mod.rs

pub mod broadcaster;
pub mod engine;
pub mod listener;
pub mod registry;

pub use engine::CurveFeed;
pub use listener::{CallbackListener, DeliveryError, ListenerId, TradeListener};
pub use registry::{CurveStatus, SubscribeOutcome, SubscribeStatus, SubscriptionRegistry};
