// DANS : src/rpc/mod.rs

pub mod pubsub_provider;
pub mod resilient_client;
pub mod upstream;

pub use pubsub_provider::SolanaPubsubProvider;
pub use resilient_client::ResilientRpcClient;
pub use upstream::{AccountNotification, LogNotification, UpstreamFeed, UpstreamHandle, UpstreamProvider};
