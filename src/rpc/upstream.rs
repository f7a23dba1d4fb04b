// DANS : src/rpc/upstream.rs

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::fmt;
use tokio::sync::mpsc;

/// Un changement de compte poussé par le fournisseur amont.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountNotification {
    pub data: Vec<u8>,
    pub lamports: u64,
    pub slot: u64,
}

/// Les logs d'une transaction mentionnant le compte surveillé.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogNotification {
    pub lines: Vec<String>,
    pub slot: u64,
    pub signature: String,
    /// La transaction a échoué : ses événements n'ont jamais eu lieu.
    pub failed: bool,
}

pub type CancelFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Poignée d'annulation d'un abonnement amont.
///
/// `unsubscribe` consomme la poignée : on ne peut se désabonner qu'une fois.
/// La fermeture est demandée au moment de l'appel, le futur retourné ne fait
/// qu'attendre l'acquittement éventuel de la connexion.
pub struct UpstreamHandle {
    label: &'static str,
    cancel: CancelFn,
}

impl UpstreamHandle {
    pub fn new(label: &'static str, cancel: CancelFn) -> Self {
        Self { label, cancel }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn unsubscribe(self) -> BoxFuture<'static, ()> {
        (self.cancel)()
    }
}

impl fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHandle").field("label", &self.label).finish_non_exhaustive()
    }
}

/// Un abonnement ouvert : sa poignée et le canal (un seul consommateur) de ses notifications.
/// Le canal se ferme quand le flux amont s'arrête ou après `unsubscribe`.
#[derive(Debug)]
pub struct UpstreamFeed<T> {
    pub handle: UpstreamHandle,
    pub notifications: mpsc::Receiver<T>,
}

/// Le fournisseur d'abonnements de la chaîne.
#[async_trait]
pub trait UpstreamProvider: Send + Sync + 'static {
    async fn subscribe_account(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<UpstreamFeed<AccountNotification>>;

    async fn subscribe_logs(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<UpstreamFeed<LogNotification>>;

    async fn get_account_owner(&self, address: &Pubkey) -> Result<Pubkey>;
}
