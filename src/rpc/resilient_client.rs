use anyhow::{Context, Result};
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::rpc_client::RpcClient,
};
use solana_sdk::{account::Account, commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::warn;

/// Un "wrapper" autour du RpcClient de Solana qui ajoute une logique de
/// ré-essai automatique pour les appels RPC qui échouent à cause d'erreurs réseau temporaires.
#[derive(Clone)]
pub struct ResilientRpcClient {
    client: Arc<RpcClient>,
    max_retries: u8,
    delay_ms: u64,
}

impl ResilientRpcClient {
    /// Construit un nouveau client RPC résilient.
    pub fn new_with_commitment(rpc_url: String, commitment: CommitmentConfig, max_retries: u8, delay_ms: u64) -> Self {
        Self {
            client: Arc::new(RpcClient::new_with_commitment(rpc_url, commitment)),
            max_retries,
            delay_ms,
        }
    }

    /// Détermine si une erreur du client est temporaire et si une nouvelle tentative doit être effectuée.
    fn is_retryable(error: &ClientError) -> bool {
        matches!(
            error.kind,
            ClientErrorKind::Reqwest(_) | ClientErrorKind::RpcError(_) | ClientErrorKind::Io(_)
        )
    }

    /// Récupère un compte complet.
    pub async fn get_account(&self, pubkey: &Pubkey) -> Result<Account> {
        let mut attempt: u8 = 0;
        loop {
            match self.client.get_account(pubkey).await {
                Ok(account) => return Ok(account),
                Err(e) if Self::is_retryable(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(account = %pubkey, attempt, error = %e, "get_account a échoué, nouvelle tentative.");
                    sleep(Duration::from_millis(self.delay_ms)).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Échec final de get_account pour {}", pubkey));
                }
            }
        }
    }

    /// Programme propriétaire d'un compte : sert à choisir le schéma d'événements.
    pub async fn get_account_owner(&self, pubkey: &Pubkey) -> Result<Pubkey> {
        Ok(self.get_account(pubkey).await?.owner)
    }
}
