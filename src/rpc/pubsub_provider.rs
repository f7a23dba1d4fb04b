// DANS : src/rpc/pubsub_provider.rs

use super::{
    ResilientRpcClient,
    upstream::{AccountNotification, LogNotification, UpstreamFeed, UpstreamHandle, UpstreamProvider},
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::{FutureExt, StreamExt};
use solana_account_decoder::{UiAccountData, UiAccountEncoding};
use solana_client::{
    nonblocking::pubsub_client::PubsubClient,
    rpc_config::{RpcAccountInfoConfig, RpcTransactionLogsConfig, RpcTransactionLogsFilter},
};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Fournisseur amont branché sur le WebSocket PubSub d'un nœud Solana.
///
/// Chaque abonnement tourne dans sa propre tâche qui pousse les notifications
/// dans un canal borné ; la tâche se termine sur annulation, sur fin du flux
/// WebSocket, ou quand plus personne ne lit le canal.
pub struct SolanaPubsubProvider {
    pubsub: Arc<PubsubClient>,
    rpc: ResilientRpcClient,
    channel_capacity: usize,
}

impl SolanaPubsubProvider {
    pub async fn connect(ws_url: &str, rpc: ResilientRpcClient, channel_capacity: usize) -> Result<Self> {
        let pubsub = PubsubClient::new(ws_url)
            .await
            .with_context(|| format!("Connexion WebSocket impossible vers {ws_url}"))?;
        Ok(Self::new(Arc::new(pubsub), rpc, channel_capacity))
    }

    pub fn new(pubsub: Arc<PubsubClient>, rpc: ResilientRpcClient, channel_capacity: usize) -> Self {
        Self { pubsub, rpc, channel_capacity: channel_capacity.max(1) }
    }
}

/// Construit la poignée qui réveille la tâche d'abonnement.
/// Tolère une tâche déjà terminée (connexion perdue).
fn cancel_handle(label: &'static str, cancel_tx: oneshot::Sender<()>) -> UpstreamHandle {
    UpstreamHandle::new(
        label,
        Box::new(move || {
            let _ = cancel_tx.send(());
            async {}.boxed()
        }),
    )
}

fn decode_ui_account_data(data: &UiAccountData) -> Option<Vec<u8>> {
    match data {
        UiAccountData::Binary(encoded, UiAccountEncoding::Base64) => STANDARD.decode(encoded).ok(),
        UiAccountData::Binary(encoded, UiAccountEncoding::Base58) | UiAccountData::LegacyBinary(encoded) => {
            bs58::decode(encoded).into_vec().ok()
        }
        _ => None,
    }
}

#[async_trait]
impl UpstreamProvider for SolanaPubsubProvider {
    async fn subscribe_account(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<UpstreamFeed<AccountNotification>> {
        let config = RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(commitment),
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let pubsub = Arc::clone(&self.pubsub);
        let address = *address;

        tokio::spawn(async move {
            let (mut stream, unsubscribe) = match pubsub.account_subscribe(&address, Some(config)).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow!(e)));
                    return;
                }
            };
            if ready_tx.send(Ok(())).is_err() {
                drop(stream);
                unsubscribe().await;
                return;
            }

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    update = stream.next() => {
                        let Some(response) = update else {
                            warn!(account = %address, "Le flux accountSubscribe s'est terminé.");
                            break;
                        };
                        let Some(data) = decode_ui_account_data(&response.value.data) else {
                            debug!(account = %address, "Encodage de compte inattendu, notification ignorée.");
                            continue;
                        };
                        let notification = AccountNotification {
                            data,
                            lamports: response.value.lamports,
                            slot: response.context.slot,
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                }
            }
            drop(stream);
            unsubscribe().await;
        });

        ready_rx
            .await
            .context("La tâche d'abonnement au compte s'est arrêtée avant l'ouverture")?
            .with_context(|| format!("accountSubscribe refusé pour {address}"))?;

        Ok(UpstreamFeed { handle: cancel_handle("account", cancel_tx), notifications: rx })
    }

    async fn subscribe_logs(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<UpstreamFeed<LogNotification>> {
        let filter = RpcTransactionLogsFilter::Mentions(vec![address.to_string()]);
        let config = RpcTransactionLogsConfig { commitment: Some(commitment) };
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let pubsub = Arc::clone(&self.pubsub);
        let address = *address;

        tokio::spawn(async move {
            let (mut stream, unsubscribe) = match pubsub.logs_subscribe(filter, config).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow!(e)));
                    return;
                }
            };
            if ready_tx.send(Ok(())).is_err() {
                drop(stream);
                unsubscribe().await;
                return;
            }

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    update = stream.next() => {
                        let Some(response) = update else {
                            warn!(account = %address, "Le flux logsSubscribe s'est terminé.");
                            break;
                        };
                        let notification = LogNotification {
                            lines: response.value.logs,
                            slot: response.context.slot,
                            signature: response.value.signature,
                            failed: response.value.err.is_some(),
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                }
            }
            drop(stream);
            unsubscribe().await;
        });

        ready_rx
            .await
            .context("La tâche d'abonnement aux logs s'est arrêtée avant l'ouverture")?
            .with_context(|| format!("logsSubscribe refusé pour {address}"))?;

        Ok(UpstreamFeed { handle: cancel_handle("logs", cancel_tx), notifications: rx })
    }

    async fn get_account_owner(&self, address: &Pubkey) -> Result<Pubkey> {
        self.rpc.get_account_owner(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_data_encodings_are_decoded() {
        let raw = vec![1u8, 2, 3, 250];
        let b64 = UiAccountData::Binary(STANDARD.encode(&raw), UiAccountEncoding::Base64);
        let b58 = UiAccountData::LegacyBinary(bs58::encode(&raw).into_string());
        assert_eq!(decode_ui_account_data(&b64), Some(raw.clone()));
        assert_eq!(decode_ui_account_data(&b58), Some(raw));
    }

    #[tokio::test]
    async fn cancel_handle_tolerates_finished_task() {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        drop(cancel_rx);
        cancel_handle("account", cancel_tx).unsubscribe().await;
    }
}
