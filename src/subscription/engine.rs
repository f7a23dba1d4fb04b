// DANS : src/subscription/engine.rs

use super::{
    broadcaster,
    listener::{CallbackListener, ListenerId, TradeListener},
    registry::{CurveStatus, OpenResolution, ReleaseOutcome, SubscribeStatus, SubscriptionRegistry, UpstreamLink, Waiter},
};
use crate::{
    config::{Config, EngineSettings},
    correlation::{Correlator, Emission},
    decoders::{LayoutDecoder, PumpLayoutDecoder},
    error::FeedError,
    monitoring::metrics,
    rpc::{
        AccountNotification, LogNotification, ResilientRpcClient, SolanaPubsubProvider, UpstreamFeed,
        UpstreamProvider,
    },
    state::CurveStateTracker,
    types::{CurveKey, ProgramVariant, TradeEvent},
};
use anyhow::Result;
use solana_sdk::commitment_config::CommitmentConfig;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Subscribe { key: CurveKey, waiter: Waiter },
    Unsubscribe { key: CurveKey, listener_id: ListenerId, reply: oneshot::Sender<ReleaseOutcome> },
    Status { key: CurveKey, reply: oneshot::Sender<CurveStatus> },
    StatusAll { reply: oneshot::Sender<Vec<CurveStatus>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Ce qui remonte vers la boucle depuis les tâches d'ouverture et les relais amont.
enum Internal {
    Opened { key: CurveKey, generation: u64, result: Result<OpenedFeeds, FeedError> },
    Account { key: CurveKey, generation: u64, notification: AccountNotification },
    Logs { key: CurveKey, generation: u64, notification: LogNotification },
    Closed { key: CurveKey, generation: u64, stream: &'static str },
}

struct OpenedFeeds {
    variant: ProgramVariant,
    account: UpstreamFeed<AccountNotification>,
    logs: UpstreamFeed<LogNotification>,
}

/// Poignée publique du flux de trades. Clonable ; toutes les copies parlent à la
/// même boucle d'événements.
#[derive(Clone)]
pub struct CurveFeed {
    commands: mpsc::Sender<Command>,
    listener_buffer: usize,
}

impl CurveFeed {
    /// Démarre la boucle d'événements sur le runtime courant.
    pub fn spawn(
        provider: Arc<dyn UpstreamProvider>,
        decoder: Arc<dyn LayoutDecoder>,
        settings: EngineSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(settings.notification_buffer.max(1));

        let engine = EngineLoop {
            provider,
            commitment: settings.commitment,
            registry: SubscriptionRegistry::new(),
            tracker: CurveStateTracker::new(Arc::clone(&decoder)),
            correlator: Correlator::new(decoder, &settings),
            internal_tx,
        };
        tokio::spawn(engine.run(commands_rx, internal_rx));

        Self { commands: commands_tx, listener_buffer: settings.listener_buffer.max(1) }
    }

    /// Branche le flux sur un nœud Solana (RPC + WebSocket) à partir de la configuration.
    pub async fn connect(config: &Config) -> Result<Self> {
        let settings = config.engine_settings()?;
        let rpc = ResilientRpcClient::new_with_commitment(
            config.solana_rpc_url.clone(),
            settings.commitment,
            config.rpc_max_retries,
            config.rpc_retry_delay_ms,
        );
        let provider = SolanaPubsubProvider::connect(&config.ws_url(), rpc, settings.notification_buffer).await?;
        Ok(Self::spawn(Arc::new(provider), Arc::new(PumpLayoutDecoder), settings))
    }

    /// Inscrit un auditeur sur une courbe. Le premier auditeur d'une clé ouvre la
    /// paire d'abonnements amont ; les suivants la partagent.
    pub async fn subscribe(
        &self,
        key: CurveKey,
        listener_id: ListenerId,
        listener: Arc<dyn TradeListener>,
    ) -> Result<SubscribeStatus, FeedError> {
        let (reply, status) = oneshot::channel();
        let waiter = Waiter { listener_id, listener, reply };
        self.commands
            .send(Command::Subscribe { key, waiter })
            .await
            .map_err(|_| FeedError::EngineStopped)?;
        status.await.map_err(|_| FeedError::EngineStopped)?
    }

    /// Inscription via un canal borné. Un récepteur qui ne suit pas est désinscrit.
    pub async fn channel(
        &self,
        key: CurveKey,
    ) -> Result<(ListenerId, SubscribeStatus, mpsc::Receiver<TradeEvent>), FeedError> {
        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let listener_id = ListenerId::next();
        let status = self.subscribe(key, listener_id, Arc::new(tx)).await?;
        Ok((listener_id, status, rx))
    }

    /// Inscrit une closure appelée pour chaque événement de la courbe, dans l'ordre d'arrivée.
    pub async fn on_event<F>(&self, key: CurveKey, callback: F) -> Result<(ListenerId, SubscribeStatus), FeedError>
    where
        F: Fn(&CurveKey, &TradeEvent) + Send + Sync + 'static,
    {
        let listener_id = ListenerId::next();
        let status = self.subscribe(key, listener_id, Arc::new(CallbackListener::new(callback))).await?;
        Ok((listener_id, status))
    }

    /// Désinscrit un auditeur. Sans effet si l'auditeur ou la clé sont inconnus,
    /// ou si le moteur est déjà arrêté.
    pub async fn unsubscribe(&self, key: CurveKey, listener_id: ListenerId) {
        let (reply, outcome) = oneshot::channel();
        if self.commands.send(Command::Unsubscribe { key, listener_id, reply }).await.is_err() {
            debug!(curve = %key, listener = %listener_id, "Moteur arrêté, désabonnement ignoré.");
            return;
        }
        if let Ok(outcome) = outcome.await {
            trace!(curve = %key, listener = %listener_id, ?outcome, "Désabonnement traité.");
        }
    }

    pub async fn status(&self, key: CurveKey) -> Result<CurveStatus, FeedError> {
        let (reply, status) = oneshot::channel();
        self.commands.send(Command::Status { key, reply }).await.map_err(|_| FeedError::EngineStopped)?;
        status.await.map_err(|_| FeedError::EngineStopped)
    }

    /// État de toutes les courbes connues, triées par clé.
    pub async fn statuses(&self) -> Result<Vec<CurveStatus>, FeedError> {
        let (reply, statuses) = oneshot::channel();
        self.commands.send(Command::StatusAll { reply }).await.map_err(|_| FeedError::EngineStopped)?;
        statuses.await.map_err(|_| FeedError::EngineStopped)
    }

    /// Ferme tous les abonnements amont et arrête la boucle. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Propriétaire unique de tout l'état mutable : registre, instantanés, trades en attente et timers.
struct EngineLoop {
    provider: Arc<dyn UpstreamProvider>,
    commitment: CommitmentConfig,
    registry: SubscriptionRegistry,
    tracker: CurveStateTracker,
    correlator: Correlator,
    internal_tx: mpsc::Sender<Internal>,
}

impl EngineLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut internal: mpsc::Receiver<Internal>) {
        info!("Boucle du flux de courbes démarrée.");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                emission = self.correlator.next_expired() => self.dispatch(emission),
            }
        }
        info!("Boucle du flux de courbes arrêtée.");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { key, waiter } => {
                if let Some(generation) = self.registry.acquire(key, waiter) {
                    self.spawn_open(key, generation);
                }
            }
            Command::Unsubscribe { key, listener_id, reply } => {
                let outcome = self.registry.release(&key, listener_id);
                if outcome == ReleaseOutcome::TornDown {
                    self.forget_curve(&key);
                }
                let _ = reply.send(outcome);
            }
            Command::Status { key, reply } => {
                let _ = reply.send(self.curve_status(&key));
            }
            Command::StatusAll { reply } => {
                let statuses = self.registry.keys().iter().map(|key| self.curve_status(key)).collect();
                let _ = reply.send(statuses);
            }
            // Traité directement par `run`.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Opened { key, generation, result } => {
                if let Err(e) = &result {
                    warn!(curve = %key, error = %e, "Ouverture amont échouée.");
                }
                let link = result.map(|feeds| self.link(key, generation, feeds));
                match self.registry.complete_open(key, generation, link) {
                    OpenResolution::Registered { listeners } => {
                        info!(curve = %key, generation, listeners, "Abonnement amont ouvert.");
                    }
                    OpenResolution::Abandoned => {
                        info!(curve = %key, "Plus d'auditeur à l'ouverture, abonnement amont refermé.");
                    }
                    OpenResolution::Failed => {}
                    OpenResolution::Stale => debug!(curve = %key, generation, "Ouverture périmée refermée."),
                }
            }
            Internal::Account { key, generation, notification } => {
                let Some(entry) = self.registry.active(&key, generation) else {
                    return;
                };
                if !entry.variant().correlates_account_deltas() {
                    trace!(curve = %key, slot = notification.slot, "Compte pump AMM : pas d'inférence par delta.");
                    return;
                }
                self.correlator.sweep_stale(&key);
                if let Some(trade) = self.tracker.on_account_notification(
                    &key,
                    &notification.data,
                    notification.lamports,
                    notification.slot,
                ) {
                    self.correlator.track(key, trade);
                }
            }
            Internal::Logs { key, generation, notification } => {
                let Some(variant) = self.registry.active(&key, generation).map(|entry| entry.variant()) else {
                    return;
                };
                for emission in self.correlator.on_log_notification(key, variant, &notification) {
                    self.dispatch(emission);
                }
            }
            Internal::Closed { key, generation, stream } => {
                if self.registry.mark_closed(&key, generation) {
                    metrics::UPSTREAM_STREAMS_CLOSED.inc();
                    warn!(curve = %key, stream, "Flux amont interrompu, abonnement marqué inactif.");
                    self.forget_curve(&key);
                }
            }
        }
    }

    fn dispatch(&mut self, emission: Emission) {
        let Emission { key, event, origin } = emission;
        let Some(entry) = self.registry.open_entry_mut(&key) else {
            debug!(curve = %key, "Événement sans abonnement, ignoré.");
            return;
        };
        metrics::EVENTS_EMITTED.with_label_values(&[origin.as_str()]).inc();
        let report = broadcaster::broadcast(entry, &event);
        if !report.dropped.is_empty() && self.registry.remove_if_empty(&key) {
            self.forget_curve(&key);
        }
    }

    fn curve_status(&self, key: &CurveKey) -> CurveStatus {
        let mut status = self.registry.status(key);
        status.pending_trades = self.correlator.pending_count(key);
        status
    }

    fn forget_curve(&mut self, key: &CurveKey) {
        self.tracker.forget(key);
        self.correlator.forget(key);
    }

    fn shutdown(&mut self) {
        let keys = self.registry.drain();
        for key in &keys {
            self.forget_curve(key);
        }
        info!(curves = keys.len(), "Tous les abonnements amont sont fermés.");
    }

    /// Lance l'ouverture amont hors de la boucle ; le résultat revient en `Internal::Opened`.
    fn spawn_open(&self, key: CurveKey, generation: u64) {
        let provider = Arc::clone(&self.provider);
        let internal = self.internal_tx.clone();
        let commitment = self.commitment;

        tokio::spawn(async move {
            let result = open_upstream(provider.as_ref(), key, commitment).await;
            let opened = Internal::Opened { key, generation, result };
            // Boucle arrêtée entre-temps : on referme ce qui vient d'être ouvert.
            if let Err(mpsc::error::SendError(Internal::Opened { result: Ok(feeds), .. })) = internal.send(opened).await {
                feeds.account.handle.unsubscribe().await;
                feeds.logs.handle.unsubscribe().await;
            }
        });
    }

    fn link(&self, key: CurveKey, generation: u64, feeds: OpenedFeeds) -> UpstreamLink {
        let OpenedFeeds { variant, account, logs } = feeds;
        let forwarders = vec![
            spawn_forwarder(account.notifications, self.internal_tx.clone(), key, generation, "account", move |n| {
                Internal::Account { key, generation, notification: n }
            }),
            spawn_forwarder(logs.notifications, self.internal_tx.clone(), key, generation, "logs", move |n| {
                Internal::Logs { key, generation, notification: n }
            }),
        ];
        UpstreamLink { variant, handles: vec![account.handle, logs.handle], forwarders }
    }
}

/// Propriétaire → variant, puis compte, puis logs. Tout ou rien : si les logs
/// échouent, l'abonnement au compte déjà ouvert est annulé.
async fn open_upstream(
    provider: &dyn UpstreamProvider,
    key: CurveKey,
    commitment: CommitmentConfig,
) -> Result<OpenedFeeds, FeedError> {
    let address = key.pubkey();
    let owner = provider
        .get_account_owner(&address)
        .await
        .map_err(|e| FeedError::upstream_open(key, &e))?;
    let variant = ProgramVariant::from_owner(&owner).ok_or(FeedError::UnsupportedProgram { key, owner })?;
    debug!(curve = %key, ?variant, "Variant de programme détecté.");

    let account = provider
        .subscribe_account(&address, commitment)
        .await
        .map_err(|e| FeedError::upstream_open(key, &e))?;
    let logs = match provider.subscribe_logs(&address, commitment).await {
        Ok(logs) => logs,
        Err(e) => {
            account.handle.unsubscribe().await;
            return Err(FeedError::upstream_open(key, &e));
        }
    };
    Ok(OpenedFeeds { variant, account, logs })
}

/// Relaie un flux amont vers la boucle ; signale sa fermeture par `Internal::Closed`.
fn spawn_forwarder<T, F>(
    mut notifications: mpsc::Receiver<T>,
    internal: mpsc::Sender<Internal>,
    key: CurveKey,
    generation: u64,
    stream: &'static str,
    wrap: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Internal + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            if internal.send(wrap(notification)).await.is_err() {
                return;
            }
        }
        let _ = internal.send(Internal::Closed { key, generation, stream }).await;
    })
}
