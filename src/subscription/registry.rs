// DANS : src/subscription/registry.rs

use super::listener::{ListenerId, TradeListener};
use crate::{
    error::FeedError,
    monitoring::{metrics, variant_label},
    rpc::UpstreamHandle,
    types::{CurveKey, ProgramVariant},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info};

pub type StatusReply = oneshot::Sender<Result<SubscribeStatus, FeedError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeOutcome {
    /// Premier auditeur : l'abonnement amont vient d'être ouvert.
    Created,
    /// L'abonnement existait déjà.
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeStatus {
    pub outcome: SubscribeOutcome,
    pub listener_count: usize,
    pub event_count: u64,
}

/// Vue d'introspection d'une courbe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurveStatus {
    pub key: CurveKey,
    pub subscribed: bool,
    pub event_count: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub program_variant: Option<ProgramVariant>,
    pub listener_count: usize,
    pub pending_trades: usize,
}

impl CurveStatus {
    pub fn unknown(key: CurveKey) -> Self {
        Self {
            key,
            subscribed: false,
            event_count: 0,
            last_event_time: None,
            program_variant: None,
            listener_count: 0,
            pending_trades: 0,
        }
    }
}

/// Un abonné qui attend (ou déclenche) l'ouverture amont.
pub struct Waiter {
    pub listener_id: ListenerId,
    pub listener: Arc<dyn TradeListener>,
    pub reply: StatusReply,
}

/// Les deux abonnements amont d'une courbe et les tâches qui relaient leurs notifications.
pub struct UpstreamLink {
    pub variant: ProgramVariant,
    pub handles: Vec<UpstreamHandle>,
    pub forwarders: Vec<JoinHandle<()>>,
}

impl UpstreamLink {
    /// Demande la fermeture de chaque abonnement et arrête les relais.
    pub fn close(self) {
        for handle in self.handles {
            let label = handle.label();
            debug!(stream = label, "Désabonnement amont.");
            tokio::spawn(handle.unsubscribe());
        }
        for forwarder in self.forwarders {
            forwarder.abort();
        }
    }
}

pub struct SubscriptionEntry {
    key: CurveKey,
    variant: ProgramVariant,
    generation: u64,
    upstream: Option<UpstreamLink>,
    pub(crate) listeners: BTreeMap<ListenerId, Arc<dyn TradeListener>>,
    pub(crate) event_count: u64,
    pub(crate) last_event_time: Option<DateTime<Utc>>,
}

impl SubscriptionEntry {
    pub(crate) fn new(key: CurveKey, variant: ProgramVariant, generation: u64) -> Self {
        Self {
            key,
            variant,
            generation,
            upstream: None,
            listeners: BTreeMap::new(),
            event_count: 0,
            last_event_time: None,
        }
    }

    pub fn key(&self) -> CurveKey {
        self.key
    }

    pub fn variant(&self) -> ProgramVariant {
        self.variant
    }

    pub fn subscribed(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn attach(&mut self, link: UpstreamLink) {
        self.variant = link.variant;
        metrics::ACTIVE_SUBSCRIPTIONS.with_label_values(&[variant_label(link.variant)]).inc();
        self.upstream = Some(link);
    }

    /// Ferme l'amont s'il est ouvert. `true` si une paire d'abonnements a été fermée.
    pub fn close_upstream(&mut self) -> bool {
        let Some(link) = self.upstream.take() else {
            return false;
        };
        metrics::ACTIVE_SUBSCRIPTIONS.with_label_values(&[variant_label(self.variant)]).dec();
        link.close();
        true
    }

    fn status(&self, outcome: SubscribeOutcome) -> SubscribeStatus {
        SubscribeStatus { outcome, listener_count: self.listeners.len(), event_count: self.event_count }
    }

    fn curve_status(&self) -> CurveStatus {
        CurveStatus {
            key: self.key,
            subscribed: self.subscribed(),
            event_count: self.event_count,
            last_event_time: self.last_event_time,
            program_variant: Some(self.variant),
            listener_count: self.listeners.len(),
            pending_trades: 0,
        }
    }
}

struct OpeningEntry {
    generation: u64,
    waiters: Vec<Waiter>,
    /// Entrée dégradée (flux amont coupé) en cours de réouverture, avec ses auditeurs.
    carried: Option<SubscriptionEntry>,
}

enum Slot {
    Opening(OpeningEntry),
    Open(SubscriptionEntry),
}

/// Issue d'une ouverture amont rendue au registre.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenResolution {
    Registered { listeners: usize },
    /// Plus aucun auditeur à l'arrivée : l'amont a été refermé aussitôt.
    Abandoned,
    Failed,
    /// Ouverture d'une génération périmée, ignorée.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Clé ou auditeur inconnu : rien à faire.
    NotFound,
    Remaining(usize),
    /// Dernier auditeur parti : l'entrée est supprimée et l'amont fermé.
    TornDown,
}

/// Table des abonnements par courbe : au plus une entrée (et une paire
/// d'abonnements amont) par clé. Sans I/O ; la boucle d'événements exécute les ouvertures.
#[derive(Default)]
pub struct SubscriptionRegistry {
    slots: HashMap<CurveKey, Slot>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Ajoute un auditeur. Retourne la génération à ouvrir quand une ouverture amont
    /// doit être lancée (transition 0→1 ou réouverture d'une entrée dégradée).
    /// Dans les autres cas la réponse est envoyée ici, ou à la fin de l'ouverture en cours.
    pub fn acquire(&mut self, key: CurveKey, waiter: Waiter) -> Option<u64> {
        match self.slots.remove(&key) {
            Some(Slot::Open(mut entry)) if entry.subscribed() => {
                entry.listeners.insert(waiter.listener_id, waiter.listener);
                let _ = waiter.reply.send(Ok(entry.status(SubscribeOutcome::Joined)));
                self.slots.insert(key, Slot::Open(entry));
                None
            }
            Some(Slot::Open(degraded)) => {
                info!(curve = %key, listeners = degraded.listener_count(), "Réouverture d'un abonnement dégradé.");
                let generation = self.bump_generation();
                self.slots.insert(
                    key,
                    Slot::Opening(OpeningEntry { generation, waiters: vec![waiter], carried: Some(degraded) }),
                );
                Some(generation)
            }
            Some(Slot::Opening(mut opening)) => {
                opening.waiters.push(waiter);
                self.slots.insert(key, Slot::Opening(opening));
                None
            }
            None => {
                let generation = self.bump_generation();
                self.slots
                    .insert(key, Slot::Opening(OpeningEntry { generation, waiters: vec![waiter], carried: None }));
                Some(generation)
            }
        }
    }

    /// Enregistre le résultat d'une ouverture amont et répond aux abonnés en attente.
    pub fn complete_open(
        &mut self,
        key: CurveKey,
        generation: u64,
        result: Result<UpstreamLink, FeedError>,
    ) -> OpenResolution {
        let opening = match self.slots.remove(&key) {
            Some(Slot::Opening(opening)) if opening.generation == generation => opening,
            other => {
                if let Some(slot) = other {
                    self.slots.insert(key, slot);
                }
                if let Ok(link) = result {
                    link.close();
                }
                return OpenResolution::Stale;
            }
        };

        let link = match result {
            Ok(link) => link,
            Err(error) => {
                metrics::UPSTREAM_OPEN_FAILURES.inc();
                for waiter in opening.waiters {
                    let _ = waiter.reply.send(Err(error.clone()));
                }
                // Les auditeurs d'une entrée dégradée restent inscrits ; un prochain
                // abonnement retentera l'ouverture.
                if let Some(carried) = opening.carried.filter(|e| e.listener_count() > 0) {
                    self.slots.insert(key, Slot::Open(carried));
                }
                return OpenResolution::Failed;
            }
        };

        let mut entry = opening
            .carried
            .unwrap_or_else(|| SubscriptionEntry::new(key, link.variant, generation));
        entry.generation = generation;
        let mut created = entry.listeners.is_empty();

        for waiter in opening.waiters {
            if waiter.reply.is_closed() {
                continue;
            }
            entry.listeners.insert(waiter.listener_id, waiter.listener);
            let outcome = if created { SubscribeOutcome::Created } else { SubscribeOutcome::Joined };
            if waiter.reply.send(Ok(entry.status(outcome))).is_err() {
                entry.listeners.remove(&waiter.listener_id);
                continue;
            }
            created = false;
        }

        if entry.listeners.is_empty() {
            link.close();
            return OpenResolution::Abandoned;
        }

        entry.attach(link);
        let listeners = entry.listener_count();
        self.slots.insert(key, Slot::Open(entry));
        OpenResolution::Registered { listeners }
    }

    /// Retire un auditeur. Idempotent.
    pub fn release(&mut self, key: &CurveKey, listener_id: ListenerId) -> ReleaseOutcome {
        match self.slots.get_mut(key) {
            None => ReleaseOutcome::NotFound,
            Some(Slot::Opening(opening)) => {
                let mut found = false;
                if let Some(index) = opening.waiters.iter().position(|w| w.listener_id == listener_id) {
                    let waiter = opening.waiters.remove(index);
                    let _ = waiter.reply.send(Err(FeedError::Cancelled { key: *key, listener: listener_id }));
                    found = true;
                }
                if let Some(carried) = opening.carried.as_mut() {
                    found |= carried.listeners.remove(&listener_id).is_some();
                }
                if !found {
                    return ReleaseOutcome::NotFound;
                }
                // L'ouverture en cours sera abandonnée à son arrivée s'il ne reste personne.
                let remaining =
                    opening.waiters.len() + opening.carried.as_ref().map_or(0, SubscriptionEntry::listener_count);
                ReleaseOutcome::Remaining(remaining)
            }
            Some(Slot::Open(entry)) => {
                if entry.listeners.remove(&listener_id).is_none() {
                    return ReleaseOutcome::NotFound;
                }
                if !entry.listeners.is_empty() {
                    return ReleaseOutcome::Remaining(entry.listeners.len());
                }
                self.tear_down(key);
                ReleaseOutcome::TornDown
            }
        }
    }

    /// Supprime une entrée ouverte qui n'a plus d'auditeurs (après des échecs de livraison).
    pub fn remove_if_empty(&mut self, key: &CurveKey) -> bool {
        match self.slots.get(key) {
            Some(Slot::Open(entry)) if entry.listeners.is_empty() => {
                self.tear_down(key);
                true
            }
            _ => false,
        }
    }

    fn tear_down(&mut self, key: &CurveKey) {
        if let Some(Slot::Open(mut entry)) = self.slots.remove(key) {
            entry.close_upstream();
            info!(curve = %key, events = entry.event_count, "Dernier auditeur parti, abonnement supprimé.");
        }
    }

    /// Flux amont interrompu : l'entrée reste (auditeurs compris) mais passe en
    /// `subscribed: false`. `true` si l'entrée de cette génération était active.
    pub fn mark_closed(&mut self, key: &CurveKey, generation: u64) -> bool {
        match self.slots.get_mut(key) {
            Some(Slot::Open(entry)) if entry.generation == generation => entry.close_upstream(),
            _ => false,
        }
    }

    /// L'entrée active de cette génération, si elle existe encore.
    pub fn active(&self, key: &CurveKey, generation: u64) -> Option<&SubscriptionEntry> {
        match self.slots.get(key) {
            Some(Slot::Open(entry)) if entry.generation == generation && entry.subscribed() => Some(entry),
            _ => None,
        }
    }

    pub fn open_entry_mut(&mut self, key: &CurveKey) -> Option<&mut SubscriptionEntry> {
        match self.slots.get_mut(key) {
            Some(Slot::Open(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn status(&self, key: &CurveKey) -> CurveStatus {
        match self.slots.get(key) {
            Some(Slot::Open(entry)) => entry.curve_status(),
            Some(Slot::Opening(opening)) => match &opening.carried {
                Some(carried) => carried.curve_status(),
                None => CurveStatus::unknown(*key),
            },
            None => CurveStatus::unknown(*key),
        }
    }

    pub fn keys(&self) -> Vec<CurveKey> {
        let mut keys: Vec<CurveKey> = self.slots.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Nombre de paires d'abonnements amont ouvertes.
    pub fn open_upstreams(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Open(entry) if entry.subscribed()))
            .count()
    }

    /// Ferme tout (arrêt du moteur). Retourne les clés supprimées.
    pub fn drain(&mut self) -> Vec<CurveKey> {
        let mut keys = Vec::with_capacity(self.slots.len());
        for (key, slot) in self.slots.drain() {
            match slot {
                Slot::Open(mut entry) => {
                    entry.close_upstream();
                }
                Slot::Opening(opening) => {
                    for waiter in opening.waiters {
                        let _ = waiter.reply.send(Err(FeedError::EngineStopped));
                    }
                }
            }
            keys.push(key);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeEvent;
    use futures_util::FutureExt;
    use solana_sdk::pubkey::Pubkey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn waiter(id: u64) -> (Waiter, oneshot::Receiver<Result<SubscribeStatus, FeedError>>) {
        let (tx, _rx) = mpsc::channel::<TradeEvent>(4);
        let (reply, status) = oneshot::channel();
        (Waiter { listener_id: ListenerId::new(id), listener: Arc::new(tx), reply }, status)
    }

    fn link(cancels: &Arc<AtomicUsize>) -> UpstreamLink {
        let handles = ["account", "logs"]
            .into_iter()
            .map(|label| {
                let cancels = Arc::clone(cancels);
                UpstreamHandle::new(
                    label,
                    Box::new(move || {
                        cancels.fetch_add(1, Ordering::SeqCst);
                        async {}.boxed()
                    }),
                )
            })
            .collect();
        UpstreamLink { variant: ProgramVariant::BondingCurve, handles, forwarders: Vec::new() }
    }

    #[tokio::test]
    async fn first_waiter_creates_and_later_ones_join() {
        let key = CurveKey::new(Pubkey::new_unique());
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut registry = SubscriptionRegistry::new();

        let (w1, r1) = waiter(1);
        let (w2, r2) = waiter(2);
        let generation = registry.acquire(key, w1).unwrap();
        assert_eq!(registry.acquire(key, w2), None);

        let resolution = registry.complete_open(key, generation, Ok(link(&cancels)));
        assert_eq!(resolution, OpenResolution::Registered { listeners: 2 });
        assert_eq!(r1.await.unwrap().unwrap().outcome, SubscribeOutcome::Created);
        assert_eq!(r2.await.unwrap().unwrap().outcome, SubscribeOutcome::Joined);

        let (w3, r3) = waiter(3);
        assert_eq!(registry.acquire(key, w3), None);
        let status = r3.await.unwrap().unwrap();
        assert_eq!(status.outcome, SubscribeOutcome::Joined);
        assert_eq!(status.listener_count, 3);
        assert_eq!(registry.open_upstreams(), 1);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_tears_down_on_last() {
        let key = CurveKey::new(Pubkey::new_unique());
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut registry = SubscriptionRegistry::new();
        let (w1, _r1) = waiter(1);
        let (w2, _r2) = waiter(2);
        let generation = registry.acquire(key, w1).unwrap();
        registry.acquire(key, w2);
        registry.complete_open(key, generation, Ok(link(&cancels)));

        assert_eq!(registry.release(&key, ListenerId::new(1)), ReleaseOutcome::Remaining(1));
        assert_eq!(registry.release(&key, ListenerId::new(1)), ReleaseOutcome::NotFound);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        assert_eq!(registry.release(&key, ListenerId::new(2)), ReleaseOutcome::TornDown);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert_eq!(registry.release(&key, ListenerId::new(2)), ReleaseOutcome::NotFound);
        assert_eq!(registry.release(&CurveKey::new(Pubkey::new_unique()), ListenerId::new(9)), ReleaseOutcome::NotFound);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert!(registry.keys().is_empty());
    }

    #[tokio::test]
    async fn failed_open_leaves_nothing_behind() {
        let key = CurveKey::new(Pubkey::new_unique());
        let mut registry = SubscriptionRegistry::new();
        let (w1, r1) = waiter(1);
        let generation = registry.acquire(key, w1).unwrap();

        let error = FeedError::UpstreamOpen { key, reason: "refusé".into() };
        assert_eq!(registry.complete_open(key, generation, Err(error.clone())), OpenResolution::Failed);
        assert_eq!(r1.await.unwrap(), Err(error));
        assert!(registry.keys().is_empty());
        assert!(!registry.status(&key).subscribed);
    }

    #[tokio::test]
    async fn open_without_remaining_waiters_is_closed_at_once() {
        let key = CurveKey::new(Pubkey::new_unique());
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut registry = SubscriptionRegistry::new();
        let (w1, r1) = waiter(1);
        let generation = registry.acquire(key, w1).unwrap();

        assert_eq!(registry.release(&key, ListenerId::new(1)), ReleaseOutcome::Remaining(0));
        assert!(matches!(r1.await.unwrap(), Err(FeedError::Cancelled { .. })));

        assert_eq!(registry.complete_open(key, generation, Ok(link(&cancels))), OpenResolution::Abandoned);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert!(registry.keys().is_empty());
    }

    #[tokio::test]
    async fn closed_stream_degrades_then_reopens_with_listeners() {
        let key = CurveKey::new(Pubkey::new_unique());
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut registry = SubscriptionRegistry::new();
        let (w1, _r1) = waiter(1);
        let first = registry.acquire(key, w1).unwrap();
        registry.complete_open(key, first, Ok(link(&cancels)));

        assert!(registry.mark_closed(&key, first));
        assert!(!registry.mark_closed(&key, first));
        let status = registry.status(&key);
        assert!(!status.subscribed);
        assert_eq!(status.listener_count, 1);
        assert!(registry.active(&key, first).is_none());

        let (w2, r2) = waiter(2);
        let second = registry.acquire(key, w2).unwrap();
        assert!(second > first);
        registry.complete_open(key, second, Ok(link(&cancels)));
        let status = r2.await.unwrap().unwrap();
        assert_eq!(status.outcome, SubscribeOutcome::Joined);
        assert_eq!(status.listener_count, 2);
        assert!(registry.active(&key, second).is_some());

        // Une ouverture périmée est refermée sans toucher à l'entrée.
        let before = cancels.load(Ordering::SeqCst);
        assert_eq!(registry.complete_open(key, first, Ok(link(&cancels))), OpenResolution::Stale);
        assert_eq!(cancels.load(Ordering::SeqCst), before + 2);
        assert!(registry.status(&key).subscribed);
    }

    #[test]
    fn unknown_key_status_is_empty() {
        let key = CurveKey::new(Pubkey::new_unique());
        let status = SubscriptionRegistry::new().status(&key);
        assert_eq!(status, CurveStatus::unknown(key));
    }
}
