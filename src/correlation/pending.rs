// DANS : src/correlation/pending.rs

use crate::{state::ProvisionalTrade, types::TradeDirection};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::time::Instant;
use tokio_util::time::delay_queue;

/// Un trade provisoire en table, avec la clé de son timer d'expiration.
#[derive(Debug)]
pub struct PendingTrade {
    pub id: u64,
    pub trade: ProvisionalTrade,
    pub timer: delay_queue::Key,
}

/// Trace d'un événement de log déjà émis seul, faute de trade provisoire.
#[derive(Debug, Clone, Copy)]
struct SurfacedLog {
    direction: TradeDirection,
    slot: u64,
    at: Instant,
}

/// État de corrélation d'une courbe : trades en attente indexés par slot,
/// signatures déjà vues et logs émis sans appariement.
#[derive(Debug, Default)]
pub struct PendingBook {
    by_slot: BTreeMap<u64, Vec<PendingTrade>>,
    slot_of: HashMap<u64, u64>,
    seen_signatures: HashSet<String>,
    signature_order: VecDeque<String>,
    surfaced: VecDeque<SurfacedLog>,
}

impl PendingBook {
    pub fn insert(&mut self, pending: PendingTrade) {
        self.slot_of.insert(pending.id, pending.trade.slot);
        self.by_slot.entry(pending.trade.slot).or_default().push(pending);
    }

    pub fn len(&self) -> usize {
        self.slot_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_of.is_empty()
    }

    /// Retire le trade `id`. `None` s'il a déjà quitté la table.
    pub fn take(&mut self, id: u64) -> Option<PendingTrade> {
        let slot = self.slot_of.remove(&id)?;
        let bucket = self.by_slot.get_mut(&slot)?;
        let index = bucket.iter().position(|p| p.id == id)?;
        let pending = bucket.remove(index);
        if bucket.is_empty() {
            self.by_slot.remove(&slot);
        }
        Some(pending)
    }

    /// Retire le meilleur candidat dans `[slot - window, slot + window]`.
    ///
    /// Préférence : même sens que le log, puis slot le plus proche, puis le plus ancien.
    pub fn take_match(&mut self, slot: u64, window: u64, direction: TradeDirection) -> Option<PendingTrade> {
        let range = slot.saturating_sub(window)..=slot.saturating_add(window);
        let best = self
            .by_slot
            .range(range)
            .flat_map(|(_, bucket)| bucket.iter())
            .min_by_key(|p| (p.trade.direction != direction, p.trade.slot.abs_diff(slot), p.id))
            .map(|p| p.id)?;
        self.take(best)
    }

    /// Retire tous les trades créés avant `cutoff`.
    pub fn drain_older_than(&mut self, cutoff: Instant) -> Vec<PendingTrade> {
        let stale: Vec<u64> = self
            .by_slot
            .values()
            .flatten()
            .filter(|p| p.trade.created_at < cutoff)
            .map(|p| p.id)
            .collect();
        stale.into_iter().filter_map(|id| self.take(id)).collect()
    }

    pub fn drain_all(&mut self) -> Vec<PendingTrade> {
        self.slot_of.clear();
        std::mem::take(&mut self.by_slot).into_values().flatten().collect()
    }

    /// `false` si la signature a déjà été vue. La mémoire est bornée à `capacity`.
    pub fn record_signature(&mut self, signature: &str, capacity: usize) -> bool {
        if self.seen_signatures.contains(signature) {
            return false;
        }
        self.seen_signatures.insert(signature.to_string());
        self.signature_order.push_back(signature.to_string());
        while self.signature_order.len() > capacity.max(1) {
            if let Some(oldest) = self.signature_order.pop_front() {
                self.seen_signatures.remove(&oldest);
            }
        }
        true
    }

    pub fn remember_surfaced(&mut self, direction: TradeDirection, slot: u64, at: Instant, capacity: usize) {
        self.surfaced.push_back(SurfacedLog { direction, slot, at });
        while self.surfaced.len() > capacity.max(1) {
            self.surfaced.pop_front();
        }
    }

    /// Consomme un log déjà émis qui décrit le même trade que celui que l'on vient
    /// de déduire (même sens, slot dans la fenêtre, plus récent que `not_before`).
    pub fn claim_surfaced(
        &mut self,
        direction: TradeDirection,
        slot: u64,
        window: u64,
        not_before: Option<Instant>,
    ) -> bool {
        self.surfaced.retain(|s| not_before.is_none_or(|bound| s.at >= bound));
        let Some(index) = self
            .surfaced
            .iter()
            .position(|s| s.direction == direction && s.slot.abs_diff(slot) <= window)
        else {
            return false;
        };
        self.surfaced.remove(index);
        true
    }
}
