// DANS : src/subscription/listener.rs

use crate::types::{CurveKey, TradeEvent};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identité d'un auditeur pour une courbe (un client de la couche transport).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Identifiant unique dans le processus.
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("file de l'auditeur pleine")]
    Full,
    #[error("auditeur déconnecté")]
    Closed,
    #[error("la closure de l'auditeur a paniqué")]
    Panicked,
}

/// Destination d'un événement final.
///
/// La livraison est synchrone et ne doit jamais bloquer : elle tourne dans la
/// boucle d'événements. Une erreur vaut déconnexion de l'auditeur.
pub trait TradeListener: Send + Sync + 'static {
    fn deliver(&self, key: &CurveKey, event: &TradeEvent) -> Result<(), DeliveryError>;
}

/// Un canal borné : un auditeur trop lent (file pleine) est traité comme déconnecté.
impl TradeListener for mpsc::Sender<TradeEvent> {
    fn deliver(&self, _key: &CurveKey, event: &TradeEvent) -> Result<(), DeliveryError> {
        self.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Adapte une closure en auditeur (enregistrement `on_event`).
pub struct CallbackListener<F>(F);

impl<F> CallbackListener<F>
where
    F: Fn(&CurveKey, &TradeEvent) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> TradeListener for CallbackListener<F>
where
    F: Fn(&CurveKey, &TradeEvent) + Send + Sync + 'static,
{
    /// Une panique de la closure reste confinée à cet auditeur, qui sera retiré.
    fn deliver(&self, key: &CurveKey, event: &TradeEvent) -> Result<(), DeliveryError> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(key, event))).map_err(|_| DeliveryError::Panicked)
    }
}
