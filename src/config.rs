use crate::types::CurveKey;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use solana_sdk::commitment_config::CommitmentConfig;
use std::{str::FromStr, time::Duration};

/// Configuration du processus, lue depuis l'environnement (et un éventuel `.env`).
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub solana_rpc_url: String,
    /// Si absent, dérivé de `solana_rpc_url` (http -> ws).
    #[serde(default)]
    pub solana_ws_url: Option<String>,
    #[serde(default = "default_commitment")]
    pub commitment: String,

    #[serde(default = "default_match_window_slots")]
    pub match_window_slots: u64,
    #[serde(default = "default_match_timeout_ms")]
    pub match_timeout_ms: u64,
    #[serde(default = "default_stale_pending_ms")]
    pub stale_pending_ms: u64,
    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
    #[serde(default = "default_signature_memory")]
    pub signature_memory: usize,

    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u8,
    #[serde(default = "default_rpc_retry_delay_ms")]
    pub rpc_retry_delay_ms: u64,

    /// Liste séparée par des virgules des courbes à suivre (binaire `curve_listener`).
    #[serde(default)]
    pub curve_keys: Vec<String>,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Port de l'endpoint Prometheus ; absent = pas de serveur de métriques.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// "json" (défaut) ou "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_commitment() -> String {
    "processed".to_string()
}
fn default_match_window_slots() -> u64 {
    5
}
fn default_match_timeout_ms() -> u64 {
    2_000
}
fn default_stale_pending_ms() -> u64 {
    10_000
}
fn default_listener_buffer() -> usize {
    256
}
fn default_notification_buffer() -> usize {
    1_024
}
fn default_signature_memory() -> usize {
    512
}
fn default_rpc_max_retries() -> u8 {
    3
}
fn default_rpc_retry_delay_ms() -> u64 {
    250
}
fn default_status_interval_secs() -> u64 {
    60
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()?;
        Ok(config)
    }

    pub fn ws_url(&self) -> String {
        self.solana_ws_url
            .clone()
            .unwrap_or_else(|| self.solana_rpc_url.replacen("http", "ws", 1))
    }

    pub fn commitment_config(&self) -> Result<CommitmentConfig> {
        CommitmentConfig::from_str(&self.commitment)
            .map_err(|_| anyhow!("COMMITMENT invalide : '{}' (processed|confirmed|finalized)", self.commitment))
    }

    pub fn curve_keys(&self) -> Result<Vec<CurveKey>> {
        self.curve_keys
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| {
                raw.parse::<CurveKey>()
                    .with_context(|| format!("Adresse de courbe invalide dans CURVE_KEYS : '{raw}'"))
            })
            .collect()
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            commitment: self.commitment_config()?,
            match_window_slots: self.match_window_slots,
            match_timeout: Duration::from_millis(self.match_timeout_ms),
            stale_after: Duration::from_millis(self.stale_pending_ms),
            signature_memory: self.signature_memory,
            listener_buffer: self.listener_buffer,
            notification_buffer: self.notification_buffer,
        })
    }
}

/// Paramètres du moteur de corrélation.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub commitment: CommitmentConfig,
    /// Écart de slots maximal (inclus) entre un log et un trade provisoire.
    pub match_window_slots: u64,
    /// Délai après lequel un trade provisoire non apparié est émis seul.
    pub match_timeout: Duration,
    /// Âge au-delà duquel le balayage jette un trade provisoire resté en table.
    pub stale_after: Duration,
    /// Nombre de signatures (et de logs déjà émis) retenus par courbe.
    pub signature_memory: usize,
    /// Capacité des canaux créés par `CurveFeed::channel`.
    pub listener_buffer: usize,
    /// Capacité du canal interne de la boucle d'événements.
    pub notification_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            commitment: CommitmentConfig::processed(),
            match_window_slots: default_match_window_slots(),
            match_timeout: Duration::from_millis(default_match_timeout_ms()),
            stale_after: Duration::from_millis(default_stale_pending_ms()),
            signature_memory: default_signature_memory(),
            listener_buffer: default_listener_buffer(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        envy::from_iter::<_, Config>(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[test]
    fn defaults_apply_when_only_rpc_url_is_set() {
        let config = from_pairs(&[("SOLANA_RPC_URL", "https://api.mainnet-beta.solana.com")]);
        assert_eq!(config.ws_url(), "wss://api.mainnet-beta.solana.com");
        let settings = config.engine_settings().unwrap();
        assert_eq!(settings.match_window_slots, 5);
        assert_eq!(settings.match_timeout, Duration::from_secs(2));
        assert_eq!(settings.stale_after, Duration::from_secs(10));
        assert_eq!(settings.commitment, CommitmentConfig::processed());
        assert!(config.curve_keys().unwrap().is_empty());
    }

    #[test]
    fn curve_keys_and_overrides_are_parsed() {
        let key = solana_sdk::pubkey::Pubkey::new_unique().to_string();
        let config = from_pairs(&[
            ("SOLANA_RPC_URL", "http://127.0.0.1:8899"),
            ("SOLANA_WS_URL", "ws://127.0.0.1:8900"),
            ("COMMITMENT", "confirmed"),
            ("MATCH_WINDOW_SLOTS", "3"),
            ("CURVE_KEYS", &key),
        ]);
        assert_eq!(config.ws_url(), "ws://127.0.0.1:8900");
        let settings = config.engine_settings().unwrap();
        assert_eq!(settings.match_window_slots, 3);
        assert_eq!(settings.commitment, CommitmentConfig::confirmed());
        assert_eq!(config.curve_keys().unwrap()[0].to_string(), key);
    }

    #[test]
    fn invalid_commitment_and_key_are_reported() {
        let config = from_pairs(&[
            ("SOLANA_RPC_URL", "http://127.0.0.1:8899"),
            ("COMMITMENT", "instant"),
            ("CURVE_KEYS", "nope"),
        ]);
        assert!(config.engine_settings().is_err());
        assert!(config.curve_keys().is_err());
    }
}
