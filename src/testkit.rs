// DANS : src/testkit.rs
//
// Outils de test partagés : un fournisseur amont scripté en mémoire et des
// fixtures (comptes bonding curve, lignes de logs). Disponible pour les tests
// unitaires (`cfg(test)`) et d'intégration (feature `testkit`).

use crate::{
    decoders::{
        BondingCurveAccount, CurveTradeEvent, PumpBuyEvent, PumpSellEvent, encode_program_data,
        pump::{
            PUMP_FUN_PROGRAM_ID,
            amm::{
                PUMP_AMM_PROGRAM_ID,
                events::{encode_buy_event, encode_sell_event},
            },
            bonding_curve::{bonding_curve_address, encode_bonding_curve},
            events::encode_trade_event,
        },
    },
    rpc::{AccountNotification, LogNotification, UpstreamFeed, UpstreamHandle, UpstreamProvider},
    types::CurveKey,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::FutureExt;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;

// --- Fournisseur scripté ---

#[derive(Default)]
struct Script {
    owners: HashMap<Pubkey, Pubkey>,
    account_feeds: HashMap<Pubkey, mpsc::Sender<AccountNotification>>,
    log_feeds: HashMap<Pubkey, mpsc::Sender<LogNotification>>,
    failing_accounts: HashSet<Pubkey>,
    failing_logs: HashSet<Pubkey>,
    open_delay: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    account_subscribes: AtomicUsize,
    account_unsubscribes: AtomicUsize,
    log_subscribes: AtomicUsize,
    log_unsubscribes: AtomicUsize,
}

/// `UpstreamProvider` en mémoire : les tests poussent les notifications à la main
/// et comptent les (dés)abonnements.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, address: &Pubkey, program: &Pubkey) {
        self.script.lock().unwrap().owners.insert(*address, *program);
    }

    /// Déclare une bonding curve pump.fun pour `mint` et retourne sa clé.
    pub fn add_bonding_curve(&self, mint: &Pubkey) -> CurveKey {
        let key = pump_curve_key(mint);
        self.set_owner(&key.pubkey(), &PUMP_FUN_PROGRAM_ID);
        key
    }

    /// Déclare un pool pump AMM et retourne sa clé.
    pub fn add_amm_pool(&self, pool: &Pubkey) -> CurveKey {
        self.set_owner(pool, &PUMP_AMM_PROGRAM_ID);
        CurveKey::new(*pool)
    }

    pub fn fail_account_subscribe(&self, address: &Pubkey, fail: bool) {
        let mut script = self.script.lock().unwrap();
        if fail {
            script.failing_accounts.insert(*address);
        } else {
            script.failing_accounts.remove(address);
        }
    }

    pub fn fail_logs_subscribe(&self, address: &Pubkey, fail: bool) {
        let mut script = self.script.lock().unwrap();
        if fail {
            script.failing_logs.insert(*address);
        } else {
            script.failing_logs.remove(address);
        }
    }

    /// Retarde chaque ouverture (pour provoquer des abonnements concurrents).
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.script.lock().unwrap().open_delay = delay;
    }

    /// Pousse une notification de compte. `false` si aucun abonnement n'est ouvert.
    pub async fn push_account(&self, address: &Pubkey, notification: AccountNotification) -> bool {
        let sender = self.script.lock().unwrap().account_feeds.get(address).cloned();
        match sender {
            Some(sender) => sender.send(notification).await.is_ok(),
            None => false,
        }
    }

    /// Pousse une notification de logs. `false` si aucun abonnement n'est ouvert.
    pub async fn push_logs(&self, address: &Pubkey, notification: LogNotification) -> bool {
        let sender = self.script.lock().unwrap().log_feeds.get(address).cloned();
        match sender {
            Some(sender) => sender.send(notification).await.is_ok(),
            None => false,
        }
    }

    /// Simule une coupure de la connexion : les deux flux de `address` se ferment.
    pub fn drop_streams(&self, address: &Pubkey) {
        let mut script = self.script.lock().unwrap();
        script.account_feeds.remove(address);
        script.log_feeds.remove(address);
    }

    pub fn account_subscribes(&self) -> usize {
        self.counters.account_subscribes.load(Ordering::SeqCst)
    }

    pub fn account_unsubscribes(&self) -> usize {
        self.counters.account_unsubscribes.load(Ordering::SeqCst)
    }

    pub fn log_subscribes(&self) -> usize {
        self.counters.log_subscribes.load(Ordering::SeqCst)
    }

    pub fn log_unsubscribes(&self) -> usize {
        self.counters.log_unsubscribes.load(Ordering::SeqCst)
    }

    /// Abonnements (compte + logs) actuellement ouverts.
    pub fn open_subscriptions(&self) -> usize {
        self.account_subscribes() + self.log_subscribes() - self.account_unsubscribes() - self.log_unsubscribes()
    }

    async fn delay(&self) {
        let delay = self.script.lock().unwrap().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Le désabonnement compte immédiatement et ferme le canal, si c'est toujours le sien.
fn scripted_handle<T: Send + 'static>(
    label: &'static str,
    unsubscribes: Arc<Counters>,
    script: Arc<Mutex<Script>>,
    address: Pubkey,
    sender: mpsc::WeakSender<T>,
    select: fn(&mut Script) -> &mut HashMap<Pubkey, mpsc::Sender<T>>,
    counter: fn(&Counters) -> &AtomicUsize,
) -> UpstreamHandle {
    UpstreamHandle::new(
        label,
        Box::new(move || {
            counter(&unsubscribes).fetch_add(1, Ordering::SeqCst);
            let mut script = script.lock().unwrap();
            let feeds = select(&mut script);
            let ours = sender.upgrade();
            if feeds.get(&address).zip(ours.as_ref()).is_some_and(|(current, ours)| current.same_channel(ours)) {
                feeds.remove(&address);
            }
            async {}.boxed()
        }),
    )
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    async fn subscribe_account(
        &self,
        address: &Pubkey,
        _commitment: CommitmentConfig,
    ) -> Result<UpstreamFeed<AccountNotification>> {
        self.delay().await;
        let (tx, rx) = mpsc::channel(64);
        {
            let mut script = self.script.lock().unwrap();
            if script.failing_accounts.contains(address) {
                return Err(anyhow!("accountSubscribe refusé (scripté)"));
            }
            script.account_feeds.insert(*address, tx.clone());
        }
        self.counters.account_subscribes.fetch_add(1, Ordering::SeqCst);
        let handle = scripted_handle(
            "account",
            Arc::clone(&self.counters),
            Arc::clone(&self.script),
            *address,
            tx.downgrade(),
            |script| &mut script.account_feeds,
            |counters| &counters.account_unsubscribes,
        );
        Ok(UpstreamFeed { handle, notifications: rx })
    }

    async fn subscribe_logs(
        &self,
        address: &Pubkey,
        _commitment: CommitmentConfig,
    ) -> Result<UpstreamFeed<LogNotification>> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut script = self.script.lock().unwrap();
            if script.failing_logs.contains(address) {
                return Err(anyhow!("logsSubscribe refusé (scripté)"));
            }
            script.log_feeds.insert(*address, tx.clone());
        }
        self.counters.log_subscribes.fetch_add(1, Ordering::SeqCst);
        let handle = scripted_handle(
            "logs",
            Arc::clone(&self.counters),
            Arc::clone(&self.script),
            *address,
            tx.downgrade(),
            |script| &mut script.log_feeds,
            |counters| &counters.log_unsubscribes,
        );
        Ok(UpstreamFeed { handle, notifications: rx })
    }

    async fn get_account_owner(&self, address: &Pubkey) -> Result<Pubkey> {
        self.script
            .lock()
            .unwrap()
            .owners
            .get(address)
            .copied()
            .ok_or_else(|| anyhow!("AccountNotFound: {address}"))
    }
}

// --- Fixtures ---

pub fn pump_curve_key(mint: &Pubkey) -> CurveKey {
    CurveKey::new(bonding_curve_address(mint))
}

/// Données brutes d'un compte bonding curve avec ces réserves virtuelles.
pub fn curve_account_data(sol_reserves: u64, token_reserves: u64) -> Vec<u8> {
    encode_bonding_curve(&BondingCurveAccount {
        virtual_token_reserves: token_reserves,
        virtual_sol_reserves: sol_reserves,
        real_token_reserves: token_reserves,
        real_sol_reserves: sol_reserves,
        token_total_supply: 1_000_000_000_000_000,
        complete: false,
        creator: Pubkey::default(),
        mayhem_mode: false,
    })
}

pub fn account_notification(sol_reserves: u64, token_reserves: u64, slot: u64) -> AccountNotification {
    AccountNotification { data: curve_account_data(sol_reserves, token_reserves), lamports: 1_461_600, slot }
}

fn log_lines(program: &Pubkey, instruction: &str, payload: &[u8]) -> Vec<String> {
    vec![
        format!("Program {program} invoke [1]"),
        format!("Program log: Instruction: {instruction}"),
        encode_program_data(payload),
        format!("Program {program} success"),
    ]
}

/// Logs d'une transaction pump.fun contenant un `TradeEvent`.
pub fn curve_trade_log(
    mint: &Pubkey,
    is_buy: bool,
    sol_amount: u64,
    token_amount: u64,
    user: &Pubkey,
    signature: &str,
    slot: u64,
) -> LogNotification {
    let event = CurveTradeEvent { mint: *mint, sol_amount, token_amount, is_buy, user: *user, ..Default::default() };
    let instruction = if is_buy { "Buy" } else { "Sell" };
    LogNotification {
        lines: log_lines(&PUMP_FUN_PROGRAM_ID, instruction, &encode_trade_event(&event)),
        slot,
        signature: signature.to_string(),
        failed: false,
    }
}

pub fn amm_buy_log(pool: &Pubkey, quote_in: u64, base_out: u64, user: &Pubkey, signature: &str, slot: u64) -> LogNotification {
    let event = PumpBuyEvent {
        pool: *pool,
        user: *user,
        quote_amount_in: quote_in,
        base_amount_out: base_out,
        ..Default::default()
    };
    LogNotification {
        lines: log_lines(&PUMP_AMM_PROGRAM_ID, "Buy", &encode_buy_event(&event)),
        slot,
        signature: signature.to_string(),
        failed: false,
    }
}

pub fn amm_sell_log(pool: &Pubkey, quote_out: u64, base_in: u64, user: &Pubkey, signature: &str, slot: u64) -> LogNotification {
    let event = PumpSellEvent {
        pool: *pool,
        user: *user,
        quote_amount_out: quote_out,
        base_amount_in: base_in,
        ..Default::default()
    };
    LogNotification {
        lines: log_lines(&PUMP_AMM_PROGRAM_ID, "Sell", &encode_sell_event(&event)),
        slot,
        signature: signature.to_string(),
        failed: false,
    }
}

/// Logs dont la charge utile ne correspond à aucun événement connu.
pub fn garbage_log(signature: &str, slot: u64) -> LogNotification {
    let mut payload = vec![0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3];
    payload.extend_from_slice(&[42u8; 64]);
    LogNotification {
        lines: vec![
            "Program log: Instruction: Buy".to_string(),
            encode_program_data(&payload),
            "Program data: %%%".to_string(),
        ],
        slot,
        signature: signature.to_string(),
        failed: false,
    }
}
