use alloy_primitives::Address;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::{PaymentRequirement, TokenAmount};
use x402_treasurer_types::timestamp::UnixTimestamp;

use super::{LedgerDecision, LedgerError, Reservation, ReservationId, SpendLedger};
use crate::treasurer::DenialReason;

#[cfg(feature = "telemetry")]
use tracing::{debug, instrument};

/// A spend ceiling, either absolute or per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendLimit {
    pub ceiling: TokenAmount,
    /// Length of the window committed spend is counted over. `None` never resets.
    pub window: Option<Duration>,
}

impl SpendLimit {
    pub fn ceiling(ceiling: impl Into<TokenAmount>) -> Self {
        Self {
            ceiling: ceiling.into(),
            window: None,
        }
    }

    pub fn per_window(ceiling: impl Into<TokenAmount>, window: Duration) -> Self {
        Self {
            ceiling: ceiling.into(),
            window: Some(window),
        }
    }
}

/// Point-in-time view of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountSnapshot {
    pub committed: TokenAmount,
    pub reserved: TokenAmount,
    pub outstanding_reservations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AccountKey {
    payer: Address,
    network: String,
    asset: String,
}

impl AccountKey {
    fn new(payer: Address, network: &Network, asset: &str) -> Self {
        Self {
            payer,
            network: network.canonical(),
            asset: asset.to_ascii_lowercase(),
        }
    }
}

#[derive(Debug)]
struct Pending {
    amount: TokenAmount,
    expires: Instant,
}

#[derive(Debug, Default)]
struct Account {
    window_started: Option<Instant>,
    committed: TokenAmount,
    pending: HashMap<ReservationId, Pending>,
}

impl Account {
    fn reserved(&self) -> Option<TokenAmount> {
        self.pending
            .values()
            .try_fold(TokenAmount::ZERO, |acc, p| acc.checked_add(p.amount))
    }

    fn roll_window(&mut self, window: Option<Duration>, now: Instant) {
        let Some(window) = window else { return };
        match self.window_started {
            Some(started) if now.duration_since(started) < window => {}
            _ => {
                self.window_started = Some(now);
                self.committed = TokenAmount::ZERO;
            }
        }
    }

    fn expire(&mut self, now: Instant) -> Vec<ReservationId> {
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }

    /// Nothing reserved and nothing committed in the current window.
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.committed == TokenAmount::ZERO
    }
}

/// In-process ledger.
///
/// Each account sits behind its own mutex, held only for the synchronous
/// check-and-reserve, so unrelated payers never wait on each other and no lock
/// is held across an await. Create one per process and share it through an `Arc`.
///
/// Idle accounts are dropped every so often, so memory follows the set of payers
/// with live reservations or spend in their current window.
#[derive(Debug)]
pub struct LocalLedger {
    default_limit: SpendLimit,
    asset_limits: HashMap<(String, String), SpendLimit>,
    reservation_ttl: Duration,
    accounts: DashMap<AccountKey, Arc<Mutex<Account>>>,
    reservations: DashMap<ReservationId, AccountKey>,
    reserves: AtomicU64,
}

fn lock(account: &Mutex<Account>) -> MutexGuard<'_, Account> {
    account.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalLedger {
    pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60);
    /// Every this many reservations, idle accounts are dropped.
    const PRUNE_EVERY: u64 = 256;

    pub fn new(default_limit: SpendLimit) -> Self {
        Self {
            default_limit,
            asset_limits: HashMap::new(),
            reservation_ttl: Self::DEFAULT_RESERVATION_TTL,
            accounts: DashMap::new(),
            reservations: DashMap::new(),
            reserves: AtomicU64::new(0),
        }
    }

    /// Overrides the limit for one asset on one network.
    pub fn with_asset_limit(mut self, network: &Network, asset: &str, limit: SpendLimit) -> Self {
        self.asset_limits
            .insert((network.canonical(), asset.to_ascii_lowercase()), limit);
        self
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    fn limit_for(&self, key: &AccountKey) -> SpendLimit {
        self.asset_limits
            .get(&(key.network.clone(), key.asset.clone()))
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn account(&self, key: &AccountKey) -> Arc<Mutex<Account>> {
        // Clone the Arc so the DashMap shard is not locked while the account is.
        self.accounts.entry(key.clone()).or_default().value().clone()
    }

    /// Expires stale reservations and forgets accounts left idle.
    ///
    /// An account is only dropped when no task holds it, so a reservation can
    /// never land in an account that is no longer in the map.
    pub fn prune(&self) {
        let now = Instant::now();
        self.accounts.retain(|key, account| {
            if Arc::strong_count(account) > 1 {
                return true;
            }
            let mut account = lock(account);
            for id in account.expire(now) {
                self.reservations.remove(&id);
            }
            account.roll_window(self.limit_for(key).window, now);
            !account.is_idle()
        });
    }

    /// Number of `(payer, network, asset)` accounts currently tracked.
    pub fn tracked_accounts(&self) -> usize {
        self.accounts.len()
    }

    pub fn snapshot(&self, payer: Address, network: &Network, asset: &str) -> AccountSnapshot {
        let key = AccountKey::new(payer, network, asset);
        let Some(account) = self.accounts.get(&key).map(|a| a.value().clone()) else {
            return AccountSnapshot::default();
        };
        let mut account = lock(&account);
        let now = Instant::now();
        for id in account.expire(now) {
            self.reservations.remove(&id);
        }
        account.roll_window(self.limit_for(&key).window, now);
        AccountSnapshot {
            committed: account.committed,
            reserved: account.reserved().unwrap_or(TokenAmount(alloy_primitives::U256::MAX)),
            outstanding_reservations: account.pending.len(),
        }
    }
}

#[async_trait::async_trait]
impl SpendLedger for LocalLedger {
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.ledger.reserve", skip_all, fields(payer = %payer, amount = %requirement.amount))
    )]
    async fn check_and_reserve(
        &self,
        payer: Address,
        requirement: &PaymentRequirement,
    ) -> Result<LedgerDecision, LedgerError> {
        if self.reserves.fetch_add(1, Ordering::Relaxed) % Self::PRUNE_EVERY == 0 {
            self.prune();
        }
        let key = AccountKey::new(payer, &requirement.network, &requirement.asset);
        let limit = self.limit_for(&key);
        let account = self.account(&key);
        let mut account = lock(&account);

        let now = Instant::now();
        for id in account.expire(now) {
            self.reservations.remove(&id);
        }
        account.roll_window(limit.window, now);

        let total = account
            .reserved()
            .and_then(|reserved| reserved.checked_add(account.committed))
            .and_then(|spent| spent.checked_add(requirement.amount));
        match total {
            Some(total) if total <= limit.ceiling => {}
            _ => {
                #[cfg(feature = "telemetry")]
                debug!(ceiling = %limit.ceiling, committed = %account.committed, "Spend limit reached");
                return Ok(LedgerDecision::Denied(DenialReason::AmountExceedsLimit));
            }
        }

        let id = ReservationId::random();
        account.pending.insert(
            id.clone(),
            Pending {
                amount: requirement.amount,
                expires: now + self.reservation_ttl,
            },
        );
        self.reservations.insert(id.clone(), key);
        Ok(LedgerDecision::Reserved(Reservation {
            id,
            payer,
            network: requirement.network.clone(),
            asset: requirement.asset.clone(),
            amount: requirement.amount,
            expires_at: Some(UnixTimestamp::now() + self.reservation_ttl),
        }))
    }

    async fn confirm(&self, id: &ReservationId) -> Result<(), LedgerError> {
        let Some((_, key)) = self.reservations.remove(id) else {
            return Err(LedgerError::UnknownReservation(id.clone()));
        };
        let account = self.account(&key);
        let mut account = lock(&account);
        let pending = account
            .pending
            .remove(id)
            .ok_or_else(|| LedgerError::UnknownReservation(id.clone()))?;
        account.committed = account
            .committed
            .checked_add(pending.amount)
            .unwrap_or(TokenAmount(alloy_primitives::U256::MAX));
        Ok(())
    }

    async fn release(&self, id: &ReservationId) -> Result<(), LedgerError> {
        if let Some((_, key)) = self.reservations.remove(id) {
            let account = self.account(&key);
            lock(&account).pending.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYER: Address = Address::repeat_byte(0x11);

    fn req(amount: u64) -> PaymentRequirement {
        PaymentRequirement::new("exact", "base-sepolia", "0xA", "USDC", amount)
    }

    fn reserved(decision: LedgerDecision) -> Reservation {
        match decision {
            LedgerDecision::Reserved(r) => r,
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reserve_confirm_release() {
        let ledger = LocalLedger::new(SpendLimit::ceiling(5_000u64));
        let network = Network::new("base-sepolia");

        let a = reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        let b = reserved(ledger.check_and_reserve(PAYER, &req(2_000)).await.unwrap());
        let snapshot = ledger.snapshot(PAYER, &network, "usdc");
        assert_eq!(snapshot.reserved, TokenAmount::from(3_000));
        assert_eq!(snapshot.outstanding_reservations, 2);

        ledger.confirm(&a.id).await.unwrap();
        ledger.release(&b.id).await.unwrap();
        ledger.release(&b.id).await.unwrap();
        let snapshot = ledger.snapshot(PAYER, &Network::new("eip155:84532"), "USDC");
        assert_eq!(snapshot.committed, TokenAmount::from(1_000));
        assert_eq!(snapshot.reserved, TokenAmount::ZERO);
        assert!(matches!(
            ledger.confirm(&a.id).await,
            Err(LedgerError::UnknownReservation(_))
        ));
    }

    #[tokio::test]
    async fn test_reservations_count_against_ceiling() {
        let ledger = LocalLedger::new(SpendLimit::ceiling(1_500u64));
        reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        assert_eq!(
            ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap(),
            LedgerDecision::Denied(DenialReason::AmountExceedsLimit)
        );
        // Other payers are unaffected.
        reserved(
            ledger
                .check_and_reserve(Address::repeat_byte(0x22), &req(1_000))
                .await
                .unwrap(),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_reservation_expires() {
        let ledger = LocalLedger::new(SpendLimit::ceiling(1_000u64))
            .with_reservation_ttl(Duration::from_secs(60));
        let first = reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        assert!(matches!(
            ledger.confirm(&first.id).await,
            Err(LedgerError::UnknownReservation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_committed_spend() {
        let ledger = LocalLedger::new(SpendLimit::per_window(1_000u64, Duration::from_secs(3600)));
        let r = reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        ledger.confirm(&r.id).await.unwrap();
        assert_eq!(
            ledger.check_and_reserve(PAYER, &req(1)).await.unwrap(),
            LedgerDecision::Denied(DenialReason::AmountExceedsLimit)
        );
        tokio::time::advance(Duration::from_secs(3600)).await;
        reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_accounts_are_pruned() {
        let ledger = LocalLedger::new(SpendLimit::per_window(5_000u64, Duration::from_secs(60)))
            .with_reservation_ttl(Duration::from_secs(30));
        let network = Network::new("base-sepolia");
        let other = Address::repeat_byte(0x22);

        let released = reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        ledger.release(&released.id).await.unwrap();
        let confirmed = reserved(ledger.check_and_reserve(other, &req(1_000)).await.unwrap());
        ledger.confirm(&confirmed.id).await.unwrap();
        let abandoned = reserved(
            ledger
                .check_and_reserve(Address::repeat_byte(0x33), &req(1_000))
                .await
                .unwrap(),
        );
        assert_eq!(ledger.tracked_accounts(), 3);

        // Released account is empty; the others still hold spend or a reservation.
        ledger.prune();
        assert_eq!(ledger.tracked_accounts(), 2);
        assert_eq!(
            ledger.snapshot(other, &network, "USDC").committed,
            TokenAmount::from(1_000)
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        ledger.prune();
        assert_eq!(ledger.tracked_accounts(), 0);
        assert!(matches!(
            ledger.confirm(&abandoned.id).await,
            Err(LedgerError::UnknownReservation(_))
        ));
    }

    #[tokio::test]
    async fn test_lifetime_spend_is_never_pruned() {
        let ledger = LocalLedger::new(SpendLimit::ceiling(1_000u64));
        let r = reserved(ledger.check_and_reserve(PAYER, &req(1_000)).await.unwrap());
        ledger.confirm(&r.id).await.unwrap();
        ledger.prune();
        assert_eq!(ledger.tracked_accounts(), 1);
        assert_eq!(
            ledger.check_and_reserve(PAYER, &req(1)).await.unwrap(),
            LedgerDecision::Denied(DenialReason::AmountExceedsLimit)
        );
    }

    #[tokio::test]
    async fn test_asset_limit_override() {
        let network = Network::new("base-sepolia");
        let ledger = LocalLedger::new(SpendLimit::ceiling(0u64)).with_asset_limit(
            &network,
            "USDC",
            SpendLimit::ceiling(10u64),
        );
        reserved(ledger.check_and_reserve(PAYER, &req(10)).await.unwrap());
        let other_asset = PaymentRequirement::new("exact", "base-sepolia", "0xA", "EURC", 1u64);
        assert_eq!(
            ledger.check_and_reserve(PAYER, &other_asset).await.unwrap(),
            LedgerDecision::Denied(DenialReason::AmountExceedsLimit)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_reservations_single_winner() {
        let ledger = Arc::new(LocalLedger::new(SpendLimit::ceiling(1_000u64)));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.check_and_reserve(PAYER, &req(1_000)).await })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if let LedgerDecision::Reserved(_) = handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
