//! Lease table and address reservation.
//!
//! This module owns every address assignment the server makes. It implements
//! the server-side lease life cycle:
//!
//! - `reserve` picks an address and records it as `OFFERED`
//! - `confirm` promotes a matching reservation to `BOUND`
//! - `renew`, `release`, `withdraw` and `decline` maintain bound leases
//! - `reap` removes leases whose expiry has passed
//!
//! # Thread Safety
//!
//! [`LeaseTable`] is plain data and takes the current time as an argument,
//! so it can be driven directly from tests. [`Leases`] wraps it in a single
//! [`Mutex`] shared by the protocol engine, the reaper and admin sessions.
//! Each operation holds the lock for its own duration only.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::AddressPool;

/// Longest hostname kept from option 12.
const MAX_HOSTNAME_LEN: usize = 63;

/// A client's hardware address, the primary key of the lease table.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for ClientId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self)
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::AdminProtocol(format!("invalid client id: {}", s));

        let bytes = s
            .split([':', '-'])
            .map(|part| {
                if part.len() != 2 {
                    return Err(invalid());
                }
                u8::from_str_radix(part, 16).map_err(|_| invalid())
            })
            .collect::<Result<Vec<u8>>>()?;

        if bytes.len() > 16 {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

/// Where a lease is in its life cycle.
///
/// Only `Offered` and `Bound` leases live in the table. `Released` and
/// `Expired` mark the copies handed back when a lease leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Offered,
    Bound,
    Released,
    Expired,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offered => write!(f, "OFFERED"),
            Self::Bound => write!(f, "BOUND"),
            Self::Released => write!(f, "RELEASED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// One address assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_id: ClientId,
    pub address: Ipv4Addr,
    pub state: LeaseState,
    pub lease_start: DateTime<Utc>,
    /// Always later than `lease_start`.
    pub lease_expiry: DateTime<Utc>,
    /// Transaction of the exchange that created or last refreshed the lease.
    pub transaction_id: u32,
    /// Client-provided hostname (option 12), sanitized.
    pub hostname: Option<String>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry <= now
    }

    /// Seconds remaining until expiry, or 0 once expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.lease_expiry - now).num_seconds().max(0)
    }

    fn refresh(&mut self, now: DateTime<Utc>, duration: TimeDelta) {
        self.lease_start = now;
        self.lease_expiry = now + duration;
    }

    fn ended(mut self, state: LeaseState) -> Self {
        self.state = state;
        self
    }
}

/// Keeps printable ASCII letters, digits, '-' and '.', truncated to 63 bytes.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_hostname(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LEN)
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Durations the table stamps onto leases.
#[derive(Debug, Clone, Copy)]
pub struct LeaseTimes {
    pub lease: TimeDelta,
    pub offer: TimeDelta,
    pub decline_cooldown: TimeDelta,
}

impl LeaseTimes {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease: TimeDelta::seconds(i64::from(config.lease_duration_seconds)),
            offer: TimeDelta::seconds(i64::from(config.offer_timeout_seconds)),
            decline_cooldown: TimeDelta::seconds(i64::from(config.decline_cooldown_seconds)),
        }
    }
}

/// The lease table and its pool.
///
/// `holders` indexes every `Offered` or `Bound` lease by address, which is
/// what keeps one address from being handed to two clients.
#[derive(Debug)]
pub struct LeaseTable {
    leases: HashMap<ClientId, Lease>,
    holders: HashMap<Ipv4Addr, ClientId>,
    pool: AddressPool,
    /// Declined addresses and the time they come back into service.
    declined: HashMap<Ipv4Addr, DateTime<Utc>>,
    times: LeaseTimes,
}

impl LeaseTable {
    pub fn new(pool: AddressPool, times: LeaseTimes) -> Self {
        Self {
            leases: HashMap::new(),
            holders: HashMap::new(),
            pool,
            declined: HashMap::new(),
            times,
        }
    }

    fn is_declined(&self, address: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.declined.get(&address).is_some_and(|until| *until > now)
    }

    /// Whether `client_id` may take `address` right now. `None` asks on
    /// behalf of a client that holds nothing.
    fn is_free_for(
        &self,
        address: Ipv4Addr,
        client_id: Option<&ClientId>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.pool.is_assignable(address) || self.is_declined(address, now) {
            return false;
        }
        match self.holders.get(&address) {
            None => true,
            Some(holder) if Some(holder) == client_id => true,
            Some(holder) => self
                .leases
                .get(holder)
                .is_none_or(|lease| lease.is_expired_at(now)),
        }
    }

    fn remove_lease(&mut self, client_id: &ClientId) -> Option<Lease> {
        let lease = self.leases.remove(client_id)?;
        if self.holders.get(&lease.address) == Some(client_id) {
            self.holders.remove(&lease.address);
        }
        Some(lease)
    }

    /// Reserves an address for `client_id` and records it as `OFFERED`.
    ///
    /// Candidates are tried in order: the requested address, the address the
    /// client already holds, then the lowest free address in the pool. An
    /// expired lease held by another client is evicted when its address is
    /// taken. Any previous lease of this client is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] if no address is free.
    pub fn reserve(
        &mut self,
        client_id: &ClientId,
        requested: Option<Ipv4Addr>,
        transaction_id: u32,
        hostname: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Ipv4Addr> {
        let current = self.leases.get(client_id).map(|lease| lease.address);

        let address = requested
            .into_iter()
            .chain(current)
            .find(|address| self.is_free_for(*address, Some(client_id), now))
            .or_else(|| {
                self.pool
                    .assignable()
                    .find(|address| self.is_free_for(*address, Some(client_id), now))
            })
            .ok_or(Error::Exhausted)?;

        if let Some(previous) = self.holders.get(&address).cloned()
            && previous != *client_id
        {
            self.remove_lease(&previous);
        }
        let hostname = hostname.or_else(|| {
            self.leases
                .get(client_id)
                .and_then(|lease| lease.hostname.clone())
        });
        self.remove_lease(client_id);

        self.leases.insert(
            client_id.clone(),
            Lease {
                client_id: client_id.clone(),
                address,
                state: LeaseState::Offered,
                lease_start: now,
                lease_expiry: now + self.times.offer,
                transaction_id,
                hostname,
            },
        );
        self.holders.insert(address, client_id.clone());

        Ok(address)
    }

    /// Promotes the client's reservation to `BOUND`.
    ///
    /// An `OFFERED` lease is promoted only if both `address` and
    /// `transaction_id` match it. A `BOUND` lease on the same address is
    /// refreshed, which covers retransmitted and INIT-REBOOT requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mismatch`] in every other case. The table is left
    /// untouched.
    pub fn confirm(
        &mut self,
        client_id: &ClientId,
        address: Ipv4Addr,
        transaction_id: u32,
        hostname: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let mismatch = |reason: String| Error::Mismatch {
            client: client_id.clone(),
            reason,
        };

        let duration = self.times.lease;
        let lease = self
            .leases
            .get_mut(client_id)
            .filter(|lease| !lease.is_expired_at(now))
            .ok_or_else(|| mismatch("no reservation".to_string()))?;

        if lease.address != address {
            return Err(mismatch(format!(
                "requested {} but reservation is {}",
                address, lease.address
            )));
        }

        match lease.state {
            LeaseState::Offered if lease.transaction_id != transaction_id => {
                return Err(mismatch(format!(
                    "transaction {:#010x} does not match offer {:#010x}",
                    transaction_id, lease.transaction_id
                )));
            }
            LeaseState::Offered | LeaseState::Bound => {}
            state => return Err(mismatch(format!("lease is {}", state))),
        }

        lease.state = LeaseState::Bound;
        lease.transaction_id = transaction_id;
        lease.refresh(now, duration);
        if hostname.is_some() {
            lease.hostname = hostname;
        }
        Ok(lease.clone())
    }

    /// Extends a `BOUND` lease for a RENEWING or REBINDING client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mismatch`] if the client holds no unexpired bound
    /// lease on `address`.
    pub fn renew(
        &mut self,
        client_id: &ClientId,
        address: Ipv4Addr,
        transaction_id: u32,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let duration = self.times.lease;
        let lease = self
            .leases
            .get_mut(client_id)
            .filter(|lease| {
                lease.state == LeaseState::Bound
                    && lease.address == address
                    && !lease.is_expired_at(now)
            })
            .ok_or_else(|| Error::Mismatch {
                client: client_id.clone(),
                reason: format!("no bound lease on {}", address),
            })?;

        lease.transaction_id = transaction_id;
        lease.refresh(now, duration);
        Ok(lease.clone())
    }

    /// Drops an `OFFERED` reservation. Bound leases are left alone.
    pub fn withdraw(&mut self, client_id: &ClientId) -> Option<Lease> {
        if self.leases.get(client_id)?.state != LeaseState::Offered {
            return None;
        }
        self.remove_lease(client_id)
            .map(|lease| lease.ended(LeaseState::Released))
    }

    /// Removes the client's lease.
    ///
    /// When `address` is given the lease is only released if it is on that
    /// address. Returns the removed lease marked `RELEASED`.
    pub fn release(&mut self, client_id: &ClientId, address: Option<Ipv4Addr>) -> Option<Lease> {
        let lease = self.leases.get(client_id)?;
        if address.is_some_and(|address| address != lease.address) {
            return None;
        }
        self.remove_lease(client_id)
            .map(|lease| lease.ended(LeaseState::Released))
    }

    /// Takes `address` out of service for the decline cool-down.
    ///
    /// Only the client holding `address` may decline it, or anyone if the
    /// address is an unheld pool address. The declining client's lease is
    /// removed and returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mismatch`] if another client holds the address or it
    /// lies outside the pool. The table is left untouched.
    pub fn decline(
        &mut self,
        client_id: &ClientId,
        address: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        match self.holders.get(&address) {
            Some(holder) if holder != client_id => {
                return Err(Error::Mismatch {
                    client: client_id.clone(),
                    reason: format!("{} is held by {}", address, holder),
                });
            }
            None if !self.pool.contains(address) => {
                return Err(Error::Mismatch {
                    client: client_id.clone(),
                    reason: format!("{} is not in the pool", address),
                });
            }
            _ => {}
        }

        self.declined
            .insert(address, now + self.times.decline_cooldown);
        if self.holders.contains_key(&address) {
            Ok(self
                .remove_lease(client_id)
                .map(|lease| lease.ended(LeaseState::Released)))
        } else {
            Ok(None)
        }
    }

    /// Removes every lease with `lease_expiry <= now` and ends elapsed
    /// decline cool-downs. Returns the removed leases marked `EXPIRED`.
    pub fn reap(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        self.declined.retain(|_, until| *until > now);

        let expired: Vec<ClientId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired_at(now))
            .map(|(client_id, _)| client_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|client_id| self.remove_lease(client_id))
            .map(|lease| lease.ended(LeaseState::Expired))
            .collect()
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<Lease> {
        self.leases.get(client_id).cloned()
    }

    /// Snapshot of the table, ordered by address.
    pub fn list(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.leases.values().cloned().collect();
        leases.sort_by_key(|lease| lease.address);
        leases
    }

    pub fn holder_of(&self, address: Ipv4Addr) -> Option<ClientId> {
        self.holders.get(&address).cloned()
    }

    /// Administrative exclusion. Existing leases on the address are kept.
    pub fn exclude(&mut self, address: Ipv4Addr) -> Result<bool> {
        self.pool.exclude(address)
    }

    pub fn include(&mut self, address: Ipv4Addr) -> Result<bool> {
        self.pool.include(address)
    }

    pub fn excluded(&self) -> Vec<Ipv4Addr> {
        self.pool.excluded().collect()
    }

    pub fn active_count(&self) -> usize {
        self.leases.len()
    }

    /// Addresses a new client could be offered right now.
    pub fn free_count(&self, now: DateTime<Utc>) -> usize {
        self.pool
            .assignable()
            .filter(|address| self.is_free_for(*address, None, now))
            .count()
    }
}

/// The shared lease store.
///
/// Cloning is cheap and every clone sees the same table. Operations stamp
/// leases with the wall clock, except [`reap`](Self::reap) which takes the
/// instant to reap at.
#[derive(Debug, Clone)]
pub struct Leases {
    state: Arc<Mutex<LeaseTable>>,
}

impl Leases {
    /// Creates an empty store from the configured pool and durations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] or [`Error::AddressOutOfRange`] if
    /// the configured pool is unusable.
    pub fn new(config: &Config) -> Result<Self> {
        let pool = AddressPool::from_config(config)?;
        Ok(Self::from_table(LeaseTable::new(
            pool,
            LeaseTimes::from_config(config),
        )))
    }

    pub fn from_table(table: LeaseTable) -> Self {
        Self {
            state: Arc::new(Mutex::new(table)),
        }
    }

    pub async fn reserve(
        &self,
        client_id: &ClientId,
        requested: Option<Ipv4Addr>,
        transaction_id: u32,
        hostname: Option<String>,
    ) -> Result<Ipv4Addr> {
        let mut state = self.state.lock().await;
        state.reserve(client_id, requested, transaction_id, hostname, Utc::now())
    }

    pub async fn confirm(
        &self,
        client_id: &ClientId,
        address: Ipv4Addr,
        transaction_id: u32,
        hostname: Option<String>,
    ) -> Result<Lease> {
        let mut state = self.state.lock().await;
        state.confirm(client_id, address, transaction_id, hostname, Utc::now())
    }

    pub async fn renew(
        &self,
        client_id: &ClientId,
        address: Ipv4Addr,
        transaction_id: u32,
    ) -> Result<Lease> {
        let mut state = self.state.lock().await;
        state.renew(client_id, address, transaction_id, Utc::now())
    }

    pub async fn withdraw(&self, client_id: &ClientId) -> Option<Lease> {
        self.state.lock().await.withdraw(client_id)
    }

    pub async fn release(&self, client_id: &ClientId, address: Option<Ipv4Addr>) -> Option<Lease> {
        self.state.lock().await.release(client_id, address)
    }

    pub async fn decline(&self, client_id: &ClientId, address: Ipv4Addr) -> Result<Option<Lease>> {
        let mut state = self.state.lock().await;
        state.decline(client_id, address, Utc::now())
    }

    pub async fn reap(&self, now: DateTime<Utc>) -> Vec<Lease> {
        self.state.lock().await.reap(now)
    }

    pub async fn lookup(&self, client_id: &ClientId) -> Option<Lease> {
        self.state.lock().await.lookup(client_id)
    }

    pub async fn list(&self) -> Vec<Lease> {
        self.state.lock().await.list()
    }

    pub async fn holder_of(&self, address: Ipv4Addr) -> Option<ClientId> {
        self.state.lock().await.holder_of(address)
    }

    pub async fn exclude(&self, address: Ipv4Addr) -> Result<bool> {
        self.state.lock().await.exclude(address)
    }

    pub async fn include(&self, address: Ipv4Addr) -> Result<bool> {
        self.state.lock().await.include(address)
    }

    pub async fn excluded(&self) -> Vec<Ipv4Addr> {
        self.state.lock().await.excluded()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active_count()
    }

    pub async fn free_count(&self) -> usize {
        self.state.lock().await.free_count(Utc::now())
    }
}
