//! Per-scope spend ledger
//!
//! Each scope owns an account behind its own mutex, so reserve, commit and
//! release serialize per scope while other scopes proceed independently.
//! Multi-scope operations lock accounts in `ScopeKey` order.
//!
//! A reservation is a provisional deduction. It is bound to the day and month
//! of its reservation timestamp; the committed cost is posted to that same
//! period even if the commit happens after a rollover.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::config::{BudgetConfig, BudgetLimits};
use crate::error::{GatewayError, Result};
use crate::gateway::ScopeKey;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Accounting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Monthly,
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
        })
    }
}

type MonthKey = (i32, u32);

fn month_of(day: NaiveDate) -> MonthKey {
    (day.year(), day.month())
}

/// Result of a successful [`BudgetLedger::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    /// A new reservation was placed for this key
    Created,
    /// Another request already holds a reservation under this key
    InFlight,
    /// This key was already billed in the current month
    Committed,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    amount: f64,
    day: NaiveDate,
}

/// Mutable state for one scope; only touched under its mutex
#[derive(Debug)]
struct ScopeAccount {
    limits: BudgetLimits,
    daily: HashMap<NaiveDate, f64>,
    monthly: HashMap<MonthKey, f64>,
    reservations: HashMap<String, Reservation>,
    committed: HashMap<String, NaiveDate>,
}

impl ScopeAccount {
    fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            daily: HashMap::new(),
            monthly: HashMap::new(),
            reservations: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    fn spent_on(&self, day: NaiveDate) -> f64 {
        self.daily.get(&day).copied().unwrap_or(0.0)
    }

    fn spent_in(&self, month: MonthKey) -> f64 {
        self.monthly.get(&month).copied().unwrap_or(0.0)
    }

    // An empty f64 sum is -0.0; adding 0.0 normalises it for display
    fn reserved_on(&self, day: NaiveDate) -> f64 {
        self.reservations
            .values()
            .filter(|r| r.day == day)
            .map(|r| r.amount)
            .sum::<f64>()
            + 0.0
    }

    fn reserved_in(&self, month: MonthKey) -> f64 {
        self.reservations
            .values()
            .filter(|r| month_of(r.day) == month)
            .map(|r| r.amount)
            .sum::<f64>()
            + 0.0
    }

    /// Reject when `amount` would push either period past its limit
    fn check(&self, scope: &ScopeKey, day: NaiveDate, amount: f64) -> Result<()> {
        let spent = self.spent_on(day);
        let reserved = self.reserved_on(day);
        if spent + reserved + amount > self.limits.daily_limit {
            return Err(GatewayError::BudgetExceeded {
                scope: scope.to_string(),
                period: Period::Daily,
                limit: self.limits.daily_limit,
                spent,
                reserved,
                requested: amount,
            });
        }

        let month = month_of(day);
        let spent = self.spent_in(month);
        let reserved = self.reserved_in(month);
        if spent + reserved + amount > self.limits.monthly_limit {
            return Err(GatewayError::BudgetExceeded {
                scope: scope.to_string(),
                period: Period::Monthly,
                limit: self.limits.monthly_limit,
                spent,
                reserved,
                requested: amount,
            });
        }

        Ok(())
    }

    fn post(&mut self, day: NaiveDate, amount: f64) {
        *self.daily.entry(day).or_insert(0.0) += amount;
        *self.monthly.entry(month_of(day)).or_insert(0.0) += amount;
    }

    /// Forget closed periods; a reservation still pins its own day
    fn prune(&mut self, today: NaiveDate) {
        let current = month_of(today);
        let pinned: HashSet<NaiveDate> = self.reservations.values().map(|r| r.day).collect();
        self.daily
            .retain(|day, _| *day >= today || pinned.contains(day));
        self.monthly.retain(|month, _| {
            *month >= current || pinned.iter().any(|d| month_of(*d) == *month)
        });
        self.committed.retain(|_, day| month_of(*day) >= current);
    }
}

/// Point-in-time view of one scope, as handed to the policy engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub scope: String,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub daily_spent: f64,
    pub monthly_spent: f64,
    pub daily_reserved: f64,
    pub monthly_reserved: f64,
}

impl BudgetSnapshot {
    pub fn daily_remaining(&self) -> f64 {
        (self.daily_limit - self.daily_spent - self.daily_reserved).max(0.0)
    }

    pub fn monthly_remaining(&self) -> f64 {
        (self.monthly_limit - self.monthly_spent - self.monthly_reserved).max(0.0)
    }
}

/// Spend ledger for every scope
pub struct BudgetLedger {
    config: BudgetConfig,
    accounts: DashMap<ScopeKey, Arc<Mutex<ScopeAccount>>>,
    clock: Arc<dyn Clock>,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            accounts: DashMap::new(),
            clock,
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    fn limits_for(&self, scope: &ScopeKey) -> BudgetLimits {
        self.config
            .scopes
            .get(&scope.to_string())
            .copied()
            .unwrap_or(self.config.default)
    }

    fn account(&self, scope: &ScopeKey) -> Arc<Mutex<ScopeAccount>> {
        self.accounts
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ScopeAccount::new(self.limits_for(scope)))))
            .clone()
    }

    /// Accounts for `scopes` in lock order, duplicates removed
    fn accounts_for(&self, scopes: &[ScopeKey]) -> Vec<(ScopeKey, Arc<Mutex<ScopeAccount>>)> {
        let mut keys = scopes.to_vec();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .map(|key| {
                let account = self.account(&key);
                (key, account)
            })
            .collect()
    }

    /// Provisionally deduct `amount` from every scope, or from none
    ///
    /// A key that already holds a reservation, or was already committed, is
    /// never charged twice: the call reports that state and changes nothing.
    /// Only a [`Hold::Created`] reservation belongs to the caller.
    pub fn reserve(&self, scopes: &[ScopeKey], request_id: &str, amount: f64) -> Result<Hold> {
        let amount = sanitize_amount(amount);
        let day = self.today();
        let accounts = self.accounts_for(scopes);
        let mut guards: Vec<_> = accounts
            .iter()
            .map(|(key, account)| (key, account.lock()))
            .collect();

        for (_, account) in guards.iter_mut() {
            account.prune(day);
        }
        if guards
            .iter()
            .any(|(_, account)| account.committed.contains_key(request_id))
        {
            return Ok(Hold::Committed);
        }
        if guards
            .iter()
            .any(|(_, account)| account.reservations.contains_key(request_id))
        {
            return Ok(Hold::InFlight);
        }

        for (key, account) in guards.iter() {
            account.check(key, day, amount)?;
        }

        for (key, account) in guards.iter_mut() {
            account
                .reservations
                .insert(request_id.to_string(), Reservation { amount, day });
            debug!(scope = %key, request_id, amount, "Budget reserved");
        }

        Ok(Hold::Created)
    }

    /// Finalise the reservation with the actual cost
    ///
    /// Returns false when this request id was already committed for every
    /// scope; the cost is then not posted again. Without a reservation the
    /// cost is posted to the current period.
    pub fn commit(&self, scopes: &[ScopeKey], request_id: &str, actual: f64) -> bool {
        let actual = sanitize_amount(actual);
        let today = self.today();
        let mut posted = false;

        for (key, account) in self.accounts_for(scopes) {
            let mut account = account.lock();
            if account.committed.contains_key(request_id) {
                debug!(scope = %key, request_id, "Duplicate commit ignored");
                continue;
            }

            let day = match account.reservations.remove(request_id) {
                Some(reservation) => reservation.day,
                None => today,
            };
            account.post(day, actual);
            account.committed.insert(request_id.to_string(), day);
            posted = true;

            if account.spent_on(day) > account.limits.daily_limit {
                warn!(scope = %key, spent = account.spent_on(day), "Actual spend above daily limit");
            }
            debug!(scope = %key, request_id, actual, %day, "Budget committed");
        }

        posted
    }

    /// Return any reservation held by `request_id`; committed requests are unaffected
    pub fn release(&self, scopes: &[ScopeKey], request_id: &str) {
        for (key, account) in self.accounts_for(scopes) {
            if let Some(reservation) = account.lock().reservations.remove(request_id) {
                debug!(scope = %key, request_id, amount = reservation.amount, "Budget released");
            }
        }
    }

    pub fn snapshot(&self, scope: &ScopeKey) -> BudgetSnapshot {
        let today = self.today();
        let month = month_of(today);
        let account = self.account(scope);
        let account = account.lock();
        BudgetSnapshot {
            scope: scope.to_string(),
            daily_limit: account.limits.daily_limit,
            monthly_limit: account.limits.monthly_limit,
            daily_spent: account.spent_on(today),
            monthly_spent: account.spent_in(month),
            daily_reserved: account.reserved_on(today),
            monthly_reserved: account.reserved_in(month),
        }
    }

    pub fn snapshots(&self, scopes: &[ScopeKey]) -> Vec<BudgetSnapshot> {
        scopes.iter().map(|scope| self.snapshot(scope)).collect()
    }

    /// Total held by outstanding reservations, across all periods
    pub fn reserved_total(&self, scope: &ScopeKey) -> f64 {
        self.accounts
            .get(scope)
            .map(|account| {
                account
                    .lock()
                    .reservations
                    .values()
                    .map(|r| r.amount)
                    .sum::<f64>()
                    + 0.0
            })
            .unwrap_or(0.0)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Negative or non-finite amounts count as zero so balances never go negative
fn sanitize_amount(amount: f64) -> f64 {
    if amount.is_finite() && amount > 0.0 {
        amount
    } else {
        0.0
    }
}
