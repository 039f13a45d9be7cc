use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use aurum_core::error::ValidationError;
use aurum_core::transaction::Transaction;

use crate::error::MempoolError;
use crate::nonce::NonceTracker;
use crate::utxo::{OutPoint, UtxoManager};
use crate::validator::{TransactionValidator, ValidationContext};

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub max_size: usize,
    pub max_per_sender: usize,
    pub min_fee_rate: f64,
    pub max_age_secs: f64,
    pub invalid_threshold: u32,
    pub invalid_window_secs: f64,
    pub invalid_ban_secs: f64,
    pub max_per_block: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5000,
            max_per_sender: 25,
            min_fee_rate: 0.0,
            max_age_secs: 3600.0,
            invalid_threshold: 5,
            invalid_window_secs: 300.0,
            invalid_ban_secs: 600.0,
            max_per_block: 500,
        }
    }
}

/// Non-consensus counters surfaced to operators.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct MempoolStats {
    pub pending: usize,
    pub orphans: usize,
    pub locked_utxos: usize,
    pub active_bans: usize,
    pub expired_total: u64,
    pub evicted_low_fee_total: u64,
    pub rejected_low_fee_total: u64,
    pub rejected_sender_cap_total: u64,
    pub rejected_invalid_total: u64,
    pub rejected_banned_total: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct InvalidRecord {
    count: u32,
    window_start: f64,
    banned_until: f64,
}

#[derive(Default)]
struct Inner {
    pending: Vec<Transaction>,
    orphans: Vec<Transaction>,
    seen: HashSet<String>,
    sender_pending: HashMap<String, usize>,
    invalid: HashMap<String, InvalidRecord>,
    locks: HashMap<OutPoint, String>,
    expired_total: u64,
    evicted_low_fee_total: u64,
    rejected_low_fee_total: u64,
    rejected_sender_cap_total: u64,
    rejected_invalid_total: u64,
    rejected_banned_total: u64,
}

impl Inner {
    fn rebuild_sender_counts(&mut self) {
        self.sender_pending.clear();
        for tx in &self.pending {
            *self.sender_pending.entry(tx.sender.clone()).or_default() += 1;
        }
    }

    fn unlock_inputs(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            self.locks.remove(&(input.txid.clone(), input.vout));
        }
    }
}

/// Bounded pool of admitted, not-yet-confirmed transactions.
///
/// One mutex guards the pending list, seen-txid set, sender counts, the
/// UTXO soft-lock map, the ban tracker, and every counter; the whole
/// admission pipeline runs under it. The caller supplies a UTXO view taken
/// under the chain lock *before* entering, preserving the chain → mempool
/// lock order.
pub struct Mempool {
    config: MempoolConfig,
    validator: TransactionValidator,
    nonce: Arc<NonceTracker>,
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new(config: MempoolConfig, validator: TransactionValidator, nonce: Arc<NonceTracker>) -> Self {
        Self {
            config,
            validator,
            nonce,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Run the admission pipeline. Atomic: either the transaction is fully
    /// admitted (locks held, nonce reserved, counters bumped) or nothing
    /// changed beyond the relevant rejection counter.
    pub fn add_transaction(
        &self,
        tx: Transaction,
        utxo: &UtxoManager,
        now: f64,
    ) -> Result<(), MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }
        let txid = tx
            .txid
            .clone()
            .ok_or_else(|| MempoolError::Invalid(ValidationError::BadField("missing txid".into())))?;

        let mut inner = self.inner.lock();

        if inner.seen.contains(&txid) {
            return Err(MempoolError::Duplicate);
        }

        if let Some(original) = tx.replaces_txid.clone() {
            self.apply_rbf(&mut inner, &tx, &original)?;
        }

        if inner.pending.len() >= self.config.max_size {
            let lowest = inner
                .pending
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.fee_rate()
                        .partial_cmp(&b.fee_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, t)| (i, t.fee_rate()));
            match lowest {
                Some((idx, rate)) if tx.fee_rate() > rate => {
                    let evicted = inner.pending.remove(idx);
                    inner.unlock_inputs(&evicted);
                    if let Some(id) = &evicted.txid {
                        inner.seen.remove(id);
                    }
                    self.nonce.release(&evicted.sender);
                    inner.rebuild_sender_counts();
                    inner.evicted_low_fee_total += 1;
                    info!(
                        evicted = evicted.txid.as_deref().unwrap_or(""),
                        fee_rate = rate,
                        "evicted lowest fee-rate transaction for a better one"
                    );
                }
                _ => {
                    inner.rejected_low_fee_total += 1;
                    return Err(MempoolError::FeeTooLow);
                }
            }
        }

        if inner.sender_pending.get(&tx.sender).copied().unwrap_or(0) >= self.config.max_per_sender {
            inner.rejected_sender_cap_total += 1;
            return Err(MempoolError::SenderCap);
        }

        if tx.fee_rate() < self.config.min_fee_rate {
            inner.rejected_low_fee_total += 1;
            return Err(MempoolError::FeeTooLow);
        }

        if let Some(until) = self.banned_until(&mut inner, &tx.sender, now) {
            inner.rejected_banned_total += 1;
            return Err(MempoolError::Banned { retry_after: until - now });
        }

        let verdict = {
            let ctx = ValidationContext {
                utxo,
                nonce: &self.nonce,
                mempool_view: &inner.pending,
                block_view: &[],
                now,
                for_mempool: true,
            };
            self.validator.validate(&tx, &ctx)
        };
        if let Err(e) = verdict {
            if matches!(e, ValidationError::DoubleSpend(_))
                && has_unknown_parent(&tx, utxo, &inner.pending)
            {
                debug!(txid = %txid, "parking transaction with unknown parent as orphan");
                inner.orphans.push(tx);
                return Err(MempoolError::Orphaned);
            }
            self.record_invalid(&mut inner, &tx.sender, now);
            inner.rejected_invalid_total += 1;
            warn!(txid = %txid, error = %e, "transaction rejected by validator");
            return Err(MempoolError::Invalid(e));
        }

        for input in &tx.inputs {
            let key = (input.txid.clone(), input.vout);
            if let Some(holder) = inner.locks.get(&key) {
                return Err(MempoolError::LockConflict(holder.clone()));
            }
        }
        for input in &tx.inputs {
            inner.locks.insert((input.txid.clone(), input.vout), txid.clone());
        }

        self.nonce.reserve(&tx.sender);
        *inner.sender_pending.entry(tx.sender.clone()).or_default() += 1;
        inner.seen.insert(txid.clone());
        inner.pending.push(tx);
        debug!(txid = %txid, pool = inner.pending.len(), "transaction admitted");
        Ok(())
    }

    /// Replace-by-fee: the original must exist, have opted in, share the
    /// sender and at least one input, and lose on fee rate. On success it
    /// is removed and its locks and reservation migrate to the incoming
    /// transaction as admission continues.
    fn apply_rbf(
        &self,
        inner: &mut Inner,
        replacement: &Transaction,
        original_txid: &str,
    ) -> Result<(), MempoolError> {
        let pos = inner
            .pending
            .iter()
            .position(|t| t.txid.as_deref() == Some(original_txid))
            .ok_or_else(|| MempoolError::Rbf("original transaction not found".into()))?;
        let original = &inner.pending[pos];
        if !original.rbf_enabled {
            return Err(MempoolError::Rbf("original did not opt in to replacement".into()));
        }
        if original.sender != replacement.sender {
            return Err(MempoolError::Rbf("sender mismatch".into()));
        }
        let overlaps = replacement
            .inputs
            .iter()
            .any(|i| original.inputs.iter().any(|o| o == i));
        if !overlaps {
            return Err(MempoolError::Rbf("replacement shares no inputs with original".into()));
        }
        if replacement.fee_rate() <= original.fee_rate() {
            return Err(MempoolError::Rbf("replacement fee rate must be strictly higher".into()));
        }

        let original = inner.pending.remove(pos);
        inner.unlock_inputs(&original);
        inner.seen.remove(original_txid);
        self.nonce.release(&original.sender);
        inner.rebuild_sender_counts();
        info!(
            original = original_txid,
            replacement = replacement.txid.as_deref().unwrap_or(""),
            "replace-by-fee accepted"
        );
        Ok(())
    }

    /// Background expiry pass over the pending and orphan pools. Returns
    /// `(expired_pending, expired_orphans)`.
    pub fn prune_expired(&self, now: f64) -> (usize, usize) {
        let mut inner = self.inner.lock();
        let max_age = self.config.max_age_secs;

        let (keep, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.pending)
            .into_iter()
            .partition(|t| now - t.timestamp <= max_age);
        for tx in &expired {
            inner.unlock_inputs(tx);
            if let Some(id) = &tx.txid {
                inner.seen.remove(id);
            }
            self.nonce.release(&tx.sender);
            inner.expired_total += 1;
        }
        inner.pending = keep;
        inner.rebuild_sender_counts();

        let before = inner.orphans.len();
        inner.orphans.retain(|t| now - t.timestamp <= max_age);
        let orphans_removed = before - inner.orphans.len();

        if !expired.is_empty() || orphans_removed > 0 {
            info!(
                expired = expired.len(),
                orphans = orphans_removed,
                "pruned expired transactions"
            );
        }
        (expired.len(), orphans_removed)
    }

    /// Retry orphans whose parents may have appeared. Successes move into
    /// the pending pool through the normal admission pipeline.
    pub fn promote_orphans(&self, utxo: &UtxoManager, now: f64) -> usize {
        let orphans: Vec<Transaction> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.orphans)
        };
        let mut promoted = 0;
        for tx in orphans {
            match self.add_transaction(tx, utxo, now) {
                Ok(()) => promoted += 1,
                Err(_) => {}
            }
        }
        promoted
    }

    /// Snapshot for block assembly: fee-rate descending, ties by timestamp
    /// ascending, then each sender's transactions rewritten into nonce
    /// order without disturbing their claimed positions. `max_count` trims
    /// after ordering.
    pub fn prioritize(&self, max_count: Option<usize>) -> Vec<Transaction> {
        let inner = self.inner.lock();
        let mut txs = inner.pending.clone();
        drop(inner);

        txs.sort_by(|a, b| {
            b.fee_rate()
                .partial_cmp(&a.fee_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.timestamp
                        .partial_cmp(&b.timestamp)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, tx) in txs.iter().enumerate() {
            positions.entry(tx.sender.clone()).or_default().push(i);
        }
        for slots in positions.values() {
            if slots.len() < 2 {
                continue;
            }
            let mut group: Vec<Transaction> = slots.iter().map(|&i| txs[i].clone()).collect();
            group.sort_by_key(|t| t.nonce);
            for (&slot, tx) in slots.iter().zip(group) {
                txs[slot] = tx;
            }
        }

        if let Some(n) = max_count {
            txs.truncate(n);
        }
        txs
    }

    /// Drop transactions that made it into a block, releasing their locks.
    /// Their txids stay in the seen set: a mined transaction must not be
    /// re-admitted.
    pub fn remove_included(&self, txids: &[String]) {
        let ids: HashSet<&str> = txids.iter().map(String::as_str).collect();
        let mut inner = self.inner.lock();
        let (gone, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.pending)
            .into_iter()
            .partition(|t| t.txid.as_deref().map(|id| ids.contains(id)).unwrap_or(false));
        for tx in &gone {
            inner.unlock_inputs(tx);
        }
        inner.pending = keep;
        inner.rebuild_sender_counts();
    }

    /// Forget a txid entirely so a reorged-out transaction can re-enter
    /// through the normal pipeline.
    pub fn forget(&self, txid: &str) {
        let mut inner = self.inner.lock();
        inner.seen.remove(txid);
    }

    pub fn is_pending(&self, txid: &str) -> bool {
        self.inner
            .lock()
            .pending
            .iter()
            .any(|t| t.txid.as_deref() == Some(txid))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_snapshot(&self) -> Vec<Transaction> {
        self.inner.lock().pending.clone()
    }

    /// Pending transaction count per sender, for nonce-tracker rebuilds.
    pub fn sender_counts(&self) -> HashMap<String, u64> {
        self.inner
            .lock()
            .sender_pending
            .iter()
            .map(|(k, v)| (k.clone(), *v as u64))
            .collect()
    }

    pub fn stats(&self) -> MempoolStats {
        let now = aurum_core::params::now_ts();
        let mut inner = self.inner.lock();
        let active_bans = self.count_active_bans(&mut inner, now);
        MempoolStats {
            pending: inner.pending.len(),
            orphans: inner.orphans.len(),
            locked_utxos: inner.locks.len(),
            active_bans,
            expired_total: inner.expired_total,
            evicted_low_fee_total: inner.evicted_low_fee_total,
            rejected_low_fee_total: inner.rejected_low_fee_total,
            rejected_sender_cap_total: inner.rejected_sender_cap_total,
            rejected_invalid_total: inner.rejected_invalid_total,
            rejected_banned_total: inner.rejected_banned_total,
        }
    }

    /// Operator view: counts, limits, and per-transaction summaries.
    pub fn overview(&self, limit: usize) -> serde_json::Value {
        let inner = self.inner.lock();
        let now = aurum_core::params::now_ts();
        let transactions: Vec<_> = inner
            .pending
            .iter()
            .take(limit)
            .map(|t| {
                json!({
                    "txid": t.txid,
                    "sender": t.sender,
                    "recipient": t.recipient,
                    "amount": t.amount,
                    "fee": t.fee,
                    "fee_rate": t.fee_rate(),
                    "age_seconds": (now - t.timestamp).max(0.0),
                })
            })
            .collect();
        let sponsored = inner.pending.iter().filter(|t| t.gas_sponsor.is_some()).count();
        let size_kb: f64 = inner
            .pending
            .iter()
            .map(|t| t.canonical_size() as f64)
            .sum::<f64>()
            / 1024.0;
        json!({
            "pending_count": inner.pending.len(),
            "orphan_count": inner.orphans.len(),
            "limits": {
                "max_transactions": self.config.max_size,
                "max_per_sender": self.config.max_per_sender,
                "min_fee_rate": self.config.min_fee_rate,
            },
            "transactions_returned": transactions.len(),
            "transactions": transactions,
            "sponsored_transactions": sponsored,
            "size_kb": size_kb,
        })
    }

    fn banned_until(&self, inner: &mut Inner, sender: &str, now: f64) -> Option<f64> {
        let rec = inner.invalid.get_mut(sender)?;
        if rec.banned_until > now {
            return Some(rec.banned_until);
        }
        if rec.banned_until != 0.0 {
            // Ban expired: reset the record.
            rec.count = 0;
            rec.banned_until = 0.0;
        }
        None
    }

    fn record_invalid(&self, inner: &mut Inner, sender: &str, now: f64) {
        let rec = inner
            .invalid
            .entry(sender.to_string())
            .or_insert(InvalidRecord { count: 0, window_start: now, banned_until: 0.0 });
        if now - rec.window_start > self.config.invalid_window_secs {
            rec.count = 0;
            rec.window_start = now;
        }
        rec.count += 1;
        if rec.count >= self.config.invalid_threshold {
            rec.banned_until = now + self.config.invalid_ban_secs;
            warn!(sender, until = rec.banned_until, "sender banned for repeated invalid submissions");
        }
    }

    fn count_active_bans(&self, inner: &mut Inner, now: f64) -> usize {
        let mut active = 0;
        for rec in inner.invalid.values_mut() {
            if rec.banned_until > now {
                active += 1;
            } else if rec.banned_until != 0.0 {
                rec.count = 0;
                rec.banned_until = 0.0;
            }
        }
        active
    }
}

/// True when at least one input resolves neither in the confirmed set nor
/// in any pending transaction: the parent simply has not arrived yet.
fn has_unknown_parent(tx: &Transaction, utxo: &UtxoManager, pending: &[Transaction]) -> bool {
    tx.inputs.iter().any(|input| {
        utxo.get_unspent_output(&input.txid, input.vout).is_none()
            && !pending
                .iter()
                .any(|p| p.txid.as_deref() == Some(input.txid.as_str()))
    })
}
