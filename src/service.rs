//! Service layer API for stock ledger operations
//!
//! Every operation runs on a [`UnitOfWork`] obtained from
//! [`StockLedger::begin`]. Writes are staged in an overlay, so reads inside
//! the same unit of work observe prior writes, and nothing reaches the
//! database until [`UnitOfWork::commit`] applies the whole set in one sled
//! transaction. Dropping an uncommitted unit of work discards every staged
//! mutation.
use super::aggregate::AggregateStock;
use super::error::LedgerError;
use super::keys::{self, LotLocator};
use super::lot::{Allocation, LotStatus, StockLot, TimeStamp};
use super::owner::Owner;
use super::reservation::Reservation;
use super::transfer::Transfer;
use super::utils;
use chrono::Utc;
use sled::Db;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub struct StockLedger {
    instance: Arc<Db>,
}

impl StockLedger {
    pub fn new(instance: Arc<Db>) -> Self {
        Self { instance }
    }

    /// Open a unit of work. One external operation (add stock, transfer,
    /// schedule an appointment, delete a lot) maps to one unit of work.
    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            db: &self.instance,
            staged: BTreeMap::new(),
            observed: HashMap::new(),
        }
    }
}

pub struct UnitOfWork<'a> {
    db: &'a Db,
    // key -> Some(value) for staged writes, None for staged deletes
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    // aggregate key -> version seen in the database when first touched
    observed: HashMap<Vec<u8>, Option<u64>>,
}

impl UnitOfWork<'_> {
    // ---- overlay primitives -------------------------------------------

    fn raw_get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(entry) = self.staged.get(key) {
            return Ok(entry.clone());
        }
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn stage_put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    fn stage_delete(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    /// Prefix scan over the database merged with the staged overlay.
    fn scan(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, value) = entry?;
            rows.insert(key.to_vec(), value.to_vec());
        }
        for (key, value) in self.staged.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => rows.insert(key.clone(), value.clone()),
                None => rows.remove(key),
            };
        }
        Ok(rows.into_iter().collect())
    }

    fn get_decoded<T>(&self, key: &[u8]) -> anyhow::Result<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.raw_get(key)? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ---- typed reads --------------------------------------------------

    fn locator(&self, lot_id: &str) -> anyhow::Result<Option<LotLocator>> {
        self.get_decoded(&keys::locator_key(lot_id))
    }

    pub fn lot(&self, lot_id: &str) -> anyhow::Result<Option<StockLot>> {
        let Some(loc) = self.locator(lot_id)? else {
            return Ok(None);
        };
        self.get_decoded(&keys::lot_key(&loc.vaccine_id, &loc.owner, lot_id))
    }

    pub fn lots_for(&self, vaccine_id: &str, owner: &Owner) -> anyhow::Result<Vec<StockLot>> {
        let rows = self.scan(&keys::lot_prefix(vaccine_id, owner))?;
        rows.iter()
            .map(|(_, bytes)| Ok(minicbor::decode(bytes)?))
            .collect()
    }

    pub fn aggregate(
        &self,
        vaccine_id: &str,
        owner: &Owner,
    ) -> anyhow::Result<Option<AggregateStock>> {
        self.get_decoded(&keys::aggregate_key(vaccine_id, owner))
    }

    pub fn transfer(&self, transfer_id: &str) -> anyhow::Result<Option<Transfer>> {
        self.get_decoded(&keys::transfer_key(transfer_id))
    }

    pub fn reservation(&self, schedule_id: &str) -> anyhow::Result<Option<Reservation>> {
        self.get_decoded(&keys::reservation_key(schedule_id))
    }

    // ---- aggregate bookkeeping ----------------------------------------

    /// Load the aggregate for mutation, pinning the version first seen in
    /// the database so commit can detect a concurrent writer.
    fn aggregate_for_update(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
    ) -> anyhow::Result<AggregateStock> {
        let key = keys::aggregate_key(vaccine_id, owner);
        if !self.observed.contains_key(&key) {
            let baseline = match self.db.get(&key)? {
                Some(bytes) => {
                    let agg: AggregateStock = minicbor::decode(&bytes)?;
                    Some(agg.version)
                }
                None => None,
            };
            self.observed.insert(key.clone(), baseline);
        }
        Ok(self.get_decoded(&key)?.unwrap_or_default())
    }

    fn put_aggregate(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
        agg: &AggregateStock,
    ) -> anyhow::Result<()> {
        self.stage_put(keys::aggregate_key(vaccine_id, owner), minicbor::to_vec(agg)?);
        Ok(())
    }

    fn put_lot(&mut self, lot: &StockLot) -> anyhow::Result<()> {
        self.stage_put(
            keys::lot_key(&lot.vaccine_id, &lot.owner, &lot.id),
            minicbor::to_vec(lot)?,
        );
        Ok(())
    }

    /// Recompute the cached nearest expiration for one (vaccine, owner)
    /// key from its allocatable lots. Shared by every path that mutates
    /// lots under the key.
    fn refresh_nearest_expiration(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
    ) -> anyhow::Result<()> {
        let nearest = self
            .lots_for(vaccine_id, owner)?
            .into_iter()
            .filter(StockLot::is_allocatable)
            .map(|lot| lot.expiration)
            .min();

        let mut agg = self.aggregate_for_update(vaccine_id, owner)?;
        agg.set_nearest_expiration(nearest);
        self.put_aggregate(vaccine_id, owner, &agg)
    }

    // ---- lot store ----------------------------------------------------

    /// Create a lot. Does not credit `AggregateStock.quantity`; the caller
    /// owes a matching [`UnitOfWork::credit_stock`] inside the same unit
    /// of work ([`UnitOfWork::add_stock`] does both).
    ///
    /// `status_override` carries the source lot's status onto the
    /// destination side of a transfer; without it the status is computed
    /// from `expiration` against `now`.
    pub fn create_lot(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
        quantity: u64,
        expiration: TimeStamp<Utc>,
        source_lot_id: Option<&str>,
        status_override: Option<LotStatus>,
        now: &TimeStamp<Utc>,
    ) -> anyhow::Result<StockLot> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity.into());
        }

        let status = status_override.unwrap_or(if expiration > *now {
            LotStatus::Valid
        } else {
            LotStatus::Expired
        });

        let lot = StockLot {
            id: utils::new_uuid_to_bech32("lot_")?,
            vaccine_id: vaccine_id.to_string(),
            owner: owner.clone(),
            quantity,
            remaining_quantity: quantity,
            expiration,
            status,
            source_lot_id: source_lot_id.map(str::to_string),
            created_at: now.clone(),
        };

        self.put_lot(&lot)?;
        self.stage_put(
            keys::locator_key(&lot.id),
            minicbor::to_vec(&LotLocator {
                vaccine_id: lot.vaccine_id.clone(),
                owner: lot.owner.clone(),
            })?,
        );
        if let Some(parent) = source_lot_id {
            self.stage_put(keys::lineage_key(parent, &lot.id), Vec::new());
        }
        self.refresh_nearest_expiration(vaccine_id, owner)?;

        log::debug!("created lot {} ({quantity} doses) under {owner}", lot.id);
        Ok(lot)
    }

    /// Credit the aggregate counter after a lot insertion.
    pub fn credit_stock(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
        quantity: u64,
    ) -> anyhow::Result<()> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity.into());
        }
        let mut agg = self.aggregate_for_update(vaccine_id, owner)?;
        agg.credit(quantity);
        self.put_aggregate(vaccine_id, owner, &agg)
    }

    /// Direct intake: create a lot and credit the aggregate in one step.
    pub fn add_stock(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
        quantity: u64,
        expiration: TimeStamp<Utc>,
        now: &TimeStamp<Utc>,
    ) -> anyhow::Result<StockLot> {
        let lot = self.create_lot(vaccine_id, owner, quantity, expiration, None, None, now)?;
        self.credit_stock(vaccine_id, owner, quantity)?;
        Ok(lot)
    }

    // ---- allocation engine --------------------------------------------

    /// Debit `quantity` doses from the owner's lots, earliest expiration
    /// first (FEFO), splitting across lots as needed. Same-expiration ties
    /// fall back to creation order so allocation is deterministic.
    ///
    /// Availability is checked before anything is staged: on
    /// `InsufficientStock` no lot is touched, not even inside this unit
    /// of work.
    pub fn consume_lots(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
        quantity: u64,
    ) -> anyhow::Result<Vec<Allocation>> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity.into());
        }

        let mut lots: Vec<StockLot> = self
            .lots_for(vaccine_id, owner)?
            .into_iter()
            .filter(StockLot::is_allocatable)
            .collect();
        lots.sort_by(|a, b| {
            a.expiration
                .cmp(&b.expiration)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let available: u64 = lots.iter().map(|l| l.remaining_quantity).sum();
        if available < quantity {
            return Err(LedgerError::InsufficientStock {
                requested: quantity,
                available,
            }
            .into());
        }

        let mut needed = quantity;
        let mut allocations = Vec::new();
        for mut lot in lots {
            if needed == 0 {
                break;
            }
            let take = needed.min(lot.remaining_quantity);
            lot.remaining_quantity -= take;
            needed -= take;

            allocations.push(Allocation {
                lot_id: lot.id.clone(),
                quantity: take,
                expiration: lot.expiration.clone(),
                status: lot.status,
            });
            self.put_lot(&lot)?;
        }

        let mut agg = self.aggregate_for_update(vaccine_id, owner)?;
        agg.debit(quantity);
        self.put_aggregate(vaccine_id, owner, &agg)?;
        self.refresh_nearest_expiration(vaccine_id, owner)?;

        log::debug!(
            "consumed {quantity} doses of {vaccine_id} at {owner} across {} lots",
            allocations.len()
        );
        Ok(allocations)
    }

    // ---- transfer recorder --------------------------------------------

    /// Persist the audit record of a completed move. Purely additive: the
    /// source lots were debited and the destination lots created before
    /// this is called. An empty allocation set records nothing.
    pub fn record_transfer(
        &mut self,
        vaccine_id: &str,
        from: &Owner,
        to: &Owner,
        allocations: &[Allocation],
    ) -> anyhow::Result<Option<Transfer>> {
        if allocations.is_empty() {
            return Ok(None);
        }

        let transfer = Transfer::new(
            utils::new_uuid_to_bech32("xfer_")?,
            vaccine_id.to_string(),
            from.clone(),
            to.clone(),
            allocations,
            TimeStamp::now(),
        );
        self.stage_put(keys::transfer_key(&transfer.id), minicbor::to_vec(&transfer)?);
        Ok(Some(transfer))
    }

    /// The full downward move: consume at the source, re-materialize one
    /// derived lot per allocation at the destination (carrying expiration
    /// and status, linked via `source_lot_id`), credit the destination
    /// aggregate, and record the transfer.
    pub fn transfer_stock(
        &mut self,
        vaccine_id: &str,
        from: &Owner,
        to: &Owner,
        quantity: u64,
        now: &TimeStamp<Utc>,
    ) -> anyhow::Result<Transfer> {
        let allocations = self.consume_lots(vaccine_id, from, quantity)?;

        for allocation in &allocations {
            self.create_lot(
                vaccine_id,
                to,
                allocation.quantity,
                allocation.expiration.clone(),
                Some(&allocation.lot_id),
                Some(allocation.status),
                now,
            )?;
        }
        self.credit_stock(vaccine_id, to, quantity)?;

        log::debug!("transferred {quantity} doses of {vaccine_id} from {from} to {to}");
        self.record_transfer(vaccine_id, from, to, &allocations)?
            .ok_or_else(|| anyhow::anyhow!("empty allocation set for a positive transfer"))
    }

    // ---- expiration sweeper -------------------------------------------

    /// Flip lots whose expiration has passed from Valid to Expired and
    /// refresh the touched aggregates. Idempotent for a fixed `now`.
    pub fn refresh_expired_lots(&mut self, now: &TimeStamp<Utc>) -> anyhow::Result<Vec<StockLot>> {
        let mut flipped = Vec::new();
        let mut touched: BTreeSet<(String, Owner)> = BTreeSet::new();

        for (_, bytes) in self.scan(&keys::all_lots_prefix())? {
            let mut lot: StockLot = minicbor::decode(&bytes)?;
            if lot.status == LotStatus::Valid && lot.expiration < *now {
                lot.status = LotStatus::Expired;
                self.put_lot(&lot)?;
                touched.insert((lot.vaccine_id.clone(), lot.owner.clone()));
                flipped.push(lot);
            }
        }
        for (vaccine_id, owner) in touched {
            self.refresh_nearest_expiration(&vaccine_id, &owner)?;
        }

        if !flipped.is_empty() {
            log::debug!("expired {} lots", flipped.len());
        }
        Ok(flipped)
    }

    // ---- cascade deletion engine --------------------------------------

    /// Delete a lot together with every lot transitively derived from it,
    /// reversing the aggregate counter at each affected owner. Deepest
    /// descendants are processed first. Transfer lines naming a deleted
    /// lot are pruned; the parent transfer record stays as history of the
    /// quantity moved. Returns every deleted lot id.
    pub fn delete_lot_cascade(&mut self, lot_id: &str) -> anyhow::Result<Vec<String>> {
        if self.locator(lot_id)?.is_none() {
            return Err(LedgerError::LotNotFound(lot_id.to_string()).into());
        }

        // Collect the subtree iteratively; the visited set guards against
        // a corrupted lineage index introducing a cycle.
        let mut stack = vec![(lot_id.to_string(), 0usize)];
        let mut visited: HashSet<String> = HashSet::new();
        let mut ordered: Vec<(String, usize)> = Vec::new();
        while let Some((id, depth)) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            for (key, _) in self.scan(&keys::lineage_prefix(&id))? {
                if let Some(child) = keys::child_id_from_lineage_key(&key, &id) {
                    stack.push((child, depth + 1));
                }
            }
            ordered.push((id, depth));
        }
        ordered.sort_by(|a, b| b.1.cmp(&a.1));

        let doomed: HashSet<String> = ordered.iter().map(|(id, _)| id.clone()).collect();
        let mut touched: BTreeSet<(String, Owner)> = BTreeSet::new();

        for (id, _) in &ordered {
            let Some(loc) = self.locator(id)? else {
                // dangling lineage edge without a lot behind it
                continue;
            };
            let lot_key = keys::lot_key(&loc.vaccine_id, &loc.owner, id);
            if let Some(lot) = self.get_decoded::<StockLot>(&lot_key)? {
                if lot.remaining_quantity > 0 {
                    let mut agg = self.aggregate_for_update(&loc.vaccine_id, &loc.owner)?;
                    agg.debit(lot.remaining_quantity);
                    self.put_aggregate(&loc.vaccine_id, &loc.owner, &agg)?;
                }
                if let Some(parent) = &lot.source_lot_id {
                    self.stage_delete(keys::lineage_key(parent, id));
                }
            }
            self.stage_delete(lot_key);
            self.stage_delete(keys::locator_key(id));
            touched.insert((loc.vaccine_id, loc.owner));
        }

        // prune audit lines pointing at lots that no longer exist
        for (key, bytes) in self.scan(&keys::all_transfers_prefix())? {
            let mut transfer: Transfer = minicbor::decode(&bytes)?;
            let before = transfer.lines.len();
            transfer.lines.retain(|line| !doomed.contains(&line.lot_id));
            if transfer.lines.len() != before {
                self.stage_put(key, minicbor::to_vec(&transfer)?);
            }
        }

        for (vaccine_id, owner) in touched {
            self.refresh_nearest_expiration(&vaccine_id, &owner)?;
        }

        log::debug!("cascade deleted {} lots rooted at {lot_id}", ordered.len());
        Ok(ordered.into_iter().map(|(id, _)| id).collect())
    }

    /// Delete an entire stock row: cascade-delete every lot under the
    /// (vaccine, owner) key, then remove the aggregate row itself.
    pub fn delete_stock(&mut self, vaccine_id: &str, owner: &Owner) -> anyhow::Result<Vec<String>> {
        let mut deleted = Vec::new();
        loop {
            let lots = self.lots_for(vaccine_id, owner)?;
            let Some(first) = lots.first() else {
                break;
            };
            let root = first.id.clone();
            deleted.extend(self.delete_lot_cascade(&root)?);
        }
        self.aggregate_for_update(vaccine_id, owner)?;
        self.stage_delete(keys::aggregate_key(vaccine_id, owner));
        Ok(deleted)
    }

    // ---- dose reservation gateway -------------------------------------

    /// Reserve exactly one dose for a scheduled appointment. The dose is
    /// permanently debited here; completing the appointment later only
    /// discards the hold.
    pub fn reserve_dose(
        &mut self,
        schedule_id: &str,
        vaccine_id: &str,
        owner: &Owner,
    ) -> anyhow::Result<Reservation> {
        let key = keys::reservation_key(schedule_id);
        if self.get_decoded::<Reservation>(&key)?.is_some() {
            return Err(LedgerError::ReservationExists(schedule_id.to_string()).into());
        }

        let allocations = self.consume_lots(vaccine_id, owner, 1)?;
        let allocation = allocations
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("allocation returned no lots for one dose"))?;

        let reservation = Reservation {
            schedule_id: schedule_id.to_string(),
            lot_id: allocation.lot_id,
            quantity: allocation.quantity,
        };
        self.stage_put(key, minicbor::to_vec(&reservation)?);
        Ok(reservation)
    }

    /// Credit doses back onto the exact lot they were drawn from. Never
    /// clamps: crediting past the lot's original size is rejected.
    pub fn release_dose(
        &mut self,
        vaccine_id: &str,
        owner: &Owner,
        lot_id: &str,
        quantity: u64,
    ) -> anyhow::Result<()> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity.into());
        }
        let Some(loc) = self.locator(lot_id)? else {
            return Err(LedgerError::LotNotFound(lot_id.to_string()).into());
        };
        if loc.vaccine_id != vaccine_id || &loc.owner != owner {
            return Err(LedgerError::OwnerMismatch {
                lot_id: lot_id.to_string(),
            }
            .into());
        }

        let lot_key = keys::lot_key(vaccine_id, owner, lot_id);
        let Some(mut lot) = self.get_decoded::<StockLot>(&lot_key)? else {
            return Err(LedgerError::LotNotFound(lot_id.to_string()).into());
        };
        let credited = lot
            .remaining_quantity
            .checked_add(quantity)
            .filter(|credited| *credited <= lot.quantity)
            .ok_or(LedgerError::InvalidQuantity)?;
        lot.remaining_quantity = credited;
        self.put_lot(&lot)?;

        let mut agg = self.aggregate_for_update(vaccine_id, owner)?;
        agg.credit(quantity);
        self.put_aggregate(vaccine_id, owner, &agg)?;
        self.refresh_nearest_expiration(vaccine_id, owner)
    }

    /// Cancelled appointment: return the reserved dose to its lot and drop
    /// the hold. A reservation whose lot was cascade-deleted in the
    /// meantime is simply dropped, there is nothing left to credit.
    pub fn cancel_reservation(&mut self, schedule_id: &str) -> anyhow::Result<()> {
        let key = keys::reservation_key(schedule_id);
        let Some(reservation) = self.get_decoded::<Reservation>(&key)? else {
            return Err(LedgerError::ReservationNotFound(schedule_id.to_string()).into());
        };

        if let Some(loc) = self.locator(&reservation.lot_id)? {
            self.release_dose(
                &loc.vaccine_id,
                &loc.owner,
                &reservation.lot_id,
                reservation.quantity,
            )?;
        }
        self.stage_delete(key);
        Ok(())
    }

    /// Completed appointment: the dose was administered, the debit made at
    /// reservation time stands. Only the hold is discarded.
    pub fn complete_reservation(&mut self, schedule_id: &str) -> anyhow::Result<()> {
        let key = keys::reservation_key(schedule_id);
        if self.get_decoded::<Reservation>(&key)?.is_none() {
            return Err(LedgerError::ReservationNotFound(schedule_id.to_string()).into());
        }
        self.stage_delete(key);
        Ok(())
    }

    // ---- commit --------------------------------------------------------

    /// Apply every staged write in one sled transaction. Each aggregate
    /// loaded for mutation is re-checked against the version first
    /// observed; a concurrent writer on the same key aborts with
    /// `StaleAggregate` and nothing is applied.
    pub fn commit(self) -> anyhow::Result<()> {
        let UnitOfWork {
            db,
            staged,
            observed,
        } = self;
        if staged.is_empty() {
            return Ok(());
        }

        let result = db.transaction(|tx| {
            for (key, seen) in &observed {
                let current = match tx.get(key.as_slice())? {
                    Some(bytes) => {
                        let agg: AggregateStock = minicbor::decode(&bytes).map_err(|_| {
                            ConflictableTransactionError::Abort(LedgerError::CorruptRecord(
                                String::from_utf8_lossy(key).into_owned(),
                            ))
                        })?;
                        Some(agg.version)
                    }
                    None => None,
                };
                if current != *seen {
                    return Err(ConflictableTransactionError::Abort(
                        LedgerError::StaleAggregate(String::from_utf8_lossy(key).into_owned()),
                    ));
                }
            }
            for (key, value) in &staged {
                match value {
                    Some(bytes) => {
                        tx.insert(key.as_slice(), bytes.as_slice())?;
                    }
                    None => {
                        tx.remove(key.as_slice())?;
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(err)) => Err(err.into()),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }
}
