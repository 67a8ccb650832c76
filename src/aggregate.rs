//! Cached per-(vaccine, owner) stock counters
use super::lot::TimeStamp;
use chrono::Utc;

/// The cached totals for one (vaccine, owner) pair: the sum of
/// `remaining_quantity` over that owner's lots, and the expiration of the
/// soonest-expiring valid lot that still has doses. `version` increments
/// on every mutation and is re-checked when the unit of work commits, so
/// two writers racing on the same key cannot both land.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateStock {
    #[n(0)]
    pub quantity: u64,
    #[n(1)]
    pub nearest_expiration: Option<TimeStamp<Utc>>,
    #[n(2)]
    pub version: u64,
}

impl AggregateStock {
    pub fn credit(&mut self, amount: u64) {
        self.quantity += amount;
        self.version += 1;
    }
    /// Debit floors at zero rather than underflowing: cascade deletion
    /// reverses counters that may already have been corrected by hand in
    /// the enclosing system.
    pub fn debit(&mut self, amount: u64) {
        self.quantity = self.quantity.saturating_sub(amount);
        self.version += 1;
    }
    pub fn set_nearest_expiration(&mut self, nearest: Option<TimeStamp<Utc>>) {
        self.nearest_expiration = nearest;
        self.version += 1;
    }
}
