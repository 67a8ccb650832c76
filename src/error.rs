#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Quantity must be a positive whole number of doses")]
    InvalidQuantity,
    #[error("Expiration date could not be parsed: {0}")]
    InvalidExpiration(String),
    #[error("Insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: u64, available: u64 },
    #[error("No stock lot exists with id {0}")]
    LotNotFound(String),
    #[error("Lot {lot_id} does not belong to the given vaccine/owner pair")]
    OwnerMismatch { lot_id: String },
    #[error("No reservation exists for schedule {0}")]
    ReservationNotFound(String),
    #[error("Schedule {0} already holds a reservation")]
    ReservationExists(String),
    #[error("Aggregate stock for {0} was modified by a concurrent writer")]
    StaleAggregate(String),
    #[error("Stored record at {0} could not be decoded")]
    CorruptRecord(String),
}
