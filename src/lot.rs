//! Core stock lot types and the timestamp wrapper used for expirations
use super::error::LedgerError;
use super::owner::Owner;
use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    /// Parse boundary input (RFC 3339) into a ledger timestamp. Expiration
    /// dates arrive from the outside as strings and must be rejected here
    /// rather than stored unparsed.
    pub fn parse_rfc3339(input: &str) -> Result<Self, LedgerError> {
        DateTime::parse_from_rfc3339(input)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|_| LedgerError::InvalidExpiration(input.to_string()))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotStatus {
    #[n(0)]
    Valid,
    #[n(1)]
    Expired,
}

/// One physical batch of doses. `quantity` is the original lot size and
/// never changes; `remaining_quantity` is decremented by allocation and
/// credited back by dose release. `source_lot_id` links a lot created as
/// the destination side of a transfer back to the lot it was split from.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockLot {
    #[n(0)]
    pub id: String, // uuid7, bech32 "lot_" prefix
    #[n(1)]
    pub vaccine_id: String,
    #[n(2)]
    pub owner: Owner,
    #[n(3)]
    pub quantity: u64,
    #[n(4)]
    pub remaining_quantity: u64,
    #[n(5)]
    pub expiration: TimeStamp<Utc>,
    #[n(6)]
    pub status: LotStatus,
    #[n(7)]
    pub source_lot_id: Option<String>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>, // stable tie-break for same-expiration lots
}

impl StockLot {
    pub fn is_allocatable(&self) -> bool {
        self.status == LotStatus::Valid && self.remaining_quantity > 0
    }
}

/// Output of one allocation step: a debit of `quantity` doses against a
/// single lot. One request may fan out into several of these when the
/// earliest-expiring lot cannot cover it alone. Not persisted on its own;
/// transfers and reservations are derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub lot_id: String,
    pub quantity: u64,
    pub expiration: TimeStamp<Utc>,
    pub status: LotStatus,
}
