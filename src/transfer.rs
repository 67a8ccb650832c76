//! Immutable audit records of completed inter-level moves
use super::lot::{Allocation, TimeStamp};
use super::owner::Owner;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TransferLine {
    #[n(0)]
    pub lot_id: String, // the *source* lot the doses were drawn from
    #[n(1)]
    pub quantity: u64,
}

/// Audit record of one completed move. It does not itself move inventory;
/// by the time it is recorded the source lots have been debited and the
/// derived destination lots created. Lines point at the source lots, so
/// the trail survives even though the destination lots are distinct
/// records. Cascade deletion may later prune lines naming a deleted lot;
/// `digest` fixes what was originally recorded.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    #[n(0)]
    pub id: String, // uuid7, bech32 "xfer_" prefix
    #[n(1)]
    pub vaccine_id: String,
    #[n(2)]
    pub from: Owner,
    #[n(3)]
    pub to: Owner,
    #[n(4)]
    pub quantity: u64,
    #[n(5)]
    pub lines: Vec<TransferLine>,
    #[n(6)]
    pub recorded_at: TimeStamp<Utc>,
    #[n(7)]
    pub digest: String,
}

impl Transfer {
    pub fn new(
        id: String,
        vaccine_id: String,
        from: Owner,
        to: Owner,
        allocations: &[Allocation],
        recorded_at: TimeStamp<Utc>,
    ) -> Self {
        let lines: Vec<TransferLine> = allocations
            .iter()
            .map(|a| TransferLine {
                lot_id: a.lot_id.clone(),
                quantity: a.quantity,
            })
            .collect();
        let quantity = lines.iter().map(|l| l.quantity).sum();

        let mut transfer = Self {
            id,
            vaccine_id,
            from,
            to,
            quantity,
            lines,
            recorded_at,
            digest: String::new(),
        };
        transfer.digest = transfer.compute_digest();
        transfer
    }
    /// Sha256 over the CBOR encoding of the record with the digest field
    /// blanked, taken once at record time.
    fn compute_digest(&self) -> String {
        let mut blank = self.clone();
        blank.digest = String::new();

        // Serialising a record we just built cannot fail.
        let cbor = minicbor::to_vec(&blank).unwrap_or_default();
        sha256::digest(&cbor)
    }
    /// True while the record still matches its creation-time digest, i.e.
    /// no line has been pruned by cascade deletion.
    pub fn is_intact(&self) -> bool {
        self.digest == self.compute_digest()
    }
}
