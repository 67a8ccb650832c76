//! Sled key-space layout for the ledger
//!
//! One tree holds every record kind, namespaced by prefix:
//!   lot/<vaccine>/<owner>/<lot-id>    CBOR StockLot
//!   agg/<vaccine>/<owner>             CBOR AggregateStock
//!   xfer/<transfer-id>                CBOR Transfer
//!   resv/<schedule-id>                CBOR Reservation
//!   loc/<lot-id>                      CBOR LotLocator (lot id -> home key)
//!   kin/<parent-lot-id>/<child-lot-id>  empty (lineage edge)
//!
//! The kin/ entries materialize the derived-lot forest so cascade deletion
//! walks an index instead of scanning every lot for back-references.

use super::owner::Owner;

/// Where a lot lives: enough to rebuild its primary key from its id alone.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub(crate) struct LotLocator {
    #[n(0)]
    pub vaccine_id: String,
    #[n(1)]
    pub owner: Owner,
}

pub(crate) fn lot_key(vaccine_id: &str, owner: &Owner, lot_id: &str) -> Vec<u8> {
    format!("lot/{vaccine_id}/{}/{lot_id}", owner.key_segment()).into_bytes()
}

pub(crate) fn lot_prefix(vaccine_id: &str, owner: &Owner) -> Vec<u8> {
    format!("lot/{vaccine_id}/{}/", owner.key_segment()).into_bytes()
}

pub(crate) fn all_lots_prefix() -> Vec<u8> {
    b"lot/".to_vec()
}

pub(crate) fn aggregate_key(vaccine_id: &str, owner: &Owner) -> Vec<u8> {
    format!("agg/{vaccine_id}/{}", owner.key_segment()).into_bytes()
}

pub(crate) fn transfer_key(transfer_id: &str) -> Vec<u8> {
    format!("xfer/{transfer_id}").into_bytes()
}

pub(crate) fn all_transfers_prefix() -> Vec<u8> {
    b"xfer/".to_vec()
}

pub(crate) fn reservation_key(schedule_id: &str) -> Vec<u8> {
    format!("resv/{schedule_id}").into_bytes()
}

pub(crate) fn locator_key(lot_id: &str) -> Vec<u8> {
    format!("loc/{lot_id}").into_bytes()
}

pub(crate) fn lineage_key(parent_lot_id: &str, child_lot_id: &str) -> Vec<u8> {
    format!("kin/{parent_lot_id}/{child_lot_id}").into_bytes()
}

pub(crate) fn lineage_prefix(parent_lot_id: &str) -> Vec<u8> {
    format!("kin/{parent_lot_id}/").into_bytes()
}

/// Recover the child lot id from a lineage key produced by [`lineage_key`].
pub(crate) fn child_id_from_lineage_key(key: &[u8], parent_lot_id: &str) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.strip_prefix(&format!("kin/{parent_lot_id}/"))
        .map(str::to_string)
}
