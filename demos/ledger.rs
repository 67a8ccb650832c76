//! End-to-end walkthrough: national intake, a transfer down the
//! hierarchy, a dose reservation, and a cascade deletion.

use std::sync::Arc;
use stock_ledger::lot::TimeStamp;
use stock_ledger::owner::Owner;
use stock_ledger::service::StockLedger;

fn main() -> anyhow::Result<()> {
    let db = sled::open("ledger-demo")?;

    if !db.is_empty() {
        db.clear()?;
    }

    let ledger = StockLedger::new(Arc::new(db));
    let now = TimeStamp::now();
    let expiration = TimeStamp::parse_rfc3339("2027-06-30T00:00:00Z")?;

    let region = Owner::regional("north");

    // national intake of one lot
    let mut uow = ledger.begin();
    let intake = uow.add_stock("bcg", &Owner::National, 100, expiration, &now)?;
    uow.commit()?;
    println!("intake lot: {:#?}", intake);

    // move 40 doses down to the region
    let mut uow = ledger.begin();
    let transfer = uow.transfer_stock("bcg", &Owner::National, &region, 40, &now)?;
    uow.commit()?;
    println!("transfer: {:#?}", transfer);

    // one appointment reserves one dose at the region
    let mut uow = ledger.begin();
    let reservation = uow.reserve_dose("sched-1", "bcg", &region)?;
    uow.commit()?;
    println!("reservation: {:#?}", reservation);

    let uow = ledger.begin();
    println!("national aggregate: {:#?}", uow.aggregate("bcg", &Owner::National)?);
    println!("regional aggregate: {:#?}", uow.aggregate("bcg", &region)?);

    // deleting the intake lot takes its regional descendant with it
    let mut uow = ledger.begin();
    let deleted = uow.delete_lot_cascade(&intake.id)?;
    uow.commit()?;
    println!("cascade removed {} lots", deleted.len());

    Ok(())
}
