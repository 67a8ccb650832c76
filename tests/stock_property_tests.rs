//! Property-based tests for ledger accounting invariants
//!
//! This module uses the proptest crate to verify that the conservation and
//! allocation invariants hold across a wide range of randomly generated
//! operation sequences, not just the specific cases in the unit tests.

use proptest::prelude::*;
use std::sync::Arc;
use stock_ledger::error::LedgerError;
use stock_ledger::lot::TimeStamp;
use stock_ledger::owner::Owner;
use stock_ledger::service::{StockLedger, UnitOfWork};

fn open_ledger() -> (tempfile::TempDir, StockLedger) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db = sled::open(temp_dir.path().join("prop.db")).unwrap();
    db.clear().unwrap();
    (temp_dir, StockLedger::new(Arc::new(db)))
}

fn fixed_now() -> TimeStamp<chrono::Utc> {
    TimeStamp::new_with(2026, 1, 1, 0, 0, 0)
}

/// Sum of remaining doses over every lot under one (vaccine, owner) key.
fn remaining_sum(uow: &UnitOfWork<'_>, vaccine_id: &str, owner: &Owner) -> u64 {
    uow.lots_for(vaccine_id, owner)
        .unwrap()
        .iter()
        .map(|lot| lot.remaining_quantity)
        .sum()
}

fn aggregate_quantity(uow: &UnitOfWork<'_>, vaccine_id: &str, owner: &Owner) -> u64 {
    uow.aggregate(vaccine_id, owner)
        .unwrap()
        .map(|agg| agg.quantity)
        .unwrap_or(0)
}

// PROPERTY TEST STRATEGIES

/// One step against a single (vaccine, owner) key: an intake of some size
/// and expiration offset, or a consumption request.
#[derive(Debug, Clone)]
enum LedgerOp {
    Add { quantity: u64, days_out: u32 },
    Consume { quantity: u64 },
}

fn ledger_op_strategy() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (1u64..=50, 1u32..=27).prop_map(|(quantity, days_out)| LedgerOp::Add { quantity, days_out }),
        (1u64..=60).prop_map(|quantity| LedgerOp::Consume { quantity }),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<LedgerOp>> {
    prop::collection::vec(ledger_op_strategy(), 1..12)
}

/// Distinct lot sizes paired with strictly increasing expiration days.
fn lot_layout_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..=20, 2..6)
}

// PROPERTY TESTS
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: after any sequence of intakes and consumptions on a fixed
    /// (vaccine, owner), the cached aggregate quantity equals the sum of
    /// remaining quantities over that owner's lots.
    #[test]
    fn prop_aggregate_mirrors_lot_remainders(ops in ops_strategy()) {
        let (_tmp, ledger) = open_ledger();
        let now = fixed_now();
        let owner = Owner::district("d1");
        let mut uow = ledger.begin();

        for op in ops {
            match op {
                LedgerOp::Add { quantity, days_out } => {
                    uow.add_stock(
                        "bcg",
                        &owner,
                        quantity,
                        TimeStamp::new_with(2026, 2, days_out, 0, 0, 0),
                        &now,
                    ).unwrap();
                }
                LedgerOp::Consume { quantity } => {
                    // insufficiency must leave the books balanced too
                    let _ = uow.consume_lots("bcg", &owner, quantity);
                }
            }
            prop_assert_eq!(
                aggregate_quantity(&uow, "bcg", &owner),
                remaining_sum(&uow, "bcg", &owner)
            );
        }

        uow.commit().unwrap();
        let uow = ledger.begin();
        prop_assert_eq!(
            aggregate_quantity(&uow, "bcg", &owner),
            remaining_sum(&uow, "bcg", &owner)
        );
    }

    /// Property: allocation never draws from a later-expiring lot while an
    /// earlier-expiring lot still has doses left after it.
    #[test]
    fn prop_allocation_is_earliest_expiration_first(
        sizes in lot_layout_strategy(),
        request_fraction in 1u64..=100,
    ) {
        let (_tmp, ledger) = open_ledger();
        let now = fixed_now();
        let owner = Owner::regional("r1");
        let mut uow = ledger.begin();

        let mut by_expiration = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let lot = uow.add_stock(
                "bcg",
                &owner,
                *size,
                TimeStamp::new_with(2026, 2, 1 + i as u32, 0, 0, 0),
                &now,
            ).unwrap();
            by_expiration.push(lot.id);
        }

        let total: u64 = sizes.iter().sum();
        let request = (total * request_fraction / 100).max(1);
        let allocations = uow.consume_lots("bcg", &owner, request).unwrap();

        prop_assert_eq!(allocations.iter().map(|a| a.quantity).sum::<u64>(), request);

        // allocations come back in expiration order, and every lot before
        // the last allocated one is fully drained
        let positions: Vec<usize> = allocations
            .iter()
            .map(|a| by_expiration.iter().position(|id| id == &a.lot_id).unwrap())
            .collect();
        for pair in positions.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        if let Some(&last) = positions.last() {
            for id in &by_expiration[..last] {
                prop_assert_eq!(uow.lot(id).unwrap().unwrap().remaining_quantity, 0);
            }
        }
    }

    /// Property: reserve followed by cancel restores the lot's remaining
    /// quantity exactly, for any prior stock layout.
    #[test]
    fn prop_reserve_then_cancel_is_a_stock_no_op(sizes in lot_layout_strategy()) {
        let (_tmp, ledger) = open_ledger();
        let now = fixed_now();
        let owner = Owner::health_center("hc1");
        let mut uow = ledger.begin();

        for (i, size) in sizes.iter().enumerate() {
            uow.add_stock(
                "bcg",
                &owner,
                *size,
                TimeStamp::new_with(2026, 2, 1 + i as u32, 0, 0, 0),
                &now,
            ).unwrap();
        }

        let before: Vec<(String, u64)> = uow
            .lots_for("bcg", &owner)
            .unwrap()
            .into_iter()
            .map(|lot| (lot.id, lot.remaining_quantity))
            .collect();

        let reservation = uow.reserve_dose("sched-1", "bcg", &owner).unwrap();
        prop_assert_eq!(reservation.quantity, 1);
        uow.cancel_reservation("sched-1").unwrap();

        for (id, remaining) in before {
            prop_assert_eq!(uow.lot(&id).unwrap().unwrap().remaining_quantity, remaining);
        }
        prop_assert_eq!(
            aggregate_quantity(&uow, "bcg", &owner),
            remaining_sum(&uow, "bcg", &owner)
        );
    }

    /// Property: a transfer's lines always sum to the requested quantity
    /// and every destination lot mirrors exactly one source line.
    #[test]
    fn prop_transfer_lines_conserve_quantity(
        sizes in lot_layout_strategy(),
        request_fraction in 1u64..=100,
    ) {
        let (_tmp, ledger) = open_ledger();
        let now = fixed_now();
        let from = Owner::regional("r1");
        let to = Owner::district("d1");
        let mut uow = ledger.begin();

        for (i, size) in sizes.iter().enumerate() {
            uow.add_stock(
                "bcg",
                &from,
                *size,
                TimeStamp::new_with(2026, 2, 1 + i as u32, 0, 0, 0),
                &now,
            ).unwrap();
        }

        let total: u64 = sizes.iter().sum();
        let request = (total * request_fraction / 100).max(1);
        let transfer = uow.transfer_stock("bcg", &from, &to, request, &now).unwrap();

        prop_assert_eq!(transfer.quantity, request);
        prop_assert_eq!(transfer.lines.iter().map(|l| l.quantity).sum::<u64>(), request);

        let derived = uow.lots_for("bcg", &to).unwrap();
        prop_assert_eq!(derived.len(), transfer.lines.len());
        for lot in derived {
            let source = lot.source_lot_id.as_deref().unwrap();
            let line = transfer.lines.iter().find(|l| l.lot_id == source);
            prop_assert!(line.is_some());
            prop_assert_eq!(line.unwrap().quantity, lot.quantity);
        }

        // conservation across both sides of the move
        prop_assert_eq!(aggregate_quantity(&uow, "bcg", &from), total - request);
        prop_assert_eq!(aggregate_quantity(&uow, "bcg", &to), request);
    }
}

/// Consumption requests that exceed availability must not change any lot,
/// regardless of how the stock is laid out.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_insufficiency_never_mutates(sizes in lot_layout_strategy()) {
        let (_tmp, ledger) = open_ledger();
        let now = fixed_now();
        let owner = Owner::regional("r1");
        let mut uow = ledger.begin();

        for (i, size) in sizes.iter().enumerate() {
            uow.add_stock(
                "bcg",
                &owner,
                *size,
                TimeStamp::new_with(2026, 2, 1 + i as u32, 0, 0, 0),
                &now,
            ).unwrap();
        }
        let total: u64 = sizes.iter().sum();

        let err = uow.consume_lots("bcg", &owner, total + 1).unwrap_err();
        prop_assert_eq!(
            err.downcast_ref::<LedgerError>(),
            Some(&LedgerError::InsufficientStock {
                requested: total + 1,
                available: total
            })
        );
        prop_assert_eq!(remaining_sum(&uow, "bcg", &owner), total);
        prop_assert_eq!(aggregate_quantity(&uow, "bcg", &owner), total);
    }
}
