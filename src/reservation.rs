//! Single-dose holds tied to scheduled appointments

/// Ties exactly one appointment to exactly one lot allocation. The dose
/// is debited from the lot when the reservation is created; cancelling
/// credits it back, completing simply discards the hold.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    #[n(0)]
    pub schedule_id: String,
    #[n(1)]
    pub lot_id: String,
    #[n(2)]
    pub quantity: u64, // always 1: one appointment reserves one dose
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_encoding() {
        let original = Reservation {
            schedule_id: "sched-77".into(),
            lot_id: "lot_1abc".into(),
            quantity: 1,
        };

        let encoding = minicbor::to_vec(&original).unwrap();
        let decode: Reservation = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }
}
