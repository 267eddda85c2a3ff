//! Address and slice laws.
//!
//! Property-based checks over the slice algebra: round trips, splice
//! composition, and offset symmetry.

use proptest::prelude::*;
use rstest::rstest;

use tracesim_core::common::addr::{
    offset, splice, uoffset, Address, AddressSlice, DynamicExtent, Extent,
};
use tracesim_core::common::bits::bitmask;
use tracesim_core::common::error::SimError;

#[rstest]
#[case(0x0000, 0x0, 0x00)]
#[case(0xDEAD_BEEF, 0xDEAD_BEEF >> 6, 0x2F)]
#[case(u64::MAX, u64::MAX >> 6, 0x3F)]
fn block_split(#[case] addr: u64, #[case] number: u64, #[case] off: u64) {
    let a = Address::from(addr);
    assert_eq!(a.block_number().value(), number);
    assert_eq!(a.block_offset().value(), off);
}

fn extents() -> impl Strategy<Value = (u32, u32)> {
    (0_u32..=64).prop_flat_map(|upper| (Just(upper), 0..=upper))
}

proptest! {
    /// A value in the slice's domain survives construction unchanged.
    #[test]
    fn slice_round_trip((upper, lower) in extents(), raw in any::<u64>()) {
        let value = raw & bitmask(upper - lower);
        let slice = AddressSlice::new(DynamicExtent::new(upper, lower), value);
        prop_assert_eq!(slice.to::<u64>(), Ok(value));
    }

    /// Splicing is associative when the extents are mutually disjoint.
    #[test]
    fn splice_associative_on_disjoint(a in 0_u64..0xFFFF, b in 0_u64..0xFFFF, c in 0_u64..0xFFFF) {
        let sa = AddressSlice::new(DynamicExtent::new(16, 0), a);
        let sb = AddressSlice::new(DynamicExtent::new(32, 16), b);
        let sc = AddressSlice::new(DynamicExtent::new(48, 32), c);

        let left = splice(splice(sa, sb), sc);
        let right = splice(sa, splice(sb, sc));
        prop_assert_eq!(left.value(), right.value());
        prop_assert_eq!(left.extent().upper(), right.extent().upper());
        prop_assert_eq!(left.extent().lower(), right.extent().lower());
    }

    /// The second argument's bits overwrite the first's within its extent.
    #[test]
    fn splice_overwrite(wide in any::<u64>(), narrow in 0_u64..0x1000) {
        let w = AddressSlice::new(DynamicExtent::new(64, 0), wide);
        let n = AddressSlice::new(DynamicExtent::new(12, 0), narrow);
        let joined = splice(w, n);
        prop_assert_eq!(joined.slice(DynamicExtent::new(12, 0)).value(), narrow);
        prop_assert_eq!(
            joined.slice(DynamicExtent::new(64, 12)).value(),
            wide >> 12
        );
    }

    /// `offset(a, b) == -offset(b, a)` whenever both are representable.
    #[test]
    fn offset_antisymmetric(a in any::<u64>(), b in any::<u64>()) {
        let sa = Address::from(a);
        let sb = Address::from(b);
        match (offset(sa, sb), offset(sb, sa)) {
            (Ok(ab), Ok(ba)) => prop_assert_eq!(ab, -ba),
            // An overflow one way must overflow the other way too, except
            // at the asymmetric i64::MIN boundary.
            (Err(_), Ok(ba)) => prop_assert_eq!(ba, i64::MIN),
            (Ok(ab), Err(_)) => prop_assert_eq!(ab, i64::MIN),
            (Err(_), Err(_)) => {}
        }
    }

    /// Unsigned offsets reject out-of-order arguments.
    #[test]
    fn uoffset_requires_order(a in any::<u64>(), b in any::<u64>()) {
        let (lo, hi) = (a.min(b), a.max(b));
        prop_assert_eq!(uoffset(Address::from(lo), Address::from(hi)), Ok(hi - lo));
        if lo != hi {
            let underflowed = matches!(
                uoffset(Address::from(hi), Address::from(lo)),
                Err(SimError::OffsetUnderflow { .. })
            );
            prop_assert!(underflowed);
        }
    }
}

#[test]
fn mismatched_extents_are_rejected() {
    let a = AddressSlice::new(DynamicExtent::new(16, 0), 1);
    let b = AddressSlice::new(DynamicExtent::new(20, 4), 1);
    assert!(matches!(offset(a, b), Err(SimError::ExtentMismatch { .. })));
    assert!(matches!(uoffset(a, b), Err(SimError::ExtentMismatch { .. })));
}

#[test]
fn narrowing_cast_reports_width() {
    let addr = Address::from(0x1FF);
    assert_eq!(addr.to::<u8>(), Err(SimError::NarrowingOverflow { value: 0x1FF, width: 8 }));
    assert_eq!(addr.to::<u16>(), Ok(0x1FF));
}
