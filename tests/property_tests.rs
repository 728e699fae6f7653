use proptest::prelude::*;
use rust_decimal::Decimal;
use storefront_api::{
    entities::{coupon::DiscountType, order},
    services::{
        checkout::{compute_totals, Totals},
        coupons::compute_discount,
        ShippingPolicy,
    },
};

fn money() -> impl Strategy<Value = Decimal> {
    // paise precision up to ₹1,00,000
    (0i64..10_000_000).prop_map(|paise| Decimal::new(paise, 2))
}

fn discount_type() -> impl Strategy<Value = DiscountType> {
    prop_oneof![Just(DiscountType::Fixed), Just(DiscountType::Percentage)]
}

fn policy() -> impl Strategy<Value = ShippingPolicy> {
    (0i64..20_000, 0i64..500_000).prop_map(|(rate, threshold)| ShippingPolicy {
        flat_rate: Decimal::new(rate, 2),
        free_threshold: Decimal::new(threshold, 2),
    })
}

proptest! {
    #[test]
    fn discount_never_exceeds_subtotal(
        kind in discount_type(),
        value in money(),
        subtotal in money(),
    ) {
        let discount = compute_discount(kind, value, subtotal);
        prop_assert!(discount >= Decimal::ZERO);
        prop_assert!(discount <= subtotal);
    }

    #[test]
    fn percentage_discount_is_proportional(pct in 0u32..=100, subtotal in money()) {
        let discount = compute_discount(DiscountType::Percentage, Decimal::from(pct), subtotal);
        let exact = subtotal * Decimal::from(pct) / Decimal::ONE_HUNDRED;
        prop_assert!((discount - exact).abs() <= Decimal::new(1, 2));
    }

    #[test]
    fn totals_are_internally_consistent(
        subtotal in money(),
        discount in money(),
        policy in policy(),
    ) {
        let Totals { subtotal: s, discount: d, shipping_charges: c, total_amount: t } =
            compute_totals(subtotal, discount, policy);

        prop_assert_eq!(s, subtotal);
        prop_assert!(d <= s);
        prop_assert_eq!(t, s - d + c);
        prop_assert!(order::totals_consistent(s, d, c, t));

        if s - d >= policy.free_threshold {
            prop_assert_eq!(c, Decimal::ZERO);
        } else {
            prop_assert_eq!(c, policy.flat_rate);
        }
    }

    #[test]
    fn coupon_then_totals_stays_non_negative(
        kind in discount_type(),
        value in money(),
        subtotal in money(),
        policy in policy(),
    ) {
        let discount = compute_discount(kind, value, subtotal);
        let totals = compute_totals(subtotal, discount, policy);
        prop_assert!(totals.total_amount >= Decimal::ZERO);
        prop_assert_eq!(totals.discount, discount);
    }
}
