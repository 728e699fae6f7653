use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::coupon::{self, DiscountType},
    errors::ServiceError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejection {
    NotFound,
    NotYetValid,
    Expired,
    UsageLimitReached,
    EmptyCart,
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "coupon code does not exist",
            Self::NotYetValid => "coupon is not active yet",
            Self::Expired => "coupon has expired",
            Self::UsageLimitReached => "coupon usage limit reached",
            Self::EmptyCart => "cart is empty",
        })
    }
}

/// Result of applying a code to a cart subtotal.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CouponApplication {
    pub code: String,
    pub valid: bool,
    pub discount_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CouponRejection>,
}

impl CouponApplication {
    fn rejected(code: String, reason: CouponRejection) -> Self {
        Self {
            code,
            valid: false,
            discount_amount: Decimal::ZERO,
            reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<Self, ServiceError> {
        match self.reason {
            Some(reason) => Err(ServiceError::InvalidCoupon(format!(
                "{}: {}",
                self.code, reason
            ))),
            None => Ok(self),
        }
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// `min(value, subtotal)` for fixed coupons, `subtotal * value%` for
/// percentage coupons; never more than the subtotal.
pub fn compute_discount(discount_type: DiscountType, value: Decimal, subtotal: Decimal) -> Decimal {
    if subtotal <= Decimal::ZERO || value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = match discount_type {
        DiscountType::Fixed => value,
        DiscountType::Percentage => {
            let pct = value.min(Decimal::ONE_HUNDRED);
            (subtotal * pct / Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        }
    };
    raw.min(subtotal)
}

/// Pure validation and discount computation.
pub fn apply(
    subtotal: Decimal,
    code: &str,
    coupon: Option<&coupon::Model>,
    now: DateTime<Utc>,
) -> CouponApplication {
    let code = normalize_code(code);
    let Some(coupon) = coupon else {
        return CouponApplication::rejected(code, CouponRejection::NotFound);
    };
    if now < coupon.valid_from {
        return CouponApplication::rejected(code, CouponRejection::NotYetValid);
    }
    if now > coupon.valid_until {
        return CouponApplication::rejected(code, CouponRejection::Expired);
    }
    if coupon.used_count >= coupon.usage_limit {
        return CouponApplication::rejected(code, CouponRejection::UsageLimitReached);
    }
    if subtotal <= Decimal::ZERO {
        return CouponApplication::rejected(code, CouponRejection::EmptyCart);
    }

    CouponApplication {
        code,
        valid: true,
        discount_amount: compute_discount(coupon.discount_type, coupon.value, subtotal),
        reason: None,
    }
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct NewCoupon {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[validate(range(min = 1))]
    pub usage_limit: i32,
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn evaluate(&self, subtotal: Decimal, code: &str) -> Result<CouponApplication, ServiceError> {
        let coupon = self.find(code).await?;
        let application = apply(subtotal, code, coupon.as_ref(), Utc::now());
        debug!(valid = application.valid, discount = %application.discount_amount, "coupon evaluated");
        Ok(application)
    }

    /// Consumes one use inside the caller's transaction. Returns `false` when
    /// the coupon is exhausted (or gone), leaving the counter untouched.
    pub async fn redeem_within<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
    ) -> Result<bool, ServiceError> {
        let result = coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .filter(Expr::col(coupon::Column::UsedCount).lt(Expr::col(coupon::Column::UsageLimit)))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn create(&self, input: NewCoupon) -> Result<coupon::Model, ServiceError> {
        input.validate()?;
        if input.valid_until < input.valid_from {
            return Err(ServiceError::ValidationError(
                "valid_until must not precede valid_from".to_string(),
            ));
        }
        if input.value <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "coupon value must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let coupon = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(normalize_code(&input.code)),
            discount_type: Set(input.discount_type),
            value: Set(input.value),
            valid_from: Set(input.valid_from),
            valid_until: Set(input.valid_until),
            usage_limit: Set(input.usage_limit),
            used_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;
        Ok(coupon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn coupon(discount_type: DiscountType, value: Decimal) -> coupon::Model {
        let now = Utc::now();
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE".into(),
            discount_type,
            value,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
            usage_limit: 10,
            used_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[rstest]
    #[case(DiscountType::Fixed, dec!(200), dec!(1100), dec!(200))]
    #[case(DiscountType::Fixed, dec!(2000), dec!(1100), dec!(1100))]
    #[case(DiscountType::Percentage, dec!(10), dec!(1100), dec!(110))]
    #[case(DiscountType::Percentage, dec!(150), dec!(80), dec!(80))]
    #[case(DiscountType::Percentage, dec!(12.5), dec!(99.99), dec!(12.50))]
    fn discount_math(
        #[case] kind: DiscountType,
        #[case] value: Decimal,
        #[case] subtotal: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_eq!(compute_discount(kind, value, subtotal), expected);
    }

    #[test]
    fn codes_are_normalized() {
        let c = coupon(DiscountType::Fixed, dec!(50));
        let result = apply(dec!(100), "  save ", Some(&c), Utc::now());
        assert!(result.valid);
        assert_eq!(result.code, "SAVE");
    }

    #[test]
    fn expired_and_exhausted_coupons_are_rejected() {
        let now = Utc::now();
        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.valid_until = now - Duration::hours(1);
        assert_eq!(
            apply(dec!(100), "SAVE", Some(&c), now).reason,
            Some(CouponRejection::Expired)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.valid_from = now + Duration::hours(1);
        assert_eq!(
            apply(dec!(100), "SAVE", Some(&c), now).reason,
            Some(CouponRejection::NotYetValid)
        );

        let mut c = coupon(DiscountType::Fixed, dec!(50));
        c.used_count = c.usage_limit;
        let rejected = apply(dec!(100), "SAVE", Some(&c), now);
        assert!(!rejected.valid);
        assert_eq!(rejected.discount_amount, Decimal::ZERO);
        assert!(matches!(
            rejected.into_result(),
            Err(ServiceError::InvalidCoupon(_))
        ));
    }

    #[test]
    fn unknown_code_is_not_found() {
        assert_eq!(
            apply(dec!(100), "NOPE", None, Utc::now()).reason,
            Some(CouponRejection::NotFound)
        );
    }
}
