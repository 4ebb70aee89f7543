//! Share computation for a single order.
//!
//! Everything here is pure: given an order amount and a list of share rules it
//! returns integer minor-unit shares whose sum never exceeds the order amount.

use super::money::{Amount, Ratio};
use crate::error::{DivisionError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a single receiver's share is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareRule {
    Ratio(Ratio),
    Fixed(Amount),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareRequest {
    pub receiver_id: u64,
    pub rule: ShareRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    pub receiver_id: u64,
    pub amount: Amount,
}

/// What happens to the part of the order amount no receiver is owed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum RemainderPolicy {
    /// The merchant keeps the remainder, including floor-rounding dust.
    #[default]
    Keep,
    /// Whatever is left after fixed shares is spread over the ratio receivers
    /// in proportion to their ratios.
    ProRata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub order_amount: Amount,
    /// Positive shares only, in request order.
    pub shares: Vec<Share>,
    /// Amount left with the merchant.
    pub remainder: Amount,
}

impl SplitPlan {
    pub fn allocated(&self) -> Amount {
        self.shares.iter().map(|s| s.amount).sum()
    }

    /// True when nothing is owed to any receiver and the order should be
    /// finalized instead of split.
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}

/// Computes per-receiver shares for `order_amount`.
///
/// Fails with [`DivisionError::InvalidSplitConfig`] when ratios add up to more
/// than 100%, a fixed amount exceeds the order amount, or a receiver is listed
/// twice. Fails with [`DivisionError::IntegrityViolation`] when the resulting
/// shares would exceed the order amount.
pub fn compute_shares(
    order_amount: Amount,
    requests: &[ShareRequest],
    policy: RemainderPolicy,
) -> Result<SplitPlan> {
    if order_amount.is_zero() {
        return Err(DivisionError::InvalidSplitConfig(
            "order amount must be positive".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(requests.len());
    let mut ratio_total = Decimal::ZERO;
    let mut fixed_total = Amount::ZERO;
    for request in requests {
        if !seen.insert(request.receiver_id) {
            return Err(DivisionError::InvalidSplitConfig(format!(
                "receiver {} listed more than once",
                request.receiver_id
            )));
        }
        match request.rule {
            ShareRule::Ratio(ratio) => ratio_total += ratio.value(),
            ShareRule::Fixed(amount) => {
                if amount > order_amount {
                    return Err(DivisionError::InvalidSplitConfig(format!(
                        "fixed amount {amount} for receiver {} exceeds order amount {order_amount}",
                        request.receiver_id
                    )));
                }
                fixed_total = fixed_total.checked_add(amount).ok_or_else(|| {
                    DivisionError::IntegrityViolation("fixed amounts overflow".to_string())
                })?;
            }
        }
    }
    if ratio_total > Decimal::ONE {
        return Err(DivisionError::InvalidSplitConfig(format!(
            "ratios sum to {ratio_total}, more than 100%"
        )));
    }
    let pool = order_amount.checked_sub(fixed_total).ok_or_else(|| {
        DivisionError::IntegrityViolation(format!(
            "fixed shares {fixed_total} exceed order amount {order_amount}"
        ))
    })?;

    let ratio_shares = match policy {
        RemainderPolicy::Keep => floor_shares(order_amount, requests)?,
        RemainderPolicy::ProRata if ratio_total.is_zero() => floor_shares(order_amount, requests)?,
        RemainderPolicy::ProRata => pro_rata_shares(pool, requests)?,
    };

    let mut shares = Vec::with_capacity(requests.len());
    let mut ratio_iter = ratio_shares.into_iter();
    for request in requests {
        let amount = match request.rule {
            ShareRule::Fixed(amount) => amount,
            ShareRule::Ratio(_) => ratio_iter.next().unwrap_or(Amount::ZERO),
        };
        shares.push(Share {
            receiver_id: request.receiver_id,
            amount,
        });
    }

    let mut allocated = Amount::ZERO;
    for share in &shares {
        allocated = allocated.checked_add(share.amount).ok_or_else(|| {
            DivisionError::IntegrityViolation("shares overflow".to_string())
        })?;
    }
    let remainder = order_amount.checked_sub(allocated).ok_or_else(|| {
        DivisionError::IntegrityViolation(format!(
            "shares {allocated} exceed order amount {order_amount}"
        ))
    })?;

    shares.retain(|s| !s.amount.is_zero());

    Ok(SplitPlan {
        order_amount,
        shares,
        remainder,
    })
}

/// Floor of `order_amount * ratio` for every ratio request, in request order.
fn floor_shares(order_amount: Amount, requests: &[ShareRequest]) -> Result<Vec<Amount>> {
    requests
        .iter()
        .filter_map(|r| match r.rule {
            ShareRule::Ratio(ratio) => Some(ratio.share_of(order_amount)),
            ShareRule::Fixed(_) => None,
        })
        .collect()
}

/// Spreads `pool` over the ratio requests proportionally, handing out the
/// floor-rounding dust one unit at a time by largest fractional part.
///
/// Runs in integer arithmetic on the ratios' mantissas rescaled to a common
/// scale, so the result always sums to exactly `pool`.
fn pro_rata_shares(pool: Amount, requests: &[ShareRequest]) -> Result<Vec<Amount>> {
    let ratios: Vec<Decimal> = requests
        .iter()
        .filter_map(|r| match r.rule {
            ShareRule::Ratio(ratio) => Some(ratio.value().normalize()),
            ShareRule::Fixed(_) => None,
        })
        .collect();
    let scale = ratios.iter().map(|r| r.scale()).max().unwrap_or(0);

    let overflow = || {
        DivisionError::IntegrityViolation("ratio precision too high for pro-rata split".to_string())
    };
    let mut weights = Vec::with_capacity(ratios.len());
    for ratio in &ratios {
        let factor = 10u128
            .checked_pow(scale - ratio.scale())
            .ok_or_else(overflow)?;
        let mantissa = u128::try_from(ratio.mantissa()).map_err(|_| overflow())?;
        weights.push(mantissa.checked_mul(factor).ok_or_else(overflow)?);
    }
    let total_weight: u128 = weights.iter().sum();
    if total_weight == 0 {
        return Ok(vec![Amount::ZERO; weights.len()]);
    }

    let pool_units = u128::from(pool.value());
    let mut shares = Vec::with_capacity(weights.len());
    let mut fractions = Vec::with_capacity(weights.len());
    for (index, weight) in weights.iter().enumerate() {
        let numerator = pool_units.checked_mul(*weight).ok_or_else(overflow)?;
        shares.push(numerator / total_weight);
        fractions.push((numerator % total_weight, index));
    }

    let distributed: u128 = shares.iter().sum();
    let mut dust = pool_units - distributed;
    // Largest fractional part first; ties go to the earlier receiver.
    fractions.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, index) in fractions {
        if dust == 0 {
            break;
        }
        if weights[index] > 0 {
            shares[index] += 1;
            dust -= 1;
        }
    }

    shares
        .into_iter()
        .map(|units| u64::try_from(units).map(Amount::new).map_err(|_| overflow()))
        .collect()
}
