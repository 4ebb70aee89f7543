use paysplit::domain::money::{Amount, Ratio};
use paysplit::domain::split::{RemainderPolicy, ShareRequest, ShareRule, compute_shares};
use paysplit::error::DivisionError;
use rand::Rng;
use rust_decimal::Decimal;

fn random_requests(rng: &mut impl Rng, order_amount: u64) -> Vec<ShareRequest> {
    let count = rng.gen_range(1..=8);
    let mut budget: u32 = 10_000;
    let mut requests = Vec::with_capacity(count);
    for id in 1..=count as u64 {
        let rule = if rng.gen_bool(0.2) {
            ShareRule::Fixed(Amount::new(rng.gen_range(0..=order_amount / 10)))
        } else {
            // Basis points keep the ratio total at or under 100%.
            let bps = rng.gen_range(0..=budget.min(4_000));
            budget -= bps;
            ShareRule::Ratio(Ratio::new(Decimal::new(bps.into(), 4)).unwrap())
        };
        requests.push(ShareRequest {
            receiver_id: id,
            rule,
        });
    }
    requests
}

#[test]
fn test_shares_never_exceed_order_amount() {
    let mut rng = rand::thread_rng();
    for _ in 0..2_000 {
        let order_amount = rng.gen_range(1..=10_000_000);
        let requests = random_requests(&mut rng, order_amount);
        for policy in [RemainderPolicy::Keep, RemainderPolicy::ProRata] {
            let plan = match compute_shares(Amount::new(order_amount), &requests, policy) {
                Ok(plan) => plan,
                // Fixed shares alone may overshoot a small order.
                Err(DivisionError::IntegrityViolation(_)) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            };
            assert!(plan.allocated() <= plan.order_amount);
            assert_eq!(
                plan.allocated().value() + plan.remainder.value(),
                order_amount
            );
            assert!(plan.shares.iter().all(|s| !s.amount.is_zero()));
        }
    }
}

#[test]
fn test_keep_policy_floors_each_ratio_share() {
    let mut rng = rand::thread_rng();
    for _ in 0..1_000 {
        let order_amount: u64 = rng.gen_range(1..=1_000_000);
        let bps: u32 = rng.gen_range(1..=10_000);
        let ratio = Ratio::new(Decimal::new(bps.into(), 4)).unwrap();
        let requests = [ShareRequest {
            receiver_id: 1,
            rule: ShareRule::Ratio(ratio),
        }];

        let plan =
            compute_shares(Amount::new(order_amount), &requests, RemainderPolicy::Keep).unwrap();
        let expected = order_amount * u64::from(bps) / 10_000;
        assert_eq!(plan.allocated().value(), expected);
    }
}

#[test]
fn test_full_ratio_pro_rata_leaves_nothing() {
    let mut rng = rand::thread_rng();
    for _ in 0..1_000 {
        let order_amount: u64 = rng.gen_range(1..=1_000_000);
        let first: u32 = rng.gen_range(1..10_000);
        let requests = [
            ShareRequest {
                receiver_id: 1,
                rule: ShareRule::Ratio(Ratio::new(Decimal::new(first.into(), 4)).unwrap()),
            },
            ShareRequest {
                receiver_id: 2,
                rule: ShareRule::Ratio(
                    Ratio::new(Decimal::new((10_000 - first).into(), 4)).unwrap(),
                ),
            },
        ];

        let plan =
            compute_shares(Amount::new(order_amount), &requests, RemainderPolicy::ProRata).unwrap();
        assert!(plan.remainder.is_zero());
        assert_eq!(plan.allocated().value(), order_amount);
    }
}
