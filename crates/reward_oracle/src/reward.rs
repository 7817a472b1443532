use serde::{Deserialize, Serialize};

use reward_oracle_store::MetricSnapshot;

pub const DEFAULT_SUBSCRIBER_UNIT: u64 = 10;
pub const DEFAULT_SUBSCRIBER_REWARD: u64 = 100;
pub const DEFAULT_VIEW_UNIT: u64 = 20;
pub const DEFAULT_VIEW_REWARD: u64 = 5;

/// Converts counter deltas into whole reward units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPolicy {
    pub subscriber_unit: u64,
    pub subscriber_reward: u64,
    pub view_unit: u64,
    pub view_reward: u64,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            subscriber_unit: DEFAULT_SUBSCRIBER_UNIT,
            subscriber_reward: DEFAULT_SUBSCRIBER_REWARD,
            view_unit: DEFAULT_VIEW_UNIT,
            view_reward: DEFAULT_VIEW_REWARD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardDelta {
    pub delta_views: i64,
    pub delta_subscribers: i64,
    pub reward_amount: u64,
}

impl RewardPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.subscriber_unit == 0 {
            return Err("subscriber_unit must be positive".to_string());
        }
        if self.view_unit == 0 {
            return Err("view_unit must be positive".to_string());
        }
        Ok(())
    }

    /// Floor-divides each delta by its unit (negative deltas round toward negative
    /// infinity), sums the weighted units and clamps the total at zero. Sub-unit
    /// remainders are not tracked.
    pub fn compute(&self, prior: &MetricSnapshot, current: &MetricSnapshot) -> RewardDelta {
        let delta_views = counter_delta(prior.views, current.views);
        let delta_subscribers = counter_delta(prior.subscribers, current.subscribers);

        let subscriber_part =
            weighted_units(delta_subscribers, self.subscriber_unit, self.subscriber_reward);
        let view_part = weighted_units(delta_views, self.view_unit, self.view_reward);
        let total = subscriber_part.saturating_add(view_part);
        let reward_amount = u64::try_from(total.max(0)).unwrap_or(u64::MAX);

        RewardDelta {
            delta_views: clamp_to_i64(delta_views),
            delta_subscribers: clamp_to_i64(delta_subscribers),
            reward_amount,
        }
    }
}

fn counter_delta(prior: u64, current: u64) -> i128 {
    i128::from(current) - i128::from(prior)
}

fn weighted_units(delta: i128, unit: u64, reward: u64) -> i128 {
    let unit = i128::from(unit.max(1));
    delta
        .div_euclid(unit)
        .saturating_mul(i128::from(reward))
}

fn clamp_to_i64(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute(prior: (u64, u64), current: (u64, u64)) -> RewardDelta {
        RewardPolicy::default().compute(
            &MetricSnapshot::new(prior.0, prior.1),
            &MetricSnapshot::new(current.0, current.1),
        )
    }

    #[test]
    fn one_unit_of_each_counter() {
        let delta = compute((1000, 100), (1020, 110));
        assert_eq!(
            delta,
            RewardDelta {
                delta_views: 20,
                delta_subscribers: 10,
                reward_amount: 105,
            }
        );
    }

    #[test]
    fn below_threshold_yields_zero() {
        let delta = compute((1000, 100), (1005, 100));
        assert_eq!(delta.delta_views, 5);
        assert_eq!(delta.delta_subscribers, 0);
        assert_eq!(delta.reward_amount, 0);
    }

    #[test]
    fn zero_baseline_counts_everything() {
        let delta = compute((0, 0), (20, 10));
        assert_eq!(delta.reward_amount, 105);
    }

    #[test]
    fn partial_units_are_floored() {
        let delta = compute((0, 0), (39, 19));
        assert_eq!(delta.reward_amount, 100 + 5);
    }

    #[test]
    fn negative_view_delta_reduces_subscriber_reward() {
        // -1 view floors to one negative view unit.
        let delta = compute((1000, 100), (999, 110));
        assert_eq!(delta.delta_views, -1);
        assert_eq!(delta.reward_amount, 100 - 5);
    }

    #[test]
    fn negative_total_is_clamped_to_zero() {
        let delta = compute((1000, 100), (1000, 90));
        assert_eq!(delta.delta_subscribers, -10);
        assert_eq!(delta.reward_amount, 0);
    }

    #[test]
    fn custom_policy_is_applied() {
        let policy = RewardPolicy {
            subscriber_unit: 1,
            subscriber_reward: 3,
            view_unit: 100,
            view_reward: 1,
        };
        let delta = policy.compute(&MetricSnapshot::new(0, 0), &MetricSnapshot::new(250, 4));
        assert_eq!(delta.reward_amount, 12 + 2);
    }

    #[test]
    fn huge_counters_do_not_overflow() {
        let delta = compute((0, 0), (u64::MAX, u64::MAX));
        assert_eq!(delta.delta_views, i64::MAX);
        assert_eq!(delta.reward_amount, u64::MAX);
    }

    #[test]
    fn compute_is_deterministic() {
        let prior = MetricSnapshot::new(12_345, 678);
        let current = MetricSnapshot::new(99_999, 1_234);
        let policy = RewardPolicy::default();
        assert_eq!(policy.compute(&prior, &current), policy.compute(&prior, &current));
    }

    #[test]
    fn validate_rejects_zero_units() {
        let policy = RewardPolicy {
            view_unit: 0,
            ..RewardPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
