// Hotness Scoring
//
// Pure scoring of how "hot" a tag is from its usage, recency and promotion
// history, and the thresholds that map a score onto a tier:
//
//   age_penalty     = ln(days(now - created_at) + 2)
//   recency_factor  = 1 / (days(now - last_used_at) + 1)
//   promotion_boost = 1.5 if promoted less than 7 days ago, else 1.0
//   hotness         = round3(use_count * recency_factor * promotion_boost / age_penalty)
//
// `days` is whole elapsed days, floored and never negative.

use crate::types::{TagMetrics, Tier};
use chrono::{DateTime, Utc};

/// Hotness at or above which a tag is hot
pub const HOT_THRESHOLD: f64 = 5.0;

/// Hotness at or above which a tag is at least warm
pub const WARM_THRESHOLD: f64 = 1.0;

/// Promotions younger than this many days boost the score
const PROMOTION_WINDOW_DAYS: i64 = 7;

const PROMOTION_BOOST: f64 = 1.5;

/// Whole days elapsed from `then` to `now`; future timestamps count as now
fn elapsed_days(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    (now - then).num_days().max(0)
}

/// Compute the hotness score of one tag at `now`
pub fn compute_hotness(metrics: &TagMetrics, now: DateTime<Utc>) -> f64 {
    let age_days = elapsed_days(now, metrics.created_at) + 1;
    let age_penalty = ((age_days + 1) as f64).ln();

    let days_since_use = elapsed_days(now, metrics.last_used_at);
    let recency_factor = 1.0 / (days_since_use + 1) as f64;

    let promotion_boost = match metrics.last_promoted_at {
        Some(promoted) if elapsed_days(now, promoted) < PROMOTION_WINDOW_DAYS => PROMOTION_BOOST,
        _ => 1.0,
    };

    let use_count = metrics.use_count.max(0) as f64;
    let hotness = use_count * recency_factor * promotion_boost / age_penalty;

    (hotness * 1000.0).round() / 1000.0
}

/// Map a hotness score to its tier; lower bounds are inclusive
pub fn determine_tier(hotness: f64) -> Tier {
    if hotness >= HOT_THRESHOLD {
        Tier::Hot
    } else if hotness >= WARM_THRESHOLD {
        Tier::Warm
    } else {
        Tier::Cold
    }
}
