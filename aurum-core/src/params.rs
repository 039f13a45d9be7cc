use std::time::{SystemTime, UNIX_EPOCH};

/// Hard cap on circulating supply, also the ceiling on any single amount.
pub const MAX_SUPPLY: f64 = 121_000_000.0;
/// Ceiling on a single transaction fee.
pub const MAX_FEE: f64 = 1_000_000.0;
/// Canonical serialization size ceiling per transaction.
pub const MAX_TX_SIZE_BYTES: usize = 100_000;
/// Serialized metadata ceiling per transaction.
pub const MAX_METADATA_BYTES: usize = 4096;
pub const MAX_INPUTS: usize = 1000;
pub const MAX_OUTPUTS: usize = 1000;

/// Transactions older than this are rejected outright.
pub const MAX_TX_AGE_SECS: f64 = 3600.0;
/// Clock-skew allowance for timestamps ahead of local time.
pub const MAX_FUTURE_SKEW_SECS: f64 = 300.0;

pub const INITIAL_REWARD: f64 = 60.0;
/// Blocks between reward halvings (~1 year at the 2-minute spacing target).
pub const HALVING_INTERVAL: u64 = 262_800;
/// Rewards below this round down to zero.
pub const DUST_THRESHOLD: f64 = 1e-8;
/// Float drift tolerated by conservation checks.
pub const AMOUNT_EPSILON: f64 = 1e-9;

pub const TARGET_BLOCK_SPACING_SECS: f64 = 120.0;
/// Number of parent timestamps feeding the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;
pub const MIN_CONFIRMATIONS: u64 = 6;

/// Emission schedule: halve every interval, floor to dust, then zero.
pub fn block_reward(height: u64) -> f64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0.0;
    }
    let reward = INITIAL_REWARD / (1u64 << halvings) as f64;
    if reward < DUST_THRESHOLD {
        0.0
    } else {
        reward
    }
}

/// Wall-clock seconds since the epoch as the float wire form.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
