//! Time periods for the v3 onion-service subsystem
//!
//! A time period is a fixed-length window (one day by default) that
//! rotates the blinded key and the directory index. Periods are offset
//! from midnight so the rotation does not line up with the start of the
//! shared-random protocol run.

/// Default time period length in minutes (one day).
pub const TIME_PERIOD_LENGTH_DEFAULT: u64 = 1440;

/// Smallest allowed period length in minutes.
pub const TIME_PERIOD_LENGTH_MIN: u64 = 30;

/// Largest allowed period length in minutes (10 days).
pub const TIME_PERIOD_LENGTH_MAX: u64 = 60 * 24 * 10;

/// Rotation offset in minutes: periods start at 12:00 UTC, not midnight.
pub const TIME_PERIOD_ROTATION_OFFSET: u64 = 12 * 60;

/// Number of the time period containing `now` (unix seconds).
pub fn time_period_num(now: u64, period_length_mins: u64) -> u64 {
    let minutes = now / 60;
    let shifted = minutes.saturating_sub(TIME_PERIOD_ROTATION_OFFSET);
    shifted / period_length_mins
}

/// Number of the period after the one containing `now`.
pub fn next_time_period_num(now: u64, period_length_mins: u64) -> u64 {
    time_period_num(now, period_length_mins) + 1
}

/// Unix time at which the given period starts.
pub fn time_period_start(period_num: u64, period_length_mins: u64) -> u64 {
    (period_num * period_length_mins + TIME_PERIOD_ROTATION_OFFSET) * 60
}

/// Period length converted to seconds, as the derivations consume it.
pub fn period_length_secs(period_length_mins: u64) -> u64 {
    period_length_mins * 60
}

/// Whether the overlap period is active for a consensus valid from
/// `valid_after`.
///
/// Overlap runs from the creation of a new SRV until the next time-period
/// rotation; with defaults that is the first half of every UTC day.
/// During overlap the service publishes descriptors for both the current
/// and the next period.
pub fn overlap_mode_is_active(valid_after: u64, period_length_mins: u64) -> bool {
    let minutes = valid_after / 60;
    let shifted = minutes.saturating_sub(TIME_PERIOD_ROTATION_OFFSET);
    let into_period = shifted % period_length_mins;
    into_period >= period_length_mins.saturating_sub(TIME_PERIOD_ROTATION_OFFSET)
}
