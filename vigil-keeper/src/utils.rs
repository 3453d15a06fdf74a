use chrono::Utc;

/// Current wall-clock time as epoch seconds.
///
/// The keeper persists contact timestamps in this form; they survive process
/// restarts, which monotonic clocks would not.
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}
