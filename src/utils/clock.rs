/// Wall clock in milliseconds, the unit of every session activity stamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
