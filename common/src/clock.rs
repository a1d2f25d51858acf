use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

/// Millisecond time source handed to the loops and background tasks.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

pub fn system_clock() -> Clock {
    Arc::new(monotonic_ms)
}
