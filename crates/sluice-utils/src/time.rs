use std::time::{SystemTime, UNIX_EPOCH};

/// Coarse wall-clock seconds used for idle-connection bookkeeping.
pub fn unix_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as u32)
}
