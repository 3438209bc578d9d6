// ===============================
// src/ids.rs
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::domain::TimePoint;

/// Engine-scoped counters. Never shared between engine instances.
#[derive(Debug)]
pub struct IdGenerator {
    rest: AtomicU64,
    websocket: AtomicU64,
    // (unix ms, sequence within that ms)
    client_order: Mutex<(i64, u32)>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            rest: AtomicU64::new(0),
            websocket: AtomicU64::new(0),
            client_order: Mutex::new((i64::MIN, 0)),
        }
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_rest_request_id(&self) -> u64 {
        self.rest.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_websocket_request_id(&self) -> String {
        (self.websocket.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// `<unix ms><3-digit sequence>`. The sequence restarts per millisecond; when
    /// it runs out (or the clock steps back) the millisecond part is carried
    /// forward so an id never repeats.
    pub fn next_client_order_id(&self, now: TimePoint) -> String {
        let mut state = self.client_order.lock();
        let ms = now.timestamp_millis();
        if ms > state.0 {
            *state = (ms, 0);
        } else {
            state.1 += 1;
            if state.1 >= 1000 {
                *state = (state.0 + 1, 0);
            }
        }
        format!("{}{:03}", state.0, state.1)
    }
}
