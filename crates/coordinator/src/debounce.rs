//! Per-shard recovery debounce.
//!
//! Several `recover_vnode` requests for the same shard can arrive close
//! together (an operator retrying, several sweeps noticing the same orphan).
//! Only the first within `window` results in an advertisement.

use corelib::ShardNumber;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RecoveryDebounce {
    window: Duration,
    last_advertised: HashMap<ShardNumber, Instant>,
}

impl RecoveryDebounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_advertised: HashMap::new(),
        }
    }

    /// Record an attempt to advertise `shard` at `now`. Returns `true` if the
    /// advertisement should go out.
    pub fn try_advertise(&mut self, shard: ShardNumber, now: Instant) -> bool {
        if let Some(last) = self.last_advertised.get(&shard) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_advertised.insert(shard, now);
        // Entries older than the window can never suppress anything again.
        let window = self.window;
        self.last_advertised
            .retain(|_, at| now.saturating_duration_since(*at) < window || *at == now);
        true
    }
}
