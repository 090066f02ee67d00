// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How many times crashed workers may be replaced within a trailing window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// 0 disables restarts
    pub max_restarts: u32,
    pub window: Duration,
}

/// Sliding window of recent restarts, shared by all slots of the pool
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    history: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            history: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Records a restart at `now` if the policy still allows one
    pub fn try_restart(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= self.policy.max_restarts as usize {
            return false;
        }

        self.history.push_back(now);
        true
    }
}
