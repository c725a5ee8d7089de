//! Sliding-window retry budget.
//!
//! Caps how many retries (not first attempts) may run per rolling minute so
//! that retry traffic cannot amplify load during an outage.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// A rolling one-minute budget of retry attempts.
///
/// Shared by every `execute` call on the same [`RetryStrategy`](crate::RetryStrategy);
/// once `per_minute` retries have been spent inside the window, further retries
/// are refused until old entries age out.
pub struct RetryBudget {
    per_minute: u32,
    window: Duration,
    spent: Mutex<VecDeque<Instant>>,
}

impl RetryBudget {
    /// Create a budget allowing `per_minute` retries per rolling minute.
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            window: BUDGET_WINDOW,
            spent: Mutex::new(VecDeque::new()),
        }
    }

    /// Budget with a custom window, so tests can age entries without
    /// sleeping for a minute.
    #[cfg(test)]
    pub(crate) fn with_window(per_minute: u32, window: Duration) -> Self {
        Self {
            per_minute,
            window,
            spent: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to spend one retry. Returns false when the window is full.
    pub fn try_acquire(&self) -> bool {
        let mut spent = self.spent.lock().unwrap();
        self.prune(&mut spent);
        if (spent.len() as u32) < self.per_minute {
            spent.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    /// How many retries remain in the current window.
    pub fn remaining(&self) -> u32 {
        let mut spent = self.spent.lock().unwrap();
        self.prune(&mut spent);
        self.per_minute.saturating_sub(spent.len() as u32)
    }

    /// The configured per-minute cap.
    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    fn prune(&self, spent: &mut VecDeque<Instant>) {
        let now = Instant::now();
        while let Some(&t) = spent.front() {
            if now.duration_since(t) > self.window {
                spent.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for RetryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBudget")
            .field("per_minute", &self.per_minute)
            .field("remaining", &self.remaining())
            .finish()
    }
}
