//! Difficulty adjustment over a rolling window of block intervals.

use std::collections::VecDeque;

/// Difficulty of the genesis block
pub const INITIAL_DIFFICULTY: u64 = 10_000;

/// Difficulty never drops below this floor
pub const MIN_DIFFICULTY: u64 = 1_000;

/// Number of block intervals kept in the window
pub const DIFFICULTY_WINDOW: usize = 100;

/// Adjust `current` from the average of `intervals` (ms) against `target_ms`
///
/// Blocks arriving faster than 80% of target raise difficulty by 10%, slower
/// than 120% lower it by 10%. An empty window leaves it unchanged.
pub fn calculate_difficulty(current: u64, intervals: &[u64], target_ms: u64) -> u64 {
    if intervals.is_empty() || target_ms == 0 {
        return current.max(MIN_DIFFICULTY);
    }

    let total: u128 = intervals.iter().map(|&i| u128::from(i)).sum();
    let average = total / intervals.len() as u128;
    let target = u128::from(target_ms);

    let adjusted = if average * 10 < target * 8 {
        let raised = current.saturating_mul(11) / 10;
        raised.max(current.saturating_add(1))
    } else if average * 10 > target * 12 {
        current.saturating_mul(9) / 10
    } else {
        current
    };

    adjusted.max(MIN_DIFFICULTY)
}

/// Tracks recent block intervals and the resulting difficulty
#[derive(Debug, Clone)]
pub struct DifficultyTracker {
    intervals: VecDeque<u64>,
    current: u64,
    target_ms: u64,
    last_timestamp: Option<u64>,
}

impl DifficultyTracker {
    /// Start at `initial` with no history
    pub fn new(initial: u64, target_ms: u64) -> Self {
        Self {
            intervals: VecDeque::with_capacity(DIFFICULTY_WINDOW),
            current: initial.max(MIN_DIFFICULTY),
            target_ms,
            last_timestamp: None,
        }
    }

    /// Current difficulty
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Intervals currently in the window
    pub fn window_len(&self) -> usize {
        self.intervals.len()
    }

    /// Seed the previous timestamp without recording an interval
    pub fn anchor(&mut self, timestamp: u64) {
        self.last_timestamp = Some(timestamp);
    }

    /// Record a finalized block timestamp and recompute difficulty
    pub fn record_block(&mut self, timestamp: u64) -> u64 {
        if let Some(last) = self.last_timestamp {
            if self.intervals.len() == DIFFICULTY_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back(timestamp.saturating_sub(last));

            let window: Vec<u64> = self.intervals.iter().copied().collect();
            self.current = calculate_difficulty(self.current, &window, self.target_ms);
        }
        self.last_timestamp = Some(timestamp);
        self.current
    }
}
