//! Sliding window of accepted attempt timestamps.

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The accepted attempts for one fingerprint that still fall inside the
/// rolling window, oldest first.
///
/// The window is rebuilt from the stored record on every check rather than
/// maintained incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Window {
    timestamps: Vec<i64>,
}

impl Window {
    /// Build the window as seen at `now`, keeping only timestamps `t` with
    /// `now - t <= window_secs`.
    pub fn at(stored: Vec<i64>, now: i64, window_secs: u64) -> Self {
        let window_secs = i64::try_from(window_secs).unwrap_or(i64::MAX);
        let mut timestamps: Vec<i64> = stored
            .into_iter()
            .filter(|t| now.saturating_sub(*t) <= window_secs)
            .collect();
        // Stored records are written in order, but a hand-edited or foreign
        // record may not be.
        timestamps.sort_unstable();
        Self { timestamps }
    }

    /// Record an accepted attempt, keeping the sequence non-decreasing.
    pub fn record(&mut self, now: i64) {
        let idx = self.timestamps.partition_point(|t| *t <= now);
        self.timestamps.insert(idx, now);
    }

    /// Number of attempts counted in the window.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// The earliest counted attempt.
    pub fn oldest(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    /// The most recent counted attempt.
    pub fn latest(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn into_vec(self) -> Vec<i64> {
        self.timestamps
    }
}
