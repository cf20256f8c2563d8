//! Two-tier rate limit policy and the decisions it produces.

use serde::{Deserialize, Serialize};

use super::window::Window;

/// Default minimum gap between two accepted attempts.
pub const DEFAULT_SPACING_SECS: u64 = 30;
/// Minimum gap used by [`Policy::simple`].
pub const SIMPLE_SPACING_SECS: u64 = 10;
/// Default number of attempts allowed per window.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default rolling window length (one day).
pub const DEFAULT_WINDOW_SECS: u64 = 86_400;

/// Limits applied to one fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Minimum seconds between consecutive accepted attempts
    #[serde(default = "default_spacing_secs")]
    pub spacing_secs: u64,

    /// Maximum accepted attempts inside the rolling window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Length of the rolling window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_spacing_secs() -> u64 {
    DEFAULT_SPACING_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            spacing_secs: DEFAULT_SPACING_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

impl Policy {
    pub fn new(spacing_secs: u64, max_attempts: u32, window_secs: u64) -> Self {
        Self {
            spacing_secs,
            max_attempts,
            window_secs,
        }
    }

    /// The lighter preset: 10 second spacing, otherwise default limits.
    pub fn simple() -> Self {
        Self {
            spacing_secs: SIMPLE_SPACING_SECS,
            ..Self::default()
        }
    }

    /// Decide whether an attempt at `now` may proceed given the current window.
    ///
    /// Quota exhaustion is checked before spacing, so a caller who has used up
    /// the window always sees [`Decision::DeniedQuota`].
    pub fn evaluate(&self, window: &Window, now: i64) -> Decision {
        let max_attempts = self.max_attempts as usize;

        if window.len() >= max_attempts {
            return Decision::DeniedQuota {
                retry_after_secs: self.quota_retry_after(window, now),
            };
        }

        if let Some(latest) = window.latest() {
            let elapsed = now.saturating_sub(latest);
            let spacing = i64::try_from(self.spacing_secs).unwrap_or(i64::MAX);
            if elapsed < spacing {
                return Decision::DeniedSpacing {
                    retry_after_secs: spacing.saturating_sub(elapsed).unsigned_abs(),
                };
            }
        }

        Decision::Allowed {
            remaining: (max_attempts - window.len() - 1) as u32,
        }
    }

    /// Seconds until enough of the window has aged out to admit one attempt.
    fn quota_retry_after(&self, window: &Window, now: i64) -> u64 {
        let max_attempts = self.max_attempts as usize;
        if max_attempts == 0 {
            return self.window_secs;
        }

        // The attempt that must leave the window for the count to drop below
        // the quota.
        let blocking = window.as_slice()[window.len() - max_attempts];
        let window_secs = i64::try_from(self.window_secs).unwrap_or(i64::MAX);
        let frees_at = blocking.saturating_add(window_secs).saturating_add(1);

        frees_at.saturating_sub(now).max(1).unsigned_abs()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The attempt was accepted and recorded
    Allowed {
        /// Attempts left in the current window after this one
        remaining: u32,
    },
    /// The previous accepted attempt was too recent
    DeniedSpacing {
        /// Seconds until the spacing requirement is met
        retry_after_secs: u64,
    },
    /// The window already holds the maximum number of attempts
    DeniedQuota {
        /// Seconds until the oldest counted attempt leaves the window
        retry_after_secs: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Stable machine-readable code for this outcome.
    pub fn code(&self) -> &'static str {
        match self {
            Decision::Allowed { .. } => "allowed",
            Decision::DeniedSpacing { .. } => "denied_spacing",
            Decision::DeniedQuota { .. } => "denied_quota",
        }
    }

    /// Seconds the caller should wait before retrying, if denied.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::DeniedSpacing { retry_after_secs }
            | Decision::DeniedQuota { retry_after_secs } => Some(*retry_after_secs),
        }
    }

    /// Default user-facing remediation text for this outcome.
    pub fn message(&self) -> &'static str {
        match self {
            Decision::Allowed { .. } => "Your request has been accepted.",
            Decision::DeniedSpacing { .. } => {
                "You are submitting too quickly. Please wait a moment and try again."
            }
            Decision::DeniedQuota { .. } => {
                "You have reached the maximum number of submissions. Please try again later."
            }
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}
