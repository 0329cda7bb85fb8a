pub mod ceiling;
pub mod fetcher;
pub mod live_sync;
pub mod tracker;

pub use ceiling::CeilingPolicy;
pub use fetcher::CounterFetcher;
pub use live_sync::LiveSyncManager;
pub use tracker::QuotaTracker;

use serde::Serialize;

/// Share of the ceiling at which the usage indicator switches to its warning colour
const NEAR_LIMIT_PERCENT: u32 = 80;

/// Result of a successful counter read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    pub count: u64,
    pub ceiling: u32,
}

/// Observable quota state handed to the presentation layer.
///
/// Only the tracker writes it; everyone else gets a `watch::Receiver` or a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub prompt_count: u64,
    pub max_prompts: u32,
    pub loading: bool,
    pub error: Option<String>,
}

impl Default for QuotaState {
    fn default() -> Self {
        Self {
            prompt_count: 0,
            max_prompts: CeilingPolicy::default().anonymous,
            loading: true,
            error: None,
        }
    }
}

impl QuotaState {
    pub fn remaining(&self) -> u64 {
        u64::from(self.max_prompts).saturating_sub(self.prompt_count)
    }

    /// Percentage of the ceiling used, capped at 100
    pub fn usage_percent(&self) -> u32 {
        if self.max_prompts == 0 {
            return 100;
        }
        let percent = self.prompt_count.saturating_mul(100) / u64::from(self.max_prompts);
        percent.min(100) as u32
    }

    pub fn is_near_limit(&self) -> bool {
        self.usage_percent() >= NEAR_LIMIT_PERCENT
    }

    /// Input should be blocked and the upgrade prompt shown
    pub fn is_exhausted(&self) -> bool {
        self.prompt_count >= u64::from(self.max_prompts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(prompt_count: u64, max_prompts: u32) -> QuotaState {
        QuotaState {
            prompt_count,
            max_prompts,
            loading: false,
            error: None,
        }
    }

    #[test]
    fn test_fresh_guest() {
        let state = state(0, 5);
        assert_eq!(state.remaining(), 5);
        assert_eq!(state.usage_percent(), 0);
        assert!(!state.is_near_limit());
        assert!(!state.is_exhausted());
    }

    #[test]
    fn test_near_limit() {
        assert!(state(4, 5).is_near_limit());
        assert!(!state(6, 8).is_near_limit());
        assert!(state(7, 8).is_near_limit());
    }

    #[test]
    fn test_exhausted_and_over_limit() {
        let at_limit = state(8, 8);
        assert!(at_limit.is_exhausted());
        assert_eq!(at_limit.remaining(), 0);

        // Counts carried over from a guest session can exceed the ceiling
        let over = state(11, 8);
        assert!(over.is_exhausted());
        assert_eq!(over.remaining(), 0);
        assert_eq!(over.usage_percent(), 100);
    }

    #[test]
    fn test_serializes_for_presentation_layer() {
        let json = serde_json::to_value(state(3, 5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "promptCount": 3,
                "maxPrompts": 5,
                "loading": false,
                "error": null,
            })
        );
    }
}
