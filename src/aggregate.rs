//! Counter rules for a single meme.
//!
//! The functions here are pure: they decide *what* delta a user action
//! produces. The storage backends apply that delta atomically, so these rules
//! hold no matter how many requests target the same meme at once.

use crate::models::VoteType;

/// Result of feeding one vote request into a user's current vote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTransition {
    /// The caller's vote after the request; `None` means toggled off.
    pub next: Option<VoteType>,
    pub upvotes_delta: i64,
    pub downvotes_delta: i64,
}

/// Vote state machine for one `(meme, user)` pair.
///
/// Repeating the current vote toggles it off; the opposite vote switches
/// sides and moves one count across.
pub fn transition(current: Option<VoteType>, requested: VoteType) -> VoteTransition {
    use VoteType::{Down, Up};

    let (next, upvotes_delta, downvotes_delta) = match (current, requested) {
        (None, Up) => (Some(Up), 1, 0),
        (None, Down) => (Some(Down), 0, 1),
        (Some(Up), Up) => (None, -1, 0),
        (Some(Up), Down) => (Some(Down), -1, 1),
        (Some(Down), Down) => (None, 0, -1),
        (Some(Down), Up) => (Some(Up), 1, -1),
    };

    VoteTransition {
        next,
        upvotes_delta,
        downvotes_delta,
    }
}

/// Applies a signed delta to an unsigned counter, flooring at zero.
pub fn apply_delta(counter: u64, delta: i64) -> u64 {
    if delta >= 0 {
        counter.saturating_add(delta.unsigned_abs())
    } else {
        counter.saturating_sub(delta.unsigned_abs())
    }
}

/// When a meme shows the flagged banner, and whether a user may flag twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagPolicy {
    /// `isFlagged` turns on once `flagCount` reaches this value. Never zero.
    pub threshold: u64,
    /// Reject a second flag from the same user on the same meme.
    pub once_per_user: bool,
}

impl Default for FlagPolicy {
    fn default() -> Self {
        FlagPolicy {
            threshold: 1,
            once_per_user: false,
        }
    }
}

impl FlagPolicy {
    /// Whether the banner is on after a flag brought the count to `flag_count`.
    /// Once on it stays on; clearing it is a moderation action.
    pub fn is_flagged(&self, flag_count: u64, currently_flagged: bool) -> bool {
        currently_flagged || flag_count >= self.threshold.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteType::{Down, Up};

    #[test]
    fn transition_table() {
        let table = [
            (None, Up, Some(Up), 1, 0),
            (None, Down, Some(Down), 0, 1),
            (Some(Up), Up, None, -1, 0),
            (Some(Up), Down, Some(Down), -1, 1),
            (Some(Down), Down, None, 0, -1),
            (Some(Down), Up, Some(Up), 1, -1),
        ];
        for (current, requested, next, up, down) in table {
            let step = transition(current, requested);
            assert_eq!(step.next, next, "{current:?} + {requested:?}");
            assert_eq!(step.upvotes_delta, up, "{current:?} + {requested:?}");
            assert_eq!(step.downvotes_delta, down, "{current:?} + {requested:?}");
        }
    }

    #[test]
    fn counters_replayed_through_transitions_match_final_state() {
        // Replay a long arbitrary request sequence for one user and check the
        // accumulated counters always describe exactly the current vote.
        let requests = [Up, Up, Down, Up, Down, Down, Down, Up, Up, Down];
        let (mut state, mut up, mut down) = (None, 0u64, 0u64);
        for requested in requests {
            let step = transition(state, requested);
            state = step.next;
            up = apply_delta(up, step.upvotes_delta);
            down = apply_delta(down, step.downvotes_delta);
            assert_eq!(up, u64::from(state == Some(Up)));
            assert_eq!(down, u64::from(state == Some(Down)));
        }
    }

    #[test]
    fn apply_delta_never_goes_negative() {
        assert_eq!(apply_delta(0, -1), 0);
        assert_eq!(apply_delta(3, -1), 2);
        assert_eq!(apply_delta(3, 2), 5);
        assert_eq!(apply_delta(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn default_policy_flags_on_first_report() {
        let policy = FlagPolicy::default();
        assert!(!policy.is_flagged(0, false));
        assert!(policy.is_flagged(1, false));
    }

    #[test]
    fn threshold_policy_waits_and_then_sticks() {
        let policy = FlagPolicy {
            threshold: 3,
            once_per_user: false,
        };
        assert!(!policy.is_flagged(2, false));
        assert!(policy.is_flagged(3, false));
        assert!(policy.is_flagged(1, true));
    }

    #[test]
    fn zero_threshold_behaves_like_one() {
        let policy = FlagPolicy {
            threshold: 0,
            once_per_user: false,
        };
        assert!(!policy.is_flagged(0, false));
        assert!(policy.is_flagged(1, false));
    }
}
