//! Skip policy
//!
//! Decides, given an item error and the number of skips already accumulated
//! in the current step execution, whether to skip the offending item or
//! abort the step. Pure decision functions, no side effects.

use crate::item::{ErrorClass, ItemError};

/// Skip decision capability
pub trait SkipPolicy: Send + Sync {
    fn should_skip(&self, error: &ItemError, skip_count: u32) -> bool;
}

/// Policy that never skips (fail-closed default)
pub struct NeverSkipPolicy;

impl SkipPolicy for NeverSkipPolicy {
    fn should_skip(&self, _error: &ItemError, _skip_count: u32) -> bool {
        false
    }
}

/// Policy that skips classified errors up to a configured ceiling
///
/// Skips while the cumulative skip count is below `skip_limit` and the
/// error's class is in the allowed set. Classes not explicitly listed are
/// never skippable. A ceiling of zero never skips.
pub struct LimitCheckingSkipPolicy {
    skip_limit: u32,
    skippable_classes: Vec<ErrorClass>,
}

impl LimitCheckingSkipPolicy {
    pub fn new(skip_limit: u32) -> Self {
        Self {
            skip_limit,
            skippable_classes: Vec::new(),
        }
    }

    /// Adds an error class to the allowed set
    pub fn skipping(mut self, class: ErrorClass) -> Self {
        if !self.skippable_classes.contains(&class) {
            self.skippable_classes.push(class);
        }
        self
    }

    pub fn skip_limit(&self) -> u32 {
        self.skip_limit
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn should_skip(&self, error: &ItemError, skip_count: u32) -> bool {
        skip_count < self.skip_limit && self.skippable_classes.contains(&error.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_skip_policy() {
        let policy = NeverSkipPolicy;
        assert!(!policy.should_skip(&ItemError::validation("bad"), 0));
    }

    #[test]
    fn test_limit_checking_policy_respects_ceiling() {
        let policy = LimitCheckingSkipPolicy::new(2).skipping(ErrorClass::Validation);
        let err = ItemError::validation("bad record");

        assert!(policy.should_skip(&err, 0));
        assert!(policy.should_skip(&err, 1));
        // Ceiling reached: the next matching error becomes fatal
        assert!(!policy.should_skip(&err, 2));
    }

    #[test]
    fn test_limit_checking_policy_zero_ceiling_never_skips() {
        let policy = LimitCheckingSkipPolicy::new(0).skipping(ErrorClass::Validation);
        assert!(!policy.should_skip(&ItemError::validation("bad"), 0));
    }

    #[test]
    fn test_unlisted_classes_are_not_skippable() {
        let policy = LimitCheckingSkipPolicy::new(10).skipping(ErrorClass::Validation);

        assert!(!policy.should_skip(&ItemError::io("disk gone"), 0));
        assert!(!policy.should_skip(&ItemError::other("unknown"), 0));
        assert!(policy.should_skip(&ItemError::validation("bad"), 0));
    }
}
