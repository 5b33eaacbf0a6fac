//! Dependency requirements: how a condition treats failed or cancelled
//! dependencies before it is evaluated.

use std::ops::BitOr;

use crate::procedure::Procedure;

/// Option set of requirements on a condition's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DependencyRequirements(u8);

impl DependencyRequirements {
    /// Evaluate regardless of how the dependencies ended.
    pub const NONE: Self = Self(0);

    /// Fail if any dependency finished with errors.
    pub const NO_FAILED: Self = Self(1);

    /// Like `NO_FAILED`, but a dependency that failed because it was
    /// cancelled is tolerated.
    pub const IGNORE_FAILED_IF_CANCELLED: Self = Self(1 << 1);

    /// Fail if any dependency was cancelled.
    pub const NO_CANCELLED: Self = Self(1 << 2);

    pub const NO_FAILED_OR_CANCELLED: Self = Self(Self::NO_FAILED.0 | Self::NO_CANCELLED.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check `dependencies` against the requirements.
    ///
    /// Failures are checked before cancellations.
    pub fn verify(self, dependencies: &[Procedure]) -> Result<(), RequirementViolation> {
        if self.is_empty() {
            return Ok(());
        }

        let check_failed = self.contains(Self::NO_FAILED) || self.contains(Self::IGNORE_FAILED_IF_CANCELLED);
        if check_failed {
            let tolerate_cancelled = self.contains(Self::IGNORE_FAILED_IF_CANCELLED);
            let failed = dependencies
                .iter()
                .any(|d| d.has_errors() && !(tolerate_cancelled && d.is_cancelled()));
            if failed {
                return Err(RequirementViolation::Failed);
            }
        }

        if self.contains(Self::NO_CANCELLED) && dependencies.iter().any(Procedure::is_cancelled) {
            return Err(RequirementViolation::Cancelled);
        }

        Ok(())
    }
}

impl BitOr for DependencyRequirements {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Which requirement a dependency broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementViolation {
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use crate::error::ProcedureError;
    use crate::queue::ProcedureQueue;

    async fn finished(cancelled: bool, failed: bool) -> Procedure {
        let procedure = Procedure::block("dep", move |_ctx| async move {
            if failed {
                Err(ProcedureError::failed("dep failed"))
            } else {
                Ok(())
            }
        });
        if cancelled && failed {
            procedure.cancel_with_error(ProcedureError::failed("cancelled with error"));
        } else if cancelled {
            procedure.cancel();
        }
        ProcedureQueue::new().add(procedure.clone()).unwrap().await;
        procedure
    }

    #[test]
    fn combined_flags_contain_their_parts() {
        let both = DependencyRequirements::NO_FAILED | DependencyRequirements::NO_CANCELLED;
        assert_eq!(both, DependencyRequirements::NO_FAILED_OR_CANCELLED);
        assert!(both.contains(DependencyRequirements::NO_FAILED));
        assert!(both.contains(DependencyRequirements::NO_CANCELLED));
        assert!(!both.contains(DependencyRequirements::IGNORE_FAILED_IF_CANCELLED));
        assert!(DependencyRequirements::default().is_empty());
    }

    #[rstest]
    #[case::none_accepts_failure(DependencyRequirements::NONE, false, true, None)]
    #[case::no_failed(DependencyRequirements::NO_FAILED, false, true, Some(RequirementViolation::Failed))]
    #[case::no_failed_accepts_clean(DependencyRequirements::NO_FAILED, false, false, None)]
    #[case::no_failed_accepts_clean_cancel(DependencyRequirements::NO_FAILED, true, false, None)]
    #[case::no_failed_rejects_cancel_with_error(DependencyRequirements::NO_FAILED, true, true, Some(RequirementViolation::Failed))]
    #[case::tolerates_cancelled_failure(DependencyRequirements::IGNORE_FAILED_IF_CANCELLED, true, true, None)]
    #[case::still_rejects_plain_failure(DependencyRequirements::IGNORE_FAILED_IF_CANCELLED, false, true, Some(RequirementViolation::Failed))]
    #[case::no_cancelled(DependencyRequirements::NO_CANCELLED, true, false, Some(RequirementViolation::Cancelled))]
    #[case::failure_checked_first(DependencyRequirements::NO_FAILED_OR_CANCELLED, true, true, Some(RequirementViolation::Failed))]
    #[tokio::test]
    async fn verify_dependencies(
        #[case] requirements: DependencyRequirements,
        #[case] cancelled: bool,
        #[case] failed: bool,
        #[case] expected: Option<RequirementViolation>,
    ) {
        let dependency = finished(cancelled, failed).await;
        assert_eq!(requirements.verify(&[dependency]).err(), expected);
    }
}
