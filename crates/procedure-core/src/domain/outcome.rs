//! Outcome model: how a finished procedure ended.
//!
//! Callers branch on three terminal outcomes. A procedure cancelled without
//! an error is distinguishable from one that failed (cancelled or not).

use crate::error::ProcedureError;

/// Terminal outcome of a procedure.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Finished without errors and was never cancelled.
    Succeeded,

    /// Cancelled without an error (a "clean" cancel).
    Cancelled,

    /// Finished with at least one error.
    Failed(Vec<ProcedureError>),
}

impl Outcome {
    pub fn from_parts(cancelled: bool, errors: Vec<ProcedureError>) -> Self {
        if !errors.is_empty() {
            Outcome::Failed(errors)
        } else if cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Succeeded
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Errors carried by the outcome (empty unless `Failed`).
    pub fn errors(&self) -> &[ProcedureError] {
        match self {
            Outcome::Failed(errors) => errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_distinct_outcomes() {
        assert!(Outcome::from_parts(false, vec![]).is_success());
        assert!(Outcome::from_parts(true, vec![]).is_cancelled());

        let failed = Outcome::from_parts(true, vec![ProcedureError::failed("boom")]);
        assert!(failed.is_failure());
        assert_eq!(failed.errors().len(), 1);
    }
}
