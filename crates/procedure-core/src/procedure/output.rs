//! Output slot for result-producing procedures.

use std::sync::{Arc, Mutex};

use super::Procedure;
use crate::error::ProcedureError;

/// A value one procedure produces and another consumes.
///
/// The consumer should depend on the producer; reading an unset output with
/// `require` yields `RequirementNotSatisfied`.
#[derive(Debug)]
pub struct Output<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Default for Output<T> {
    fn default() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone> Output<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: T) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Read the value on behalf of `consumer`.
    pub fn require(&self, consumer: &Procedure) -> Result<T, ProcedureError> {
        self.get().ok_or(ProcedureError::RequirementNotSatisfied {
            procedure: consumer.id(),
        })
    }
}
