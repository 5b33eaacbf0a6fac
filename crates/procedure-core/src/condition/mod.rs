//! Conditions: predicates gating whether a procedure may execute.
//!
//! Design:
//! - A `Condition` is a cheap cloneable handle; identity (`ConditionId`) is
//!   what compound conditions deduplicate on.
//! - Combinators (`&`, `|`, `!`, `ignored`, `silent`) are variants of one
//!   `ConditionKind` rather than separate types, so the evaluator can walk
//!   any tree of them.
//! - Dependencies of a condition must finish before it is evaluated; produced
//!   dependencies are scheduled on the procedure's queue at evaluation time.

mod evaluator;
mod requirements;

pub(crate) use evaluator::evaluate_conditions;
pub use evaluator::{Aggregation, reduce_results};
pub use requirements::{DependencyRequirements, RequirementViolation};

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::ConditionId;
use crate::error::ProcedureError;
use crate::procedure::Procedure;

/// Verdict of one condition.
#[derive(Debug, Clone)]
pub enum ConditionResult {
    /// The procedure may proceed.
    Satisfied,

    /// Neither success nor failure. A procedure whose only verdict is
    /// `Ignored` is cancelled without an error.
    Ignored,

    /// The procedure is cancelled with this error.
    Failed(ProcedureError),
}

impl ConditionResult {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, ConditionResult::Satisfied)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConditionResult::Failed(_))
    }
}

/// Custom asynchronous condition logic.
#[async_trait]
pub trait Evaluate: Send + Sync + 'static {
    async fn evaluate(&self, procedure: &Procedure) -> ConditionResult;
}

type BlockPredicate = Box<dyn Fn(&Procedure) -> Result<bool, ProcedureError> + Send + Sync>;

pub(crate) enum ConditionKind {
    True,
    False,
    Block(BlockPredicate),
    MutuallyExclusive,
    NoFailedDependencies { ignore_cancellations: bool },
    Custom(Box<dyn Evaluate>),
    Compound(Aggregation, Vec<Condition>),
    Negated(Condition),
    Silent(Condition),
    Ignored(Condition),
}

#[derive(Default)]
struct ConditionParts {
    dependencies: Vec<Procedure>,
    produced_dependencies: Vec<Procedure>,
    categories: BTreeSet<String>,
    requirements: DependencyRequirements,
}

struct ConditionInner {
    id: ConditionId,
    name: String,
    kind: ConditionKind,
    parts: Mutex<ConditionParts>,
}

/// A named predicate evaluated before a procedure executes.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

impl Condition {
    fn from_kind(name: impl Into<String>, kind: ConditionKind) -> Self {
        Self {
            inner: Arc::new(ConditionInner {
                id: ConditionId::generate(),
                name: name.into(),
                kind,
                parts: Mutex::new(ConditionParts::default()),
            }),
        }
    }

    /// Always satisfied.
    pub fn always_true() -> Self {
        Self::from_kind("TrueCondition", ConditionKind::True)
    }

    /// Always fails with `FalseCondition`.
    pub fn always_false() -> Self {
        Self::from_kind("FalseCondition", ConditionKind::False)
    }

    /// Synchronous predicate: `Ok(true)` satisfies, `Ok(false)` fails with
    /// `FalseCondition`, `Err(e)` fails with `e`.
    pub fn block(
        name: impl Into<String>,
        predicate: impl Fn(&Procedure) -> Result<bool, ProcedureError> + Send + Sync + 'static,
    ) -> Self {
        Self::from_kind(name, ConditionKind::Block(Box::new(predicate)))
    }

    /// Custom asynchronous condition.
    pub fn custom(name: impl Into<String>, evaluate: impl Evaluate) -> Self {
        Self::from_kind(name, ConditionKind::Custom(Box::new(evaluate)))
    }

    /// Always satisfied; makes the procedure mutually exclusive with every
    /// other procedure in `category`.
    pub fn mutually_exclusive(category: impl Into<String>) -> Self {
        let category = category.into();
        let condition = Self::from_kind(
            format!("MutuallyExclusive<{category}>"),
            ConditionKind::MutuallyExclusive,
        );
        condition.add_category(category);
        condition
    }

    /// Fails if any of the procedure's dependencies failed or was cancelled.
    ///
    /// With `ignore_cancellations`, a cancelled dependency makes the verdict
    /// `Ignored` instead of failed.
    pub fn no_failed_dependencies(ignore_cancellations: bool) -> Self {
        Self::from_kind(
            "NoFailedDependenciesCondition",
            ConditionKind::NoFailedDependencies {
                ignore_cancellations,
            },
        )
    }

    /// Satisfied only if every condition is (short-circuits on failure).
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::compound(Aggregation::And, conditions)
    }

    /// Satisfied if any condition is (short-circuits on success).
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::compound(Aggregation::Or, conditions)
    }

    fn compound(aggregation: Aggregation, conditions: impl IntoIterator<Item = Condition>) -> Self {
        let conditions = filter_duplicates(conditions);
        let symbol = match aggregation {
            Aggregation::And => " && ",
            Aggregation::Or => " || ",
        };
        let name = format!(
            "CompoundCondition({})",
            conditions
                .iter()
                .map(Condition::name)
                .collect::<Vec<_>>()
                .join(symbol)
        );
        Self::from_kind(name, ConditionKind::Compound(aggregation, conditions))
    }

    /// Satisfied -> failed, failed -> satisfied, ignored stays ignored.
    pub fn negated(self) -> Self {
        let name = format!("Not<{}>", self.name());
        Self::from_kind(name, ConditionKind::Negated(self))
    }

    /// Same verdict, but the wrapped condition's produced dependencies are
    /// never scheduled.
    pub fn silent(self) -> Self {
        let name = format!("Silent<{}>", self.name());
        Self::from_kind(name, ConditionKind::Silent(self))
    }

    /// Failure becomes `Ignored` (a clean cancel instead of a failed one).
    pub fn ignored(self) -> Self {
        let name = format!("Ignored<{}>", self.name());
        Self::from_kind(name, ConditionKind::Ignored(self))
    }

    pub fn id(&self) -> ConditionId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.name.clone()
    }

    pub(crate) fn kind(&self) -> &ConditionKind {
        &self.inner.kind
    }

    fn parts(&self) -> MutexGuard<'_, ConditionParts> {
        self.inner.parts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The wrapped condition of a composed (negated/silent/ignored) one.
    fn composed(&self) -> Option<&Condition> {
        match &self.inner.kind {
            ConditionKind::Negated(c) | ConditionKind::Silent(c) | ConditionKind::Ignored(c) => {
                Some(c)
            }
            _ => None,
        }
    }

    /// Must finish before this condition is evaluated.
    pub fn add_dependency(&self, dependency: &Procedure) {
        let mut parts = self.parts();
        if !parts.dependencies.iter().any(|d| d.id() == dependency.id()) {
            parts.dependencies.push(dependency.clone());
        }
    }

    pub fn with_dependency(self, dependency: &Procedure) -> Self {
        self.add_dependency(dependency);
        self
    }

    /// Scheduled on the owning procedure's queue when the condition is
    /// evaluated, and finished before the evaluation.
    pub fn produce_dependency(&self, dependency: Procedure) {
        let mut parts = self.parts();
        if !parts
            .produced_dependencies
            .iter()
            .any(|d| d.id() == dependency.id())
        {
            parts.produced_dependencies.push(dependency);
        }
    }

    pub fn producing(self, dependency: Procedure) -> Self {
        self.produce_dependency(dependency);
        self
    }

    pub fn add_category(&self, category: impl Into<String>) {
        self.parts().categories.insert(category.into());
    }

    pub fn set_requirements(&self, requirements: DependencyRequirements) {
        self.parts().requirements = requirements;
    }

    pub fn with_requirements(self, requirements: DependencyRequirements) -> Self {
        self.set_requirements(requirements);
        self
    }

    pub fn requirements(&self) -> DependencyRequirements {
        self.parts().requirements
    }

    /// Own dependencies plus, for composed conditions, the wrapped ones.
    pub fn dependencies(&self) -> Vec<Procedure> {
        let mut dependencies = self.parts().dependencies.clone();
        if let Some(inner) = self.composed() {
            for dependency in inner.dependencies() {
                if !dependencies.iter().any(|d| d.id() == dependency.id()) {
                    dependencies.push(dependency);
                }
            }
        }
        dependencies
    }

    /// Own produced dependencies plus, for negated/ignored conditions, the
    /// wrapped ones. Silent conditions suppress the wrapped ones.
    pub fn produced_dependencies(&self) -> Vec<Procedure> {
        let mut produced = self.parts().produced_dependencies.clone();
        if let ConditionKind::Negated(inner) | ConditionKind::Ignored(inner) = &self.inner.kind {
            for dependency in inner.produced_dependencies() {
                if !produced.iter().any(|d| d.id() == dependency.id()) {
                    produced.push(dependency);
                }
            }
        }
        produced
    }

    /// Own categories plus those of every nested condition.
    pub fn mutually_exclusive_categories(&self) -> BTreeSet<String> {
        let mut categories = self.parts().categories.clone();
        match &self.inner.kind {
            ConditionKind::Compound(_, children) => {
                for child in children {
                    categories.extend(child.mutually_exclusive_categories());
                }
            }
            ConditionKind::Negated(inner)
            | ConditionKind::Silent(inner)
            | ConditionKind::Ignored(inner) => {
                categories.extend(inner.mutually_exclusive_categories());
            }
            _ => {}
        }
        categories
    }

    pub fn is_mutually_exclusive(&self) -> bool {
        !self.mutually_exclusive_categories().is_empty()
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Condition {}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("id", &self.id())
            .field("name", &self.inner.name)
            .finish()
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        Condition::all([self, rhs])
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        Condition::any([self, rhs])
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        self.negated()
    }
}

/// Keep the first occurrence of each condition (by identity).
pub(crate) fn filter_duplicates(conditions: impl IntoIterator<Item = Condition>) -> Vec<Condition> {
    let mut seen = std::collections::HashSet::new();
    conditions
        .into_iter()
        .filter(|c| seen.insert(c.id()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Procedure {
        Procedure::block(name.to_string(), |_ctx| async { Ok(()) })
    }

    #[test]
    fn compound_removes_duplicate_instances() {
        let a = Condition::always_true();
        let b = Condition::always_false();

        let compound = Condition::all([a.clone(), b.clone(), a.clone()]);

        match compound.kind() {
            ConditionKind::Compound(Aggregation::And, children) => {
                assert_eq!(children, &vec![a, b]);
            }
            _ => panic!("expected an AND compound"),
        }
    }

    #[test]
    fn operators_build_combinators() {
        let and = Condition::always_true() & Condition::always_false();
        assert!(and.name().contains("&&"));

        let or = Condition::always_true() | Condition::always_false();
        assert!(or.name().contains("||"));

        let not = !Condition::always_true();
        assert_eq!(not.name(), "Not<TrueCondition>");
        assert_eq!(Condition::always_false().ignored().name(), "Ignored<FalseCondition>");
        assert_eq!(Condition::always_false().silent().name(), "Silent<FalseCondition>");
    }

    #[test]
    fn categories_are_collected_from_nested_conditions() {
        let compound = Condition::mutually_exclusive("alerts")
            & Condition::mutually_exclusive("network").negated();
        let categories = compound.mutually_exclusive_categories();

        assert!(compound.is_mutually_exclusive());
        assert_eq!(
            categories.into_iter().collect::<Vec<_>>(),
            vec!["alerts".to_string(), "network".to_string()]
        );
    }

    #[test]
    fn composed_conditions_inherit_dependencies() {
        let dependency = noop("dep");
        let produced = noop("produced");
        let base = Condition::always_true()
            .with_dependency(&dependency)
            .producing(produced.clone());

        let negated = base.clone().negated();
        assert_eq!(negated.dependencies(), vec![dependency.clone()]);
        assert_eq!(negated.produced_dependencies(), vec![produced.clone()]);

        let silent = base.silent();
        assert_eq!(silent.dependencies(), vec![dependency]);
        assert!(silent.produced_dependencies().is_empty());
    }

    #[test]
    fn dependencies_are_not_duplicated() {
        let dependency = noop("dep");
        let condition = Condition::always_true();
        condition.add_dependency(&dependency);
        condition.add_dependency(&dependency);
        assert_eq!(condition.dependencies().len(), 1);
    }
}
