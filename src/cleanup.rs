//! Rollback actions and the reverse-order stack that runs them.

use anyhow::Result;
use std::fmt;

/// How long a registered action stays pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupScope {
    /// Fires only if the registering stage fails.
    Stage,
    /// Fires if the registering stage fails, otherwise moves onto the
    /// pipeline's phase list and fires when the `cleanup` stage runs.
    Phase,
}

/// A labelled, zero-argument undo operation.
pub struct CleanupAction {
    label: String,
    scope: CleanupScope,
    action: Box<dyn FnOnce() -> Result<()>>,
}

impl CleanupAction {
    /// Stage-scoped action.
    pub fn new(label: impl Into<String>, action: impl FnOnce() -> Result<()> + 'static) -> Self {
        Self {
            label: label.into(),
            scope: CleanupScope::Stage,
            action: Box::new(action),
        }
    }

    /// Phase-scoped action.
    pub fn deferred(
        label: impl Into<String>,
        action: impl FnOnce() -> Result<()> + 'static,
    ) -> Self {
        Self {
            scope: CleanupScope::Phase,
            ..Self::new(label, action)
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scope(&self) -> CleanupScope {
        self.scope
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupAction")
            .field("label", &self.label)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Last-registered, first-undone list of cleanup actions.
///
/// Dropping a stack never fires its actions; only `unwind` does.
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Vec<CleanupAction>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Labels in registration order.
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.label()).collect()
    }

    /// Run every action in reverse registration order and empty the stack.
    ///
    /// A failing action is logged and does not stop the ones after it.
    /// Returns the number of actions that failed.
    pub fn unwind(&mut self) -> usize {
        let mut failed = 0;
        while let Some(entry) = self.actions.pop() {
            tracing::debug!("Rolling back: {}", entry.label);
            if let Err(e) = (entry.action)() {
                failed += 1;
                tracing::warn!("Cleanup '{}' failed: {:#}", entry.label, e);
            }
        }
        failed
    }

    /// Drop every action without running it.
    pub fn discard(&mut self) {
        self.actions.clear();
    }

    /// Keep only phase-scoped actions, dropping stage-scoped ones unfired.
    pub fn into_phase(self) -> CleanupStack {
        CleanupStack {
            actions: self
                .actions
                .into_iter()
                .filter(|a| a.scope == CleanupScope::Phase)
                .collect(),
        }
    }

    /// Append another stack's actions after this one's.
    pub fn extend(&mut self, other: CleanupStack) {
        self.actions.extend(other.actions);
    }

    /// Move all actions out, leaving this stack empty.
    pub fn take(&mut self) -> CleanupStack {
        std::mem::take(self)
    }
}
