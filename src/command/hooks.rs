use std::fmt;
use std::sync::Arc;

use super::{CommandContainer, CommandResult};

/// The outcome of one requirement check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementOutcome {
    /// The precondition holds.
    Satisfied,
    /// The check could not finish; treated as a failure.
    Incomplete,
    /// The precondition does not hold.
    Failed(String),
}

type RequirementFn = dyn Fn(&CommandContainer) -> RequirementOutcome + Send + Sync;

/// A named precondition evaluated before a command executes.
///
/// Requirements run concurrently; each result is recorded under its key and
/// any non-satisfied outcome collates into one requirements failure.
#[derive(Clone)]
pub struct Requirement {
    pub key: String,
    pub(crate) func: Arc<RequirementFn>,
}

impl Requirement {
    pub fn new(
        key: impl Into<String>,
        func: impl Fn(&CommandContainer) -> RequirementOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirement").field("key", &self.key).finish()
    }
}

/// Runs before execution; an `Err` short-circuits the container.
pub type PreParser = Arc<dyn Fn(&CommandContainer) -> Result<(), String> + Send + Sync>;

/// Transforms the (default-extracted) result after execution.
pub type PostParser =
    Arc<dyn Fn(CommandResult, &CommandContainer) -> Result<CommandResult, String> + Send + Sync>;

/// Runs once the result is parsed. Returning `Err` marks the container failed
/// but it still completes.
pub type CompletionTask =
    Arc<dyn Fn(CommandResult, &CommandContainer) -> Result<CommandResult, String> + Send + Sync>;

/// Rewrites the final result when the container failed. Its own error becomes
/// a set-failure failure.
pub type FailureHook =
    Arc<dyn Fn(CommandResult, &CommandContainer) -> Result<CommandResult, String> + Send + Sync>;

/// The callable hooks attached to one container.
#[derive(Clone, Default)]
pub struct HookSet {
    pub(crate) requirements: Vec<Requirement>,
    pub(crate) preparsers: Vec<PreParser>,
    pub(crate) postparsers: Vec<PostParser>,
    pub(crate) completion: Option<CompletionTask>,
    pub(crate) on_failure: Option<FailureHook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named requirement.
    pub fn requirement(
        mut self,
        key: impl Into<String>,
        func: impl Fn(&CommandContainer) -> RequirementOutcome + Send + Sync + 'static,
    ) -> Self {
        self.requirements.push(Requirement::new(key, func));
        self
    }

    /// Adds a pre-parser, run in registration order.
    pub fn preparser(
        mut self,
        func: impl Fn(&CommandContainer) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.preparsers.push(Arc::new(func));
        self
    }

    /// Adds a post-parser, run in registration order on the extracted result.
    pub fn postparser(
        mut self,
        func: impl Fn(CommandResult, &CommandContainer) -> Result<CommandResult, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.postparsers.push(Arc::new(func));
        self
    }

    /// Sets the completion task.
    pub fn completion(
        mut self,
        func: impl Fn(CommandResult, &CommandContainer) -> Result<CommandResult, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.completion = Some(Arc::new(func));
        self
    }

    /// Sets the on-failure hook.
    pub fn on_failure(
        mut self,
        func: impl Fn(CommandResult, &CommandContainer) -> Result<CommandResult, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(func));
        self
    }

    pub fn has_requirements(&self) -> bool {
        !self.requirements.is_empty()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("requirements", &self.requirements.len())
            .field("preparsers", &self.preparsers.len())
            .field("postparsers", &self.postparsers.len())
            .field("completion", &self.completion.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}
