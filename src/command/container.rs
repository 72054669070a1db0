use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};

use crate::buffer::{BufferOptions, extract_frame};
use crate::config::ExecuteOptions;
use crate::error::{FailureKind, TaskFailure, ToolkitError};
use crate::executor::ExecBackend;
use crate::session::{EnvironmentLease, ShellChannel};

use super::{
    CommandRequest, CommandResult, HookSet, RequirementOutcome, derive_key, resolve_key,
    sanitize_key,
};

/// Lifecycle phase of a container.
///
/// Transitions run NEW → SETUP → REQUIREMENTS → PREPARSER → EXECUTION →
/// POSTPARSER → COMPLETION → FINALIZED; a failure in any phase still ends in
/// FINALIZED with the failure recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    New,
    Setup,
    Requirements,
    Preparser,
    Execution,
    Postparser,
    Completion,
    Finalized,
}

/// Child composition of a container.
pub enum Children {
    /// A leaf holding a single command.
    None,
    /// Unordered children executed in parallel on their own environments.
    Batched(Vec<Arc<CommandContainer>>),
    /// Ordered children executed serially, fail-fast under `stop_on_failure`.
    Queued(Vec<Arc<CommandContainer>>),
}

impl Children {
    fn as_slice(&self) -> &[Arc<CommandContainer>] {
        match self {
            Children::None => &[],
            Children::Batched(children) | Children::Queued(children) => children,
        }
    }
}

#[derive(Default)]
struct ContainerState {
    phase: Phase,
    raw: Option<String>,
    last: Option<CommandResult>,
    result: Option<CommandResult>,
    failure: bool,
    complete: bool,
    running: bool,
    parsed: bool,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// A concurrency-safe task object owning one command or a tree of commands
/// through its lifecycle.
///
/// Exactly one of the command and the children is populated. The container is
/// executed once; [`CommandContainer::reset`] returns it to a re-executable
/// state and [`CommandContainer::force_complete`] terminates it externally.
pub struct CommandContainer {
    key: String,
    command: Option<String>,
    children: Children,
    opts: ExecuteOptions,
    hooks: HookSet,
    parent: StdMutex<Weak<CommandContainer>>,
    state: StdMutex<ContainerState>,
    done: watch::Sender<bool>,
}

impl CommandContainer {
    /// Builds a container (and its child tree) from a request.
    ///
    /// Single-element batches and queues collapse to a plain command. An
    /// empty or whitespace-only command is a data-format failure before any
    /// SSH traffic happens.
    pub fn new(
        request: impl Into<CommandRequest>,
        opts: ExecuteOptions,
        hooks: HookSet,
    ) -> Result<Arc<Self>, ToolkitError> {
        Self::build(request.into(), opts, hooks, None)
    }

    fn build(
        request: CommandRequest,
        opts: ExecuteOptions,
        hooks: HookSet,
        key_override: Option<String>,
    ) -> Result<Arc<Self>, ToolkitError> {
        match request {
            CommandRequest::Prebuilt(container) => Ok(container),
            CommandRequest::Single { key, command } => {
                if command.trim().is_empty() {
                    return Err(ToolkitError::DataFormat(
                        "empty or whitespace-only command".to_string(),
                    ));
                }
                let key = match key_override {
                    Some(explicit) => resolve_key(Some(&explicit), &command),
                    None => resolve_key(key.as_deref(), &command),
                };
                Ok(Self::assemble(key, Some(command), Children::None, opts, hooks))
            }
            CommandRequest::Batch(mut map) => {
                if map.is_empty() {
                    return Err(ToolkitError::DataFormat("batch with no commands".to_string()));
                }
                if map.len() == 1 {
                    let (key, entry) = map.pop_first().expect("single entry");
                    return Self::build(entry, opts, hooks, Some(key));
                }
                let mut children = Vec::with_capacity(map.len());
                for (key, entry) in map {
                    children.push(Self::build(entry, opts.clone(), HookSet::default(), Some(key))?);
                }
                Self::warn_duplicate_keys(&children);
                let key = Self::parent_key(key_override, &children);
                let parent = Self::assemble(key, None, Children::Batched(children), opts, hooks);
                Self::link_children(&parent);
                Ok(parent)
            }
            CommandRequest::Queue(mut entries) => {
                if entries.is_empty() {
                    return Err(ToolkitError::DataFormat("queue with no commands".to_string()));
                }
                if entries.len() == 1 {
                    return Self::build(entries.remove(0), opts, hooks, key_override);
                }
                let mut children = Vec::with_capacity(entries.len());
                for entry in entries {
                    children.push(Self::build(entry, opts.clone(), HookSet::default(), None)?);
                }
                Self::warn_duplicate_keys(&children);
                let key = Self::parent_key(key_override, &children);
                let parent = Self::assemble(key, None, Children::Queued(children), opts, hooks);
                Self::link_children(&parent);
                Ok(parent)
            }
        }
    }

    fn assemble(
        key: String,
        command: Option<String>,
        children: Children,
        opts: ExecuteOptions,
        hooks: HookSet,
    ) -> Arc<Self> {
        let (done, _keepalive) = watch::channel(false);
        Arc::new(Self {
            key,
            command,
            children,
            opts,
            hooks,
            parent: StdMutex::new(Weak::new()),
            state: StdMutex::new(ContainerState::default()),
            done,
        })
    }

    fn link_children(parent: &Arc<Self>) {
        for child in parent.children.as_slice() {
            if let Ok(mut guard) = child.parent.lock() {
                *guard = Arc::downgrade(parent);
            }
        }
    }

    fn parent_key(key_override: Option<String>, children: &[Arc<Self>]) -> String {
        if let Some(explicit) = key_override {
            let sanitized = sanitize_key(&explicit);
            if !sanitized.is_empty() {
                return sanitized;
            }
        }
        let joined = children
            .iter()
            .map(|c| c.key.as_str())
            .collect::<Vec<_>>()
            .join("+");
        derive_key(&joined)
    }

    fn warn_duplicate_keys(children: &[Arc<Self>]) {
        let mut seen = std::collections::BTreeSet::new();
        for child in children {
            if !seen.insert(child.key.as_str()) {
                debug!("duplicate child key after sanitization: {}", child.key);
            }
        }
    }

    // ----- accessors -------------------------------------------------------

    /// Stable identifier of this container.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The raw command text when this is a leaf.
    pub fn command_text(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.opts
    }

    pub fn has_children(&self) -> bool {
        !matches!(self.children, Children::None)
    }

    pub fn children(&self) -> &[Arc<CommandContainer>] {
        self.children.as_slice()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().map(|s| s.phase).unwrap_or_default()
    }

    pub fn failed(&self) -> bool {
        self.state.lock().map(|s| s.failure).unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().map(|s| s.complete).unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.running).unwrap_or(false)
    }

    pub fn is_parsed(&self) -> bool {
        self.state.lock().map(|s| s.parsed).unwrap_or(false)
    }

    /// The published result. Reads are serialized by the state lock so
    /// concurrent observers see coherent values.
    pub fn results(&self) -> Option<CommandResult> {
        self.state.lock().ok().and_then(|s| s.result.clone())
    }

    /// The staged (not yet published) result.
    pub fn last_results(&self) -> Option<CommandResult> {
        self.state.lock().ok().and_then(|s| s.last.clone())
    }

    /// The unparsed buffer output of a leaf command.
    pub fn raw_results(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.raw.clone())
    }

    /// Wall-clock spent between executor entry and finalize.
    pub fn execution_length(&self) -> Option<Duration> {
        let state = self.state.lock().ok()?;
        match (state.started, state.finished) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    // ----- lifecycle -------------------------------------------------------

    /// Drives the container through its phases on the current task.
    ///
    /// `lease` is the environment reserved by the calling worker; leaf
    /// commands without one run serialized on the main environment. The
    /// container never propagates an error out of the executor: failures are
    /// stored on the container and the completion event is always signaled.
    pub async fn execute(
        self: &Arc<Self>,
        backend: &Arc<ExecBackend>,
        lease: Option<&mut EnvironmentLease>,
    ) {
        self.execute_boxed(backend, lease).await
    }

    /// Boxed form of [`execute`](Self::execute), used for the recursion into
    /// queued children.
    pub(crate) fn execute_boxed<'a>(
        self: &'a Arc<Self>,
        backend: &'a Arc<ExecBackend>,
        lease: Option<&'a mut EnvironmentLease>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.execute_inner(backend, lease))
    }

    async fn execute_inner(
        self: &Arc<Self>,
        backend: &Arc<ExecBackend>,
        mut lease: Option<&mut EnvironmentLease>,
    ) {
        if !self.begin() {
            return;
        }
        debug!(
            "executor running for {} (children: {})",
            self.key,
            self.children.as_slice().len()
        );
        let _ = self.run_setup(backend, lease.as_deref_mut()).await
            && self.run_requirements_phase().await
            && self.run_preparser_phase()
            && self.run_execution_phase(backend, lease).await;
        self.finalize();
    }

    /// Marks the container running. Refuses re-entry and re-execution
    /// without a reset.
    fn begin(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.running {
            warn!("container {} is already running", self.key);
            return false;
        }
        if state.complete {
            warn!("container {} is complete; reset it before re-executing", self.key);
            return false;
        }
        state.running = true;
        state.started = Some(Instant::now());
        state.phase = Phase::Setup;
        drop(state);
        self.done.send_replace(false);
        true
    }

    async fn run_setup(
        &self,
        backend: &Arc<ExecBackend>,
        lease: Option<&mut EnvironmentLease>,
    ) -> bool {
        if self.opts.root
            && let Some(lease) = lease
        {
            let env = lease.environment().clone();
            if let Err(e) = backend.controller().become_root(lease.channel(), true).await {
                if e.is_transport_fatal() {
                    env.mark_closed();
                }
                self.stage_failure(e);
                return false;
            }
        }
        self.check_phase_timeout(Phase::Setup)
    }

    /// Runs all requirements concurrently and collates every non-satisfied
    /// outcome into one requirements failure.
    async fn run_requirements_phase(self: &Arc<Self>) -> bool {
        self.set_phase(Phase::Requirements);
        if !self.hooks.has_requirements() {
            return true;
        }
        let budget = self.remaining_time();
        let mut tasks: JoinSet<(String, RequirementOutcome)> = JoinSet::new();
        for requirement in &self.hooks.requirements {
            let container = Arc::clone(self);
            let func = requirement.func.clone();
            let key = requirement.key.clone();
            tasks.spawn(async move { (key, (func)(&container)) });
        }

        let mut failures = Vec::new();
        let drained = timeout(budget, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, RequirementOutcome::Satisfied)) => {}
                    Ok((key, RequirementOutcome::Incomplete)) => {
                        failures.push(format!("{key} (incomplete)"));
                    }
                    Ok((key, RequirementOutcome::Failed(reason))) => {
                        failures.push(format!("{key}: {reason}"));
                    }
                    Err(e) => failures.push(format!("requirement task failed: {e}")),
                }
            }
        })
        .await;
        if drained.is_err() {
            tasks.abort_all();
            failures.push(format!("requirements did not complete within {:?}", budget));
        }

        if !failures.is_empty() {
            self.stage_failure(ToolkitError::RequirementsFailure(failures.join("; ")));
            return false;
        }
        self.check_phase_timeout(Phase::Requirements)
    }

    fn run_preparser_phase(&self) -> bool {
        self.set_phase(Phase::Preparser);
        for preparser in &self.hooks.preparsers {
            if let Err(reason) = preparser(self) {
                self.stage_failure(ToolkitError::PreparserFailure(reason));
                return false;
            }
        }
        self.check_phase_timeout(Phase::Preparser)
    }

    async fn run_execution_phase(
        self: &Arc<Self>,
        backend: &Arc<ExecBackend>,
        lease: Option<&mut EnvironmentLease>,
    ) -> bool {
        self.set_phase(Phase::Execution);
        let outcome = match (&self.command, &self.children) {
            (Some(command), _) => self.exec_single(backend, lease, command).await,
            (None, Children::Batched(_)) => self.exec_batched(backend).await,
            (None, Children::Queued(_)) => self.exec_queued(backend, lease).await,
            (None, Children::None) => Err(ToolkitError::ExecutionFailure(
                "container received no command or children".to_string(),
            )),
        };
        match outcome {
            Ok(result) => self.stage_result(result),
            Err(e) => {
                self.stage_failure(e);
                return false;
            }
        }
        self.check_phase_timeout(Phase::Execution)
    }

    async fn exec_single(
        &self,
        backend: &Arc<ExecBackend>,
        lease: Option<&mut EnvironmentLease>,
        command: &str,
    ) -> Result<CommandResult, ToolkitError> {
        match lease {
            Some(lease) => {
                let env = lease.environment().clone();
                let result = self.exec_on_channel(backend, lease.channel(), command).await;
                if let Err(e) = &result
                    && e.is_transport_fatal()
                {
                    warn!("transport-fatal failure on {}, closing environment", env.id());
                    env.mark_closed();
                }
                result
            }
            None => {
                // Unthreaded mode runs serialized on the main environment.
                let main = backend.pool().main().clone();
                let mut lease = main.acquire().await?;
                let result = self.exec_on_channel(backend, lease.channel(), command).await;
                if let Err(e) = &result
                    && e.is_transport_fatal()
                {
                    warn!("transport-fatal failure on the main environment");
                    main.mark_closed();
                }
                result
            }
        }
    }

    async fn exec_on_channel(
        &self,
        backend: &Arc<ExecBackend>,
        chan: &mut ShellChannel,
        command: &str,
    ) -> Result<CommandResult, ToolkitError> {
        let buffer = backend.controller().buffer();
        let mut bopts = BufferOptions::new(buffer.defaults().with_run(self.opts.timeout));
        bopts.no_parsing = self.opts.no_parsing;
        bopts.ignore_alias = self.opts.ignore_alias;
        if let Some(prompt) = chan.state.prompt() {
            bopts.prompt = Some(prompt.to_string());
        }
        let raw = buffer.execute(chan, command, &bopts).await?;
        if let Ok(mut state) = self.state.lock() {
            state.raw = Some(raw.clone());
        }
        Ok(CommandResult::Text(raw))
    }

    /// Batched children: submit everything to the executor, then wait on the
    /// multi-event with `max(child timeout, parent timeout)`.
    async fn exec_batched(&self, backend: &Arc<ExecBackend>) -> Result<CommandResult, ToolkitError> {
        let children = self.children.as_slice();
        let wait = children
            .iter()
            .map(|c| c.opts.timeout)
            .max()
            .unwrap_or(self.opts.timeout)
            .max(self.opts.timeout);
        for child in children {
            backend.submit(child.clone())?;
        }
        let all_done = timeout(wait, async {
            for child in children {
                child.wait_complete().await;
            }
        })
        .await
        .is_ok();
        if !all_done && self.opts.timeout_exceptions {
            return Err(ToolkitError::TotalTimeout(format!(
                "child commands timed out waiting for results: {}",
                self.key
            )));
        }
        self.collate_children(children)
    }

    /// Queued children: ordered, serial, inheriting the parent's lease when
    /// one exists so shell-state effects persist across the queue.
    async fn exec_queued(
        self: &Arc<Self>,
        backend: &Arc<ExecBackend>,
        mut lease: Option<&mut EnvironmentLease>,
    ) -> Result<CommandResult, ToolkitError> {
        let children = self.children.as_slice();
        let total: Duration = children.iter().map(|c| c.opts.timeout).sum();
        let total = if total.is_zero() { self.opts.timeout } else { total };
        let deadline = Instant::now() + total;

        for (idx, child) in children.iter().enumerate() {
            if Instant::now() >= deadline {
                for rest in &children[idx..] {
                    rest.force_complete(None);
                }
                return Err(ToolkitError::TotalTimeout(format!(
                    "queue execution timed out before child command: {} : {}",
                    self.key, child.key
                )));
            }
            match lease.as_deref_mut() {
                Some(lease) => child.execute_boxed(backend, Some(lease)).await,
                None => {
                    backend.submit(child.clone())?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let _ = timeout(remaining, child.wait_complete()).await;
                }
            }
            if self.opts.stop_on_failure && child.failed() {
                warn!(
                    "child command failed and stopped queue execution: {} : {}",
                    self.key, child.key
                );
                for rest in &children[idx + 1..] {
                    rest.force_complete(None);
                }
                // The queue is failed, but the results gathered so far stay
                // visible: only the executed children appear in the map.
                self.mark_failure();
                let mut partial = BTreeMap::new();
                for executed in &children[..=idx] {
                    let result = executed.results().unwrap_or_else(|| {
                        CommandResult::Failure(TaskFailure::new(
                            FailureKind::Execution,
                            "child never published a result",
                        ))
                    });
                    partial.insert(executed.key.clone(), result);
                }
                return Ok(CommandResult::Map(partial));
            }
        }
        self.collate_children(children)
    }

    fn collate_children(
        &self,
        children: &[Arc<CommandContainer>],
    ) -> Result<CommandResult, ToolkitError> {
        let mut map = BTreeMap::new();
        for child in children {
            let result = child.results().unwrap_or_else(|| {
                CommandResult::Failure(TaskFailure::new(
                    FailureKind::Execution,
                    "child never published a result",
                ))
            });
            map.insert(child.key.clone(), result);
        }
        if !children.is_empty() && children.iter().all(|c| c.failed()) {
            warn!("all children failed: {}", self.key);
            return Err(ToolkitError::ExecutionFailure(format!(
                "all child commands failed: {}",
                self.key
            )));
        }
        // Under stop_on_failure any failed child fails the parent, batched
        // compositions included; the child results stay visible in the map.
        if self.opts.stop_on_failure && children.iter().any(|c| c.failed()) {
            warn!("child command failed under stop_on_failure: {}", self.key);
            self.mark_failure();
        }
        Ok(CommandResult::Map(map))
    }

    /// Post-parse, completion and failure hooks, then result publication.
    /// Always signals the completion event.
    pub(crate) fn finalize(&self) {
        self.set_phase(Phase::Postparser);
        let (failed, stop_on_failure) = match self.state.lock() {
            Ok(state) => (state.failure, self.opts.stop_on_failure),
            Err(_) => (true, false),
        };

        if !(stop_on_failure && failed) {
            match self.parse_results() {
                Ok(result) => {
                    self.stage_result(result);
                    let _ = self.check_phase_timeout(Phase::Postparser);
                }
                Err(e) => self.stage_failure(e),
            }
            if !self.failed()
                && let Some(completion) = &self.hooks.completion
            {
                self.set_phase(Phase::Completion);
                let current = self
                    .last_results()
                    .unwrap_or_else(|| CommandResult::Text(String::new()));
                match completion(current, self) {
                    Ok(result) => self.stage_result(result),
                    Err(reason) => {
                        self.stage_failure(ToolkitError::CompletionTaskFailure(reason));
                    }
                }
            }
        }

        if self.failed()
            && let Some(on_failure) = &self.hooks.on_failure
        {
            let current = self
                .last_results()
                .unwrap_or_else(|| CommandResult::Text(String::new()));
            match on_failure(current, self) {
                Ok(result) => self.stage_result(result),
                Err(reason) => self.stage_failure(ToolkitError::SetFailureFailure(reason)),
            }
        }

        let published = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let result = state.last.take().unwrap_or_else(|| {
                if state.failure {
                    CommandResult::Failure(TaskFailure::new(
                        FailureKind::Execution,
                        "container finalized without a result",
                    ))
                } else {
                    CommandResult::Text(String::new())
                }
            });
            state.result = Some(result.clone());
            state.parsed = true;
            state.complete = true;
            state.running = false;
            state.finished = Some(Instant::now());
            state.phase = Phase::Finalized;
            result
        };
        self.done.send_replace(true);

        let parent = self.parent.lock().ok().and_then(|weak| weak.upgrade());
        if let Some(parent) = parent {
            parent.note_child_result(&self.key, published, self.failed());
        }
        debug!("command object completed: {}", self.key);
    }

    /// Default frame extraction followed by the custom post-parsers.
    fn parse_results(&self) -> Result<CommandResult, ToolkitError> {
        let (last, raw) = match self.state.lock() {
            Ok(state) => (state.last.clone(), state.raw.clone()),
            Err(_) => (None, None),
        };
        let mut result =
            last.unwrap_or_else(|| CommandResult::Text(raw.unwrap_or_default()));
        if !self.opts.no_parsing
            && !self.has_children()
            && let CommandResult::Text(text) = &result
        {
            result = CommandResult::Text(extract_frame(text));
        }
        for postparser in &self.hooks.postparsers {
            result = postparser(result, self).map_err(ToolkitError::PostparserFailure)?;
        }
        Ok(result)
    }

    /// Records a finished child's result on this parent.
    fn note_child_result(&self, key: &str, result: CommandResult, child_failed: bool) {
        if child_failed {
            debug!("child {} of {} reported a failure", key, self.key);
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match &mut state.last {
            Some(CommandResult::Map(map)) => {
                map.insert(key.to_string(), result);
            }
            _ => {
                let mut map = BTreeMap::new();
                map.insert(key.to_string(), result);
                state.last = Some(CommandResult::Map(map));
            }
        }
    }

    /// Marks this container (and every child) terminally failed without
    /// running further phases. All waiters unblock.
    pub fn force_complete(&self, results: Option<CommandResult>) {
        info!("forcing completion for command object: {}", self.key);
        for child in self.children.as_slice() {
            child.force_complete(results.clone());
        }
        if let Ok(mut state) = self.state.lock() {
            state.failure = true;
            state.parsed = true;
            state.running = false;
            state.complete = true;
            if state.result.is_none() {
                state.result = Some(results.unwrap_or_else(|| {
                    CommandResult::Failure(TaskFailure::new(
                        FailureKind::ForceComplete,
                        format!("container was force-completed: {}", self.key),
                    ))
                }));
            }
            state.finished = Some(Instant::now());
        }
        self.done.send_replace(true);
    }

    /// Clears all execution state so the container can run again with the
    /// same configuration.
    pub fn reset(&self) {
        info!("resetting command object: {}", self.key);
        for child in self.children.as_slice() {
            child.reset();
        }
        if let Ok(mut state) = self.state.lock() {
            *state = ContainerState::default();
        }
        self.done.send_replace(false);
    }

    /// Fails the container without executing it. Used when no environment
    /// could be leased.
    pub(crate) fn abort(&self, err: ToolkitError) {
        self.stage_failure(err);
        self.finalize();
    }

    /// Blocks until the completion event is signaled.
    pub async fn wait_complete(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Waits for the published result, up to `wait` (default: the
    /// container's own timeout budget).
    ///
    /// Returns `None` on timeout unless `timeout_exceptions` is set, in which
    /// case a typed timeout failure is returned instead.
    pub async fn wait_for_results(&self, wait: Option<Duration>) -> Option<CommandResult> {
        let wait = wait.unwrap_or_else(|| self.default_wait());
        match timeout(wait, self.wait_complete()).await {
            Ok(()) => self.results(),
            Err(_) => {
                if self.opts.timeout_exceptions {
                    Some(CommandResult::Failure(TaskFailure::new(
                        FailureKind::TotalTimeout,
                        format!("command timed out waiting for results: {}", self.key),
                    )))
                } else {
                    None
                }
            }
        }
    }

    fn default_wait(&self) -> Duration {
        match &self.children {
            Children::Queued(children) => children
                .iter()
                .map(|c| c.opts.timeout)
                .sum::<Duration>()
                .max(self.opts.timeout),
            Children::Batched(children) => children
                .iter()
                .map(|c| c.opts.timeout)
                .max()
                .unwrap_or(self.opts.timeout)
                .max(self.opts.timeout),
            Children::None => self.opts.timeout,
        }
    }

    // ----- state plumbing --------------------------------------------------

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
    }

    fn stage_result(&self, result: CommandResult) {
        if let Ok(mut state) = self.state.lock() {
            state.last = Some(result);
        }
    }

    fn stage_failure(&self, err: ToolkitError) {
        warn!("a failure occurred for command {}: {}", self.key, err);
        if let Ok(mut state) = self.state.lock() {
            state.failure = true;
            state.last = Some(CommandResult::Failure(TaskFailure::from(&err)));
        }
    }

    /// Sets the failure flag without touching the staged result.
    fn mark_failure(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = true;
        }
    }

    fn remaining_time(&self) -> Duration {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.started)
            .map(|started| self.opts.timeout.saturating_sub(started.elapsed()))
            .unwrap_or(self.opts.timeout)
    }

    /// Enforces the container timeout at the end of a phase.
    fn check_phase_timeout(&self, phase: Phase) -> bool {
        let exceeded = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.started)
            .is_some_and(|started| started.elapsed() > self.opts.timeout);
        if exceeded {
            debug!("command {} timed out during phase {:?}", self.key, phase);
            self.stage_failure(ToolkitError::TotalTimeout(format!(
                "command timed out during {:?} phase: {}",
                phase, self.key
            )));
            return false;
        }
        true
    }
}

impl std::fmt::Debug for CommandContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContainer")
            .field("key", &self.key)
            .field("command", &self.command)
            .field("children", &self.children.as_slice().len())
            .field("phase", &self.phase())
            .field("failure", &self.failed())
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(command: &str, opts: ExecuteOptions, hooks: HookSet) -> Arc<CommandContainer> {
        CommandContainer::new(command, opts, hooks).expect("container")
    }

    /// Puts a leaf container into the state it has right after the execution
    /// phase stored raw buffer output.
    fn stage_raw(container: &CommandContainer, raw: &str) {
        let mut state = container.state.lock().expect("state");
        state.running = true;
        state.started = Some(Instant::now());
        state.raw = Some(raw.to_string());
        state.last = Some(CommandResult::Text(raw.to_string()));
    }

    const FRAMED_OUTPUT: &str =
        "COLUMNS=200; export COLUMNS; echo CMDSTART && uname -r && echo CMDEND\nCMDSTART\n5.14.0\nCMDEND\nbash-5.1$";

    #[test]
    fn finalize_extracts_frame_by_default() {
        let container = leaf("uname -r", ExecuteOptions::default(), HookSet::default());
        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();

        assert_eq!(
            container.results(),
            Some(CommandResult::Text("5.14.0".to_string()))
        );
        assert!(container.is_complete());
        assert!(!container.failed());
        assert_eq!(container.phase(), Phase::Finalized);
    }

    #[test]
    fn no_parsing_skips_frame_extraction() {
        let container = leaf(
            "uname -r",
            ExecuteOptions::default().no_parsing(true),
            HookSet::default(),
        );
        stage_raw(&container, "raw body without markers");
        container.finalize();
        assert_eq!(
            container.results(),
            Some(CommandResult::Text("raw body without markers".to_string()))
        );
    }

    #[test]
    fn postparsers_run_in_order_on_extracted_result() {
        let hooks = HookSet::new()
            .postparser(|result, _| {
                Ok(CommandResult::Text(format!(
                    "a:{}",
                    result.as_text().unwrap_or("")
                )))
            })
            .postparser(|result, _| {
                Ok(CommandResult::Text(format!(
                    "b:{}",
                    result.as_text().unwrap_or("")
                )))
            });
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();
        assert_eq!(
            container.results(),
            Some(CommandResult::Text("b:a:5.14.0".to_string()))
        );
    }

    #[test]
    fn postparser_error_becomes_typed_failure() {
        let hooks = HookSet::new().postparser(|_, _| Err("cannot parse".to_string()));
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();

        assert!(container.failed());
        let failure = container.results().and_then(|r| r.failure().cloned());
        assert_eq!(failure.map(|f| f.kind), Some(FailureKind::Postparser));
        assert!(container.is_complete());
    }

    #[test]
    fn completion_failure_still_completes() {
        let hooks = HookSet::new().completion(|_, _| Err("unexpected output".to_string()));
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();

        assert!(container.failed());
        assert!(container.is_complete());
        let failure = container.results().and_then(|r| r.failure().cloned());
        assert_eq!(failure.map(|f| f.kind), Some(FailureKind::CompletionTask));
    }

    #[test]
    fn failure_hook_rewrites_final_result() {
        let hooks = HookSet::new()
            .postparser(|_, _| Err("boom".to_string()))
            .on_failure(|_, _| Ok(CommandResult::Text("recovered".to_string())));
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();

        assert!(container.failed());
        assert_eq!(
            container.results(),
            Some(CommandResult::Text("recovered".to_string()))
        );
    }

    #[test]
    fn failure_hook_error_is_set_failure_kind() {
        let hooks = HookSet::new()
            .postparser(|_, _| Err("boom".to_string()))
            .on_failure(|_, _| Err("hook broke too".to_string()));
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();

        let failure = container.results().and_then(|r| r.failure().cloned());
        assert_eq!(failure.map(|f| f.kind), Some(FailureKind::SetFailure));
    }

    #[test]
    fn stop_on_failure_skips_parsing_of_failed_containers() {
        let hooks = HookSet::new()
            .postparser(|_, _| panic!("postparser must not run after a failure"));
        let container = leaf(
            "uname -r",
            ExecuteOptions::default().stop_on_failure(true),
            hooks,
        );
        container.abort(ToolkitError::ExecutionFailure("no environment".to_string()));

        assert!(container.failed());
        assert!(container.is_complete());
        let failure = container.results().and_then(|r| r.failure().cloned());
        assert_eq!(failure.map(|f| f.kind), Some(FailureKind::Execution));
    }

    #[tokio::test]
    async fn requirements_failures_collate() {
        let hooks = HookSet::new()
            .requirement("disk", |_| RequirementOutcome::Satisfied)
            .requirement("memory", |_| {
                RequirementOutcome::Failed("not enough memory".to_string())
            })
            .requirement("network", |_| RequirementOutcome::Incomplete);
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        assert!(container.begin());
        let ok = container.run_requirements_phase().await;

        assert!(!ok);
        container.finalize();
        let failure = container.results().and_then(|r| r.failure().cloned());
        let failure = failure.expect("requirements failure");
        assert_eq!(failure.kind, FailureKind::Requirements);
        assert!(failure.message.contains("memory: not enough memory"));
        assert!(failure.message.contains("network (incomplete)"));
        assert!(!failure.message.contains("disk:"));
    }

    #[tokio::test]
    async fn satisfied_requirements_pass() {
        let hooks = HookSet::new().requirement("always", |_| RequirementOutcome::Satisfied);
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        assert!(container.begin());
        assert!(container.run_requirements_phase().await);
        assert!(!container.failed());
    }

    #[test]
    fn preparser_failure_short_circuits() {
        let hooks = HookSet::new().preparser(|_| Err("bad input".to_string()));
        let container = leaf("uname -r", ExecuteOptions::default(), hooks);
        assert!(container.begin());
        assert!(!container.run_preparser_phase());
        container.finalize();
        let failure = container.results().and_then(|r| r.failure().cloned());
        assert_eq!(failure.map(|f| f.kind), Some(FailureKind::Preparser));
    }

    #[test]
    fn phase_timeout_is_detected_after_a_phase() {
        let container = leaf(
            "uname -r",
            ExecuteOptions::default().timeout(Duration::from_secs(1)),
            HookSet::default(),
        );
        {
            let mut state = container.state.lock().expect("state");
            state.running = true;
            state.started = Some(Instant::now() - Duration::from_secs(5));
        }
        assert!(!container.check_phase_timeout(Phase::Execution));
        assert!(container.failed());
        let failure = container.last_results().and_then(|r| r.failure().cloned());
        assert_eq!(failure.map(|f| f.kind), Some(FailureKind::TotalTimeout));
    }

    #[test]
    fn begin_refuses_reentry_until_reset() {
        let container = leaf("uname -r", ExecuteOptions::default(), HookSet::default());
        assert!(container.begin());
        assert!(!container.begin());

        stage_raw(&container, FRAMED_OUTPUT);
        container.finalize();
        assert!(!container.begin());

        container.reset();
        assert!(container.begin());
    }

    #[test]
    fn stop_on_failure_fails_a_batched_parent_on_any_failed_child() {
        let parent = CommandContainer::new(
            CommandRequest::batch([("a", "echo a"), ("b", "false")]),
            ExecuteOptions::default().stop_on_failure(true),
            HookSet::default(),
        )
        .expect("parent");
        stage_raw(&parent.children()[0], FRAMED_OUTPUT);
        parent.children()[0].finalize();
        parent.children()[1].abort(ToolkitError::ExecutionFailure("boom".to_string()));

        let collated = parent
            .collate_children(parent.children())
            .expect("partial failure still yields the result map");
        let map = collated.as_map().expect("map variant");
        assert_eq!(map.len(), 2);
        assert!(parent.failed());
    }

    #[test]
    fn batched_parent_without_stop_on_failure_tolerates_partial_failure() {
        let parent = CommandContainer::new(
            CommandRequest::batch([("a", "echo a"), ("b", "false")]),
            ExecuteOptions::default(),
            HookSet::default(),
        )
        .expect("parent");
        stage_raw(&parent.children()[0], FRAMED_OUTPUT);
        parent.children()[0].finalize();
        parent.children()[1].abort(ToolkitError::ExecutionFailure("boom".to_string()));

        let collated = parent.collate_children(parent.children());
        assert!(collated.is_ok());
        assert!(!parent.failed());

        // All children failed still fails the parent regardless of the flag.
        parent.children()[0].force_complete(None);
        let err = parent
            .collate_children(parent.children())
            .expect_err("all children failed");
        assert!(matches!(err, ToolkitError::ExecutionFailure(_)));
    }

    #[test]
    fn child_results_merge_into_parent_map() {
        let parent = CommandContainer::new(
            CommandRequest::batch([("a", "echo a"), ("b", "echo b"), ("c", "echo c")]),
            ExecuteOptions::default(),
            HookSet::default(),
        )
        .expect("parent");

        parent.note_child_result("a", CommandResult::Text("a".to_string()), false);
        parent.note_child_result("b", CommandResult::Text("b".to_string()), true);
        let map = parent.last_results().expect("map");
        let map = map.as_map().expect("map variant");
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"].as_text(), Some("a"));
    }
}
