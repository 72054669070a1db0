use super::*;

use crate::buffer::{BufferOptions, extract_frame, last_nonempty_line};
use crate::config::RootLogin;
use crate::shell::{BASH, Escalation, EscalationKind, PROMPT_TERMINATORS};

/// Captures the user name out of sudo's `[sudo] password for X:` prompt.
static PASSWORD_FOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"assword for ([^:]+):").unwrap());

/// Behavior switches for [`EnvironmentController::become_user`].
#[derive(Debug, Clone, Copy)]
pub struct BecomeUserOptions {
    /// Escalate again even when the target user is already lower in the
    /// stack, instead of de-escalating back to it.
    pub user_escalation: bool,
    /// Run a `whoami` check after escalation and fail when it mismatches.
    pub verify_user: bool,
    /// Re-capture the prompt once the escalation completes.
    pub recapture_prompt: bool,
}

impl Default for BecomeUserOptions {
    fn default() -> Self {
        Self {
            user_escalation: false,
            verify_user: true,
            recapture_prompt: true,
        }
    }
}

/// One expect/send exchange inside a scripted console escalation.
///
/// `expect` is matched as a substring of the last output line; `input` is sent
/// when it appears. Multi-step flows like `oraenv` chain several of these.
#[derive(Debug, Clone)]
pub struct ExpectStep {
    pub expect: String,
    pub input: String,
}

impl ExpectStep {
    pub fn new(expect: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            expect: expect.into(),
            input: input.into(),
        }
    }
}

/// A console or environment escalation request.
#[derive(Debug, Clone)]
pub struct ConsoleEscalation {
    /// The escalation command, e.g. `mysql` or `sqlplus`.
    pub command: String,
    /// Additional arguments appended after the command.
    pub args: String,
    /// Secondary input sent after the command, usually a password.
    pub input: Option<String>,
    /// Recorded name for the entry; defaults to the command itself.
    pub name: Option<String>,
    /// Scripted expect/send exchanges replacing the default flow.
    pub hook: Option<Vec<ExpectStep>>,
    /// Re-capture the prompt after the escalation returns.
    pub recapture: bool,
}

impl ConsoleEscalation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: String::new(),
            input: None,
            name: None,
            hook: None,
            recapture: true,
        }
    }

    pub fn args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hook(mut self, steps: Vec<ExpectStep>) -> Self {
        self.hook = Some(steps);
        self
    }

    pub fn recapture(mut self, recapture: bool) -> Self {
        self.recapture = recapture;
        self
    }

    fn full_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args)
        }
    }
}

impl EnvironmentController {
    pub fn new(options: Arc<ConnectOptions>) -> Self {
        Self {
            buffer: BufferController::new(options.timeouts),
            options,
        }
    }

    /// The buffer controller used for all reads and writes.
    pub fn buffer(&self) -> &BufferController {
        &self.buffer
    }

    /// Brings a freshly opened shell to a known state: waits for the login
    /// prompt, records the baseline user, then escalates to root or into a
    /// clean `bash -norc` shell per configuration.
    pub async fn bootstrap(&self, chan: &mut ShellChannel) -> Result<(), ToolkitError> {
        let timeouts = self.buffer.defaults().with_run(Duration::from_secs(10));
        self.buffer.prompt_wait(chan, timeouts, 0).await?;
        chan.state.push(Escalation::user(
            &self.options.username,
            "su -",
            Some(self.options.password.clone()),
        ));
        if self.options.root {
            self.become_root(chan, true).await?;
        } else if self.options.use_bash_norc {
            self.console_escalation(
                chan,
                ConsoleEscalation::new("bash").args("-norc").name(BASH),
            )
            .await?;
        } else {
            self.capture_prompt(chan, true).await?;
        }
        Ok(())
    }

    /// Returns the stored prompt, capturing it from the live shell when none
    /// is stored or `recapture` is set.
    pub async fn capture_prompt(
        &self,
        chan: &mut ShellChannel,
        recapture: bool,
    ) -> Result<Option<String>, ToolkitError> {
        if !recapture && chan.state.prompt.is_some() {
            return Ok(chan.state.prompt.clone());
        }
        let prompt = self.buffer.capture_prompt(chan).await?;
        if let Some(prompt) = &prompt {
            chan.state.set_prompt(prompt.clone());
        }
        Ok(prompt)
    }

    /// The authoritative user check: runs `whoami` framed through the buffer
    /// and extracts the token.
    pub async fn check_whoami(&self, chan: &mut ShellChannel) -> Result<String, ToolkitError> {
        let opts = BufferOptions::new(self.buffer.defaults());
        let output = self.buffer.execute(chan, "whoami", &opts).await?;
        Ok(extract_frame(&output))
    }

    /// Escalates to root with the configured login command, falling back to
    /// the alternate strategy when permitted.
    pub async fn become_root(
        &self,
        chan: &mut ShellChannel,
        verify_user: bool,
    ) -> Result<(), ToolkitError> {
        let login = self.options.root_login;
        let password = self.options.effective_root_password().to_string();
        self.become_user(
            chan,
            login.command(),
            "root",
            Some(&password),
            BecomeUserOptions {
                verify_user,
                ..Default::default()
            },
        )
        .await
    }

    /// Escalates or de-escalates to `user` on the leased environment.
    ///
    /// Becoming the current user is a no-op. When the target is already lower
    /// in the stack and `user_escalation` is off, the controller pops `exit`s
    /// until the user is current again. Otherwise the login command runs with
    /// password-prompt handling, optional verification, and an
    /// alternate-strategy retry (`su -` ↔ `sudo su -`) unless the
    /// configuration pins the login command.
    pub async fn become_user(
        &self,
        chan: &mut ShellChannel,
        login_cmd: &str,
        user: &str,
        password: Option<&str>,
        opts: BecomeUserOptions,
    ) -> Result<(), ToolkitError> {
        if chan.is_closed() {
            return Err(ToolkitError::ClosedBuffer(
                "channel closed before escalation".to_string(),
            ));
        }
        if chan.state.current_user() == user {
            debug!("already {}, skipping escalation", user);
            return Ok(());
        }
        if chan.state.users().contains(&user) && !opts.user_escalation {
            return self.become_previous_user(chan, user).await;
        }

        if chan.state.prompt.is_none() {
            self.capture_prompt(chan, true).await?;
        }

        // sudo logins always clear the cache first so the password prompt is
        // observable.
        let login_cmd = if login_cmd.contains("sudo") {
            RootLogin::SudoSu.command()
        } else {
            login_cmd
        };

        let result = self
            .escalate_user(chan, login_cmd, user, password, opts.verify_user)
            .await;
        match result {
            Ok(()) => {}
            Err(ToolkitError::BecomeUserFailure(reason)) if !self.options.root_login_explicit => {
                let alternate = RootLogin::parse(login_cmd).alternate();
                warn!(
                    "unable to become {} with '{}' ({}), retrying with '{}'",
                    user,
                    login_cmd,
                    reason,
                    alternate.command()
                );
                self.clear_login_attempt(chan).await;
                self.escalate_user(chan, alternate.command(), user, password, opts.verify_user)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        // Custom prompts confuse the framing layer; drop into bash -norc when
        // the new user's prompt is not the default one.
        if opts.recapture_prompt && self.options.use_bash_norc && !chan.state.is_prompt_default() {
            self.console_escalation(
                chan,
                ConsoleEscalation::new("bash").args("-norc").name(BASH),
            )
            .await?;
        }
        Ok(())
    }

    /// One escalation attempt: send the login command, feed the password when
    /// prompted, wait for a prompt, verify, then record the entry.
    async fn escalate_user(
        &self,
        chan: &mut ShellChannel,
        login_cmd: &str,
        user: &str,
        password: Option<&str>,
        verify: bool,
    ) -> Result<(), ToolkitError> {
        let cmd = format!("{login_cmd} {user}");
        let timeouts = self.buffer.defaults();

        let unsafe_opts = BufferOptions::new(timeouts).unsafe_mode();
        let mut output = self.buffer.execute(chan, &cmd, &unsafe_opts).await?;
        output.push('\n');
        output.push_str(&self.buffer.password_wait(chan, &cmd, timeouts).await?);

        let sent_password = self.insert_password(chan, &cmd, password, &output).await?;
        self.buffer.prompt_wait(chan, timeouts, 1).await?;

        if verify {
            let who = self.check_whoami(chan).await?;
            if !who.contains(user) {
                return Err(ToolkitError::BecomeUserFailure(format!(
                    "whoami returned '{}' instead of '{}'",
                    who, user
                )));
            }
        }

        chan.state.push(Escalation::user(user, cmd, sent_password));
        self.capture_prompt(chan, true).await?;
        info!(
            "{} escalated to {} (stack depth {})",
            chan.tag(),
            user,
            chan.state.depth()
        );
        Ok(())
    }

    /// Feeds the password when the last output line is a password prompt.
    /// Resolves sudo's per-user prompt variants against the recorded stack.
    async fn insert_password(
        &self,
        chan: &mut ShellChannel,
        cmd: &str,
        password: Option<&str>,
        output: &str,
    ) -> Result<Option<String>, ToolkitError> {
        let Some(line) = last_nonempty_line(output) else {
            return Ok(None);
        };
        if !line.contains("assword") {
            if line.ends_with(PROMPT_TERMINATORS) {
                debug!("found a prompt, skipping password insert");
            }
            return Ok(None);
        }

        let mut resolved = password
            .map(str::to_string)
            .unwrap_or_else(|| self.options.password.clone());
        if cmd.contains("sudo") {
            if line.contains("assword for root") {
                resolved = self.options.effective_root_password().to_string();
            } else if let Some(caps) = PASSWORD_FOR.captures(&line) {
                let requested = caps[1].trim().to_string();
                resolved = chan
                    .state
                    .password_for(&requested)
                    .map(str::to_string)
                    .unwrap_or_else(|| self.options.password.clone());
            } else {
                resolved = self.options.password.clone();
            }
        }

        let unsafe_opts = BufferOptions::new(self.buffer.defaults()).unsafe_mode();
        self.buffer.execute(chan, &resolved, &unsafe_opts).await?;
        Ok(Some(resolved))
    }

    /// De-escalates by popping `exit`s until `user` is current again.
    async fn become_previous_user(
        &self,
        chan: &mut ShellChannel,
        user: &str,
    ) -> Result<(), ToolkitError> {
        debug!("de-escalating back to {}", user);
        while chan.state.current_user() != user {
            if !chan.state.users().contains(&user) {
                return Err(ToolkitError::BecomeUserFailure(format!(
                    "{} is no longer on the escalation stack",
                    user
                )));
            }
            self.logout_current(chan, false).await?;
        }
        self.capture_prompt(chan, true).await?;
        let who = self.check_whoami(chan).await?;
        if !who.contains(user) {
            warn!(
                "de-escalation expected {} but whoami returned '{}'",
                user, who
            );
        }
        Ok(())
    }

    /// Recovers the shell after a failed login attempt so the alternate
    /// strategy starts from a prompt. Returns whether a prompt was seen.
    async fn clear_login_attempt(&self, chan: &mut ShellChannel) -> bool {
        for _ in 0..5 {
            match self.buffer.capture_prompt(chan).await {
                Ok(Some(line)) if line.ends_with(PROMPT_TERMINATORS) => return true,
                Ok(_) => {}
                Err(e) => {
                    debug!("clear_login_attempt read failed: {}", e);
                    return false;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    /// Pushes a console on the environment: `mysql`, `sqlplus`, a different
    /// shell. The prompt is re-captured exactly once after the escalation
    /// command returns, unless disabled.
    pub async fn console_escalation(
        &self,
        chan: &mut ShellChannel,
        escalation: ConsoleEscalation,
    ) -> Result<(), ToolkitError> {
        self.perform_escalation(chan, escalation, EscalationKind::Console)
            .await
    }

    /// Records a non-console environment mutation such as `export VAR=...`.
    /// Exports do not change the prompt, so no re-capture happens.
    pub async fn environment_change(
        &self,
        chan: &mut ShellChannel,
        name: &str,
        command: &str,
    ) -> Result<(), ToolkitError> {
        let escalation = ConsoleEscalation::new(command).name(name).recapture(false);
        self.perform_escalation(chan, escalation, EscalationKind::Env)
            .await
    }

    async fn perform_escalation(
        &self,
        chan: &mut ShellChannel,
        escalation: ConsoleEscalation,
        kind: EscalationKind,
    ) -> Result<(), ToolkitError> {
        let cmd = escalation.full_command();
        let timeouts = self.buffer.defaults();
        let unsafe_opts = BufferOptions::new(timeouts).unsafe_mode();

        if let Some(steps) = &escalation.hook {
            self.buffer.execute(chan, &cmd, &unsafe_opts).await?;
            for step in steps {
                self.buffer.await_text(chan, &step.expect, timeouts).await?;
                chan.send_line(&step.input).await?;
            }
        } else {
            self.buffer.execute(chan, &cmd, &unsafe_opts).await?;
            if let Some(input) = &escalation.input {
                self.buffer.execute(chan, input, &unsafe_opts).await?;
            }
        }

        let name = escalation
            .name
            .clone()
            .unwrap_or_else(|| escalation.command.clone());
        let entry = match kind {
            EscalationKind::Env => Escalation::env_change(name, cmd),
            _ => Escalation::console(name, cmd, escalation.input.clone()),
        };
        chan.state.push(entry);

        if escalation.recapture {
            self.capture_prompt(chan, true).await?;
        }
        Ok(())
    }

    /// Sends one `exit`, popping the top escalation.
    pub async fn logout_current(
        &self,
        chan: &mut ShellChannel,
        recapture: bool,
    ) -> Result<(), ToolkitError> {
        if chan.state.is_empty() {
            return Ok(());
        }
        let unsafe_opts = BufferOptions::new(self.buffer.defaults()).unsafe_mode();
        match self.buffer.execute(chan, "exit", &unsafe_opts).await {
            Ok(_) => {}
            // Exiting the last shell closes the channel; that is not an error
            // for a logout.
            Err(ToolkitError::ClosedBuffer(_)) => {}
            Err(e) => return Err(e),
        }
        chan.state.pop();
        if !chan.is_closed() {
            info!(
                "connection still valid on {} - escalations left: {}",
                chan.tag(),
                chan.state.escalation_count()
            );
            if recapture {
                self.capture_prompt(chan, true).await?;
            }
        } else {
            info!("connection closed on {}", chan.tag());
        }
        Ok(())
    }

    /// Unwinds escalations until a console entry has been popped.
    pub async fn logout_console(&self, chan: &mut ShellChannel) -> Result<(), ToolkitError> {
        loop {
            let unsafe_opts = BufferOptions::new(self.buffer.defaults()).unsafe_mode();
            match self.buffer.execute(chan, "exit", &unsafe_opts).await {
                Ok(_) | Err(ToolkitError::ClosedBuffer(_)) => {}
                Err(e) => return Err(e),
            }
            match chan.state.pop() {
                Some(entry) if entry.kind == EscalationKind::Console => break,
                Some(_) => continue,
                None => {
                    return Err(ToolkitError::ExecutionFailure(
                        "no console escalation to log out of".to_string(),
                    ));
                }
            }
        }
        self.capture_prompt(chan, true).await?;
        Ok(())
    }

    /// Gracefully logs out of every escalation on the environment.
    pub async fn disconnect(&self, chan: &mut ShellChannel) -> Result<(), ToolkitError> {
        let escalations = chan.state.escalation_count();
        for _ in 0..escalations {
            if chan.is_closed() {
                break;
            }
            if let Err(e) = self.logout_current(chan, false).await {
                debug!("logout during disconnect failed: {}", e);
                break;
            }
        }
        Ok(())
    }
}
