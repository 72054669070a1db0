use super::*;

impl ShellState {
    /// A fresh state with no recorded escalations and no captured prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new escalation on top of the stack.
    pub fn push(&mut self, entry: Escalation) {
        self.stack.push(entry);
    }

    /// Removes and returns the most recent escalation.
    pub fn pop(&mut self) -> Option<Escalation> {
        self.stack.pop()
    }

    /// The most recent escalation without removing it.
    pub fn peek(&self) -> Option<&Escalation> {
        self.stack.last()
    }

    /// All recorded user names in login order.
    pub fn users(&self) -> Vec<&str> {
        self.stack
            .iter()
            .filter(|e| e.kind == EscalationKind::User)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// The user the session is currently authenticated as, or empty when no
    /// user entry exists.
    pub fn current_user(&self) -> &str {
        self.stack
            .iter()
            .rev()
            .find(|e| e.kind == EscalationKind::User)
            .map(|e| e.name.as_str())
            .unwrap_or("")
    }

    /// All recorded console names in escalation order.
    pub fn consoles(&self) -> Vec<&str> {
        self.stack
            .iter()
            .filter(|e| e.kind == EscalationKind::Console)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// The console currently interpreting commands, defaulting to BASH.
    pub fn current_console(&self) -> &str {
        self.stack
            .iter()
            .rev()
            .find(|e| e.kind == EscalationKind::Console)
            .map(|e| e.name.as_str())
            .unwrap_or(BASH)
    }

    /// The auxiliary input recorded for the most recent user entry matching
    /// `name`, case-insensitively.
    pub fn password_for(&self, name: &str) -> Option<&str> {
        let needle = name.to_ascii_lowercase();
        self.stack
            .iter()
            .rev()
            .filter(|e| e.kind == EscalationKind::User)
            .find(|e| e.name.to_ascii_lowercase().contains(&needle))
            .and_then(|e| e.input.as_deref())
    }

    /// Pops tail entries until the top of the stack is a user or console
    /// entry again.
    pub fn reset(&mut self) {
        while let Some(top) = self.stack.last() {
            match top.kind {
                EscalationKind::User | EscalationKind::Console => break,
                _ => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Number of user and console escalations on the stack. Environment
    /// mutations do not need an `exit` to unwind, so they are not counted.
    pub fn escalation_count(&self) -> usize {
        self.stack
            .iter()
            .filter(|e| matches!(e.kind, EscalationKind::User | EscalationKind::Console))
            .count()
    }

    /// Number of recorded user switches.
    pub fn user_count(&self) -> usize {
        self.stack
            .iter()
            .filter(|e| e.kind == EscalationKind::User)
            .count()
    }

    /// Total stack depth including environment mutations.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Iterates over the stack from oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &Escalation> {
        self.stack.iter()
    }

    /// A formatted history of the changes applied to this session.
    pub fn print_stack(&self) -> String {
        let mut output = String::new();
        for entry in &self.stack {
            let kind = match entry.kind {
                EscalationKind::User => "User",
                EscalationKind::Console => "Console",
                EscalationKind::Env => "Environment",
                EscalationKind::Unknown => "Unknown",
            };
            output.push_str(&format!(
                "{}: {} Using Command: {} AdditionalInput: {}\n",
                kind,
                entry.name,
                entry.command,
                entry.input.as_deref().unwrap_or("None")
            ));
        }
        output
    }

    /// Stores a freshly captured prompt.
    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = Some(prompt.into());
    }

    /// The captured prompt, if any.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    /// Whether the captured prompt looks like a default `bash -norc` prompt.
    pub fn is_prompt_default(&self) -> bool {
        self.prompt
            .as_deref()
            .is_some_and(|p| DEFAULT_BASH_PROMPT.is_match(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escalated_state() -> ShellState {
        let mut state = ShellState::new();
        state.push(Escalation::user("admin", "su -", Some("login-pw".into())));
        state.push(Escalation::user("root", "sudo su -", Some("root-pw".into())));
        state.push(Escalation::console(BASH, "bash -norc", None));
        state
    }

    #[test]
    fn current_user_is_topmost_user_entry() {
        let state = escalated_state();
        assert_eq!(state.current_user(), "root");
        assert_eq!(state.users(), vec!["admin", "root"]);
        assert_eq!(state.user_count(), 2);
    }

    #[test]
    fn current_console_defaults_to_bash() {
        let state = ShellState::new();
        assert_eq!(state.current_console(), BASH);

        let mut state = escalated_state();
        state.push(Escalation::console(MYSQL, "mysql -u root", None));
        assert_eq!(state.current_console(), MYSQL);
        assert_eq!(state.consoles(), vec![BASH, MYSQL]);
    }

    #[test]
    fn password_lookup_matches_most_recent_entry() {
        let state = escalated_state();
        assert_eq!(state.password_for("root"), Some("root-pw"));
        assert_eq!(state.password_for("ADMIN"), Some("login-pw"));
        assert_eq!(state.password_for("oracle"), None);
    }

    #[test]
    fn reset_pops_until_user_or_console() {
        let mut state = escalated_state();
        state.push(Escalation::env_change("ORACLE_HOME", "export ORACLE_HOME=/u01"));
        state.push(Escalation::env_change("PATH", "export PATH=$PATH:/u01/bin"));
        assert_eq!(state.depth(), 5);

        state.reset();
        assert_eq!(state.depth(), 3);
        assert_eq!(state.peek().map(|e| e.kind), Some(EscalationKind::Console));

        // Idempotent once the top is a user/console entry.
        state.reset();
        assert_eq!(state.depth(), 3);
    }

    #[test]
    fn escalation_count_ignores_env_changes() {
        let mut state = escalated_state();
        state.push(Escalation::env_change("LANG", "export LANG=C"));
        assert_eq!(state.escalation_count(), 3);
        assert_eq!(state.depth(), 4);
    }

    #[test]
    fn default_prompt_detection() {
        let mut state = ShellState::new();
        assert!(!state.is_prompt_default());
        state.set_prompt("bash-5.1$");
        assert!(state.is_prompt_default());
        state.set_prompt("[root@web01 ~]#");
        assert!(!state.is_prompt_default());
    }

    #[test]
    fn print_stack_lists_history() {
        let state = escalated_state();
        let printed = state.print_stack();
        assert!(printed.contains("User: root Using Command: sudo su -"));
        assert!(printed.contains("Console: BASH"));
    }
}
