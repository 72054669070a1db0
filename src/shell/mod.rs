//! Per-session shell state: the escalation stack and the captured prompt.
//!
//! Every interactive shell session records the user switches, console changes
//! and environment mutations performed on it as an ordered stack. The stack is
//! the source of truth for "who am I on this session" and "which console is
//! interpreting my commands", and it is what de-escalation unwinds.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod state;

/// Console name recorded when a session drops into a plain bash shell.
pub const BASH: &str = "BASH";
/// Console name for a MySQL client shell.
pub const MYSQL: &str = "MYSQL";
/// Console name for an Oracle sqlplus shell.
pub const ORACLE: &str = "ORACLE";

/// Characters that terminate a shell prompt line.
///
/// Applied only to the end of the last line of output.
pub const PROMPT_TERMINATORS: &[char] = &['$', '>', '#', '@', ']', '~'];

/// Matches the default prompt of a `bash -norc` shell, e.g. `bash-5.1$`.
pub static DEFAULT_BASH_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bash-\d\.\d[#$>@~]").unwrap());

/// The class of a recorded shell-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// A user switch (`su`, `sudo su`).
    User = 1,
    /// A console change (`bash -norc`, `mysql`, `sqlplus`).
    Console = 2,
    /// An environment mutation (`export ORACLE_HOME=...`).
    Env = 3,
    /// Recorded but unclassified.
    Unknown = 4,
}

/// One entry on the escalation stack. Immutable once pushed; entries are only
/// removed by popping on de-escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Escalation {
    /// Entry class.
    pub kind: EscalationKind,
    /// User name, console name, or the name of the mutated variable.
    pub name: String,
    /// The command that performed the change.
    pub command: String,
    /// Auxiliary input the command consumed, usually a password.
    pub input: Option<String>,
}

impl Escalation {
    /// A user switch entry.
    pub fn user(
        name: impl Into<String>,
        command: impl Into<String>,
        input: Option<String>,
    ) -> Self {
        Self {
            kind: EscalationKind::User,
            name: name.into(),
            command: command.into(),
            input,
        }
    }

    /// A console change entry.
    pub fn console(
        name: impl Into<String>,
        command: impl Into<String>,
        input: Option<String>,
    ) -> Self {
        Self {
            kind: EscalationKind::Console,
            name: name.into(),
            command: command.into(),
            input,
        }
    }

    /// An environment mutation entry.
    pub fn env_change(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            kind: EscalationKind::Env,
            name: name.into(),
            command: command.into(),
            input: None,
        }
    }
}

/// Tracked state of one interactive shell session.
///
/// Owned by the session's environment and mutated only while that environment
/// is leased by a single worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ShellState {
    /// The captured prompt, used as the read terminator when known.
    pub prompt: Option<String>,
    stack: Vec<Escalation>,
}
