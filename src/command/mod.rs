//! Command containers: self-contained task objects wrapping a command or a
//! tree of commands.
//!
//! A [`CommandRequest`] describes what to run: a single command, a keyed
//! command, a batch (unordered, parallel) or a queue (ordered, serial).
//! [`CommandContainer`] owns one request through its lifecycle phases and
//! publishes a [`CommandResult`] when it completes.
//!
//! # Main Components
//!
//! - [`CommandRequest`] - The parsed command tree
//! - [`CommandContainer`] - Phase machine driving one request
//! - [`CommandResult`] - Structured result or typed failure
//! - [`HookSet`] - Requirements and parser/completion/failure hooks

use std::collections::BTreeMap;

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TaskFailure;

mod container;
mod hooks;

pub use container::{Children, CommandContainer, Phase};
pub use hooks::{
    CompletionTask, FailureHook, HookSet, PostParser, PreParser, Requirement, RequirementOutcome,
};

/// Longest sanitized-command prefix kept in a derived key before the digest,
/// in characters.
const KEY_TEXT_LIMIT: usize = 40;

/// A command or a tree of commands to execute.
#[derive(Clone)]
pub enum CommandRequest {
    /// One command, optionally with an explicit key.
    Single {
        key: Option<String>,
        command: String,
    },
    /// Unordered, parallel, independent children.
    Batch(BTreeMap<String, CommandRequest>),
    /// Ordered, serial children; fail-fast under `stop_on_failure`.
    Queue(Vec<CommandRequest>),
    /// A pre-built container composed into a larger tree, keeping its own
    /// options and hooks.
    Prebuilt(std::sync::Arc<CommandContainer>),
}

impl CommandRequest {
    /// A single command with an explicit key.
    pub fn keyed(key: impl Into<String>, command: impl Into<String>) -> Self {
        CommandRequest::Single {
            key: Some(key.into()),
            command: command.into(),
        }
    }

    /// A batch from `(key, command)` pairs.
    pub fn batch<K, C, I>(entries: I) -> Self
    where
        K: Into<String>,
        C: Into<CommandRequest>,
        I: IntoIterator<Item = (K, C)>,
    {
        CommandRequest::Batch(
            entries
                .into_iter()
                .map(|(k, c)| (k.into(), c.into()))
                .collect(),
        )
    }

    /// A batch from unkeyed commands; each key derives from the command text.
    pub fn batch_of<C, I>(commands: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = C>,
    {
        CommandRequest::Batch(
            commands
                .into_iter()
                .map(|command| {
                    let command = command.into();
                    (
                        derive_key(&command),
                        CommandRequest::Single { key: None, command },
                    )
                })
                .collect(),
        )
    }

    /// A queue from an ordered list of commands.
    pub fn queue<C, I>(entries: I) -> Self
    where
        C: Into<CommandRequest>,
        I: IntoIterator<Item = C>,
    {
        CommandRequest::Queue(entries.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for CommandRequest {
    fn from(command: &str) -> Self {
        CommandRequest::Single {
            key: None,
            command: command.to_string(),
        }
    }
}

impl From<String> for CommandRequest {
    fn from(command: String) -> Self {
        CommandRequest::Single { key: None, command }
    }
}

impl From<std::sync::Arc<CommandContainer>> for CommandRequest {
    fn from(container: std::sync::Arc<CommandContainer>) -> Self {
        CommandRequest::Prebuilt(container)
    }
}

impl<C: Into<CommandRequest>> From<Vec<C>> for CommandRequest {
    fn from(entries: Vec<C>) -> Self {
        CommandRequest::Queue(entries.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, C: Into<CommandRequest>> From<BTreeMap<K, C>> for CommandRequest {
    fn from(entries: BTreeMap<K, C>) -> Self {
        CommandRequest::Batch(
            entries
                .into_iter()
                .map(|(k, c)| (k.into(), c.into()))
                .collect(),
        )
    }
}

/// The published result of a completed container: either text, a map of
/// child results, or a typed failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CommandResult {
    Failure(TaskFailure),
    Text(String),
    Map(BTreeMap<String, CommandResult>),
}

impl CommandResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, CommandResult::Failure(_))
    }

    /// The text body, when this result is plain text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CommandResult::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The child-result map, when this result came from a batch or queue.
    pub fn as_map(&self) -> Option<&BTreeMap<String, CommandResult>> {
        match self {
            CommandResult::Map(map) => Some(map),
            _ => None,
        }
    }

    /// The typed failure, when this result records one.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            CommandResult::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<TaskFailure> for CommandResult {
    fn from(failure: TaskFailure) -> Self {
        CommandResult::Failure(failure)
    }
}

/// Strips path separators, shell metacharacters, quotes and spaces out of a
/// key so it stays usable as an identifier.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '/' | '-' | '.' | ',' | ';' | '\'' | '"' | ' '))
        .collect()
}

/// Derives a stable key from command text: the sanitized text (truncated)
/// plus a short SHA-256 digest so distinct commands never collide.
pub fn derive_key(command: &str) -> String {
    // Truncate by characters, not bytes: command text is UTF-8 and a byte
    // cut can land inside a multi-byte character.
    let text: String = sanitize_key(command).chars().take(KEY_TEXT_LIMIT).collect();
    let digest = Sha256::digest(command.as_bytes());
    format!("{}_{:02x}{:02x}{:02x}{:02x}", text, digest[0], digest[1], digest[2], digest[3])
}

/// Resolves the container key for a command: an explicit key is sanitized
/// (logging duplicates is the caller's concern), a missing one is derived
/// from the command text.
pub(crate) fn resolve_key(key: Option<&str>, command: &str) -> String {
    match key {
        Some(key) => {
            let sanitized = sanitize_key(key);
            if sanitized.is_empty() {
                debug!("explicit key '{}' sanitized to nothing, deriving from command", key);
                derive_key(command)
            } else {
                sanitized
            }
        }
        None => derive_key(command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_and_shell_characters() {
        assert_eq!(sanitize_key("cat /etc/os-release; id"), "catetcosreleaseid");
        assert_eq!(sanitize_key("echo 'a b'"), "echoab");
    }

    #[test]
    fn derived_keys_differ_for_colliding_sanitizations() {
        // Both commands sanitize to the same text; the digest keeps the keys
        // distinct.
        let a = derive_key("echo a-b");
        let b = derive_key("echo ab");
        assert_ne!(a, b);
        assert!(a.starts_with("echoab_"));
        assert!(b.starts_with("echoab_"));
    }

    #[test]
    fn derived_keys_are_stable() {
        assert_eq!(derive_key("uname -r"), derive_key("uname -r"));
    }

    #[test]
    fn explicit_keys_pass_through_sanitized() {
        assert_eq!(resolve_key(Some("disk usage"), "df -h"), "diskusage");
        // An explicit key consisting only of stripped characters falls back
        // to derivation.
        assert!(resolve_key(Some("---"), "df -h").starts_with("dfh_"));
    }

    #[test]
    fn long_commands_truncate_before_digest() {
        let long = "x".repeat(500);
        let key = derive_key(&long);
        assert!(key.len() <= KEY_TEXT_LIMIT + 9);
    }

    #[test]
    fn multibyte_commands_truncate_on_char_boundaries() {
        // The sanitized text has a multi-byte character straddling the
        // character limit; a byte-offset cut here would panic.
        let cmd = format!("{}ééé", "x".repeat(KEY_TEXT_LIMIT - 1));
        let key = derive_key(&cmd);
        let prefix: String = format!("{}é", "x".repeat(KEY_TEXT_LIMIT - 1));
        assert!(key.starts_with(&format!("{prefix}_")));
        // limit chars, the separator, and the 8-hex digest
        assert_eq!(key.chars().count(), KEY_TEXT_LIMIT + 9);
    }

    #[test]
    fn result_accessors() {
        let text = CommandResult::Text("body".into());
        assert_eq!(text.as_text(), Some("body"));
        assert!(!text.is_failure());

        let failure = CommandResult::Failure(TaskFailure::new(
            crate::error::FailureKind::Execution,
            "boom",
        ));
        assert!(failure.is_failure());
        assert!(failure.failure().is_some());
    }
}
