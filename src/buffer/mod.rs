//! Output framing and byte-stream hygiene for interactive shell channels.
//!
//! Commands sent through the runtime are wrapped with start/end sentinels so
//! their output can be located inside a PTY stream that also carries echoes,
//! banners and prompts. This module owns the wrapping, the extraction, the
//! control-byte stripping and the decoding rules; the read loops that apply
//! them live in [`BufferController`].

use once_cell::sync::Lazy;
use regex::Regex;

mod control;

pub use control::{BufferController, BufferOptions};

use crate::shell::PROMPT_TERMINATORS;

/// Sentinel echoed before a framed command's output.
pub const CMDSTART: &str = "CMDSTART";
/// Sentinel echoed after a framed command's output.
pub const CMDEND: &str = "CMDEND";

/// ANSI CSI sequences and control bytes stripped before terminator checks and
/// before output is returned: `ESC[`/0x9B CSI sequences, NUL and 0x0E-0x1F.
pub static ESCAPE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\x9B|\x1B\[)[0-?]*[ -/]*[@-~]|[\x00\x0E-\x1F]").unwrap());

/// Matches a line consisting of the start sentinel.
static FRAME_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^CMDSTART\s*$").unwrap());

/// Matches a line beginning with the end sentinel.
static FRAME_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^CMDEND").unwrap());

/// Detects commands that already carry the sentinel wrapping.
static ALREADY_FRAMED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)echo CMDSTART.*echo CMDEND").unwrap());

/// Wraps a command with the output-framing sentinels.
///
/// The `COLUMNS` export keeps tools like `ps` from wrapping lines at the PTY
/// width. `ignore_alias` prefixes the command with `command ` to bypass shell
/// aliases. Commands that already carry the sentinels pass through unchanged.
pub fn frame_command(cmd: &str, ignore_alias: bool) -> String {
    if ALREADY_FRAMED.is_match(cmd) {
        return cmd.to_string();
    }
    let cmd = if ignore_alias {
        format!("command {cmd}")
    } else {
        cmd.to_string()
    };
    format!("COLUMNS=200; export COLUMNS; echo {CMDSTART} && {cmd} && echo {CMDEND}")
}

/// Whether a wire command carries the sentinel wrapping.
pub fn is_framed(cmd: &str) -> bool {
    ALREADY_FRAMED.is_match(cmd)
}

/// Extracts the framed window from raw command output.
///
/// Takes everything between the first line consisting of `CMDSTART` and the
/// last line starting with `CMDEND`, trimmed. Returns an empty string when the
/// alignment markers are absent. Lines produced by the command echo do not
/// match because the sentinels are anchored at line start.
pub fn extract_frame(output: &str) -> String {
    let Some(start) = FRAME_START.find(output) else {
        return String::new();
    };
    let tail = &output[start.end()..];
    let Some(end) = FRAME_END.find_iter(tail).last() else {
        return String::new();
    };
    tail[..end.start()].trim().to_string()
}

/// Removes CSI sequences and control bytes from decoded output.
pub fn strip_control(text: &str) -> String {
    ESCAPE_CHARS.replace_all(text, "").to_string()
}

/// Decodes raw channel bytes as UTF-8, falling back to Latin-1 when the
/// stream is not valid UTF-8.
pub fn decode_chunk(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// The last line of `text` that still has printable content, stripped of
/// control bytes and trailing whitespace.
pub fn last_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(|line| strip_control(line).trim().to_string())
        .find(|line| !line.is_empty())
}

/// Appends the exit-status echo used by callers that read success from `$?`.
pub fn with_exit_code(cmd: &str) -> String {
    format!("{cmd}; echo $?")
}

/// Splits the exit-status indicator off a command body produced by
/// [`with_exit_code`].
///
/// The last non-empty line is interpreted as the status: `0` is success,
/// anything else is failure. The indicator is trimmed from the returned body.
pub fn split_exit_code(body: &str) -> (String, bool) {
    let trimmed = body.trim_end();
    let Some(idx) = trimmed.rfind('\n') else {
        let success = trimmed.trim() == "0";
        return (String::new(), success);
    };
    let (head, status) = trimmed.split_at(idx);
    (head.trim_end().to_string(), status.trim() == "0")
}

/// End-of-output condition for one buffer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndText<'a> {
    /// Stop when the captured prompt appears on the last line.
    Prompt(&'a str),
    /// Stop when `CMDEND` is the final non-empty line.
    Sentinel,
    /// Fallback: stop when the last line ends with a default prompt
    /// terminator character.
    Terminators,
    /// Password-prompt detector: stop on `assword` markers or any default
    /// terminator, whichever returns first.
    Password,
}

impl EndText<'_> {
    /// Whether accumulated output satisfies this end condition.
    ///
    /// `cmd` is the wire command; a last line still containing the command
    /// echo never terminates the read.
    pub fn matches(&self, output: &str, cmd: &str) -> bool {
        let Some(line) = last_nonempty_line(output) else {
            return false;
        };
        if !cmd.is_empty() && line.contains(cmd) {
            return false;
        }
        match self {
            EndText::Prompt(prompt) => {
                let prompt = strip_control(prompt);
                let prompt = prompt.trim();
                !prompt.is_empty() && line.contains(prompt)
            }
            EndText::Sentinel => line == CMDEND,
            EndText::Terminators => line.ends_with(PROMPT_TERMINATORS),
            EndText::Password => line.contains("assword") || line.ends_with(PROMPT_TERMINATORS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wraps_and_respects_existing_frames() {
        let framed = frame_command("uname -r", false);
        assert_eq!(
            framed,
            "COLUMNS=200; export COLUMNS; echo CMDSTART && uname -r && echo CMDEND"
        );
        assert_eq!(frame_command(&framed, false), framed);
    }

    #[test]
    fn frame_with_alias_bypass_prefixes_command() {
        let framed = frame_command("ls /tmp", true);
        assert!(framed.contains("echo CMDSTART && command ls /tmp && echo CMDEND"));
    }

    #[test]
    fn extract_frame_takes_window_between_sentinels() {
        let raw = "echo CMDSTART && uname -r && echo CMDEND\r\nCMDSTART\r\n5.14.0-70.el9\r\nCMDEND\r\n[root@web01 ~]# ";
        assert_eq!(extract_frame(raw), "5.14.0-70.el9");
    }

    #[test]
    fn extract_frame_uses_last_end_marker() {
        let raw = "CMDSTART\nline mentioning CMDEND inline\nbody\nCMDEND\n";
        assert_eq!(extract_frame(raw), "line mentioning CMDEND inline\nbody");
    }

    #[test]
    fn extract_frame_without_markers_is_empty() {
        assert_eq!(extract_frame("no markers at all"), "");
        assert_eq!(extract_frame("CMDSTART\nunterminated body"), "");
    }

    #[test]
    fn strip_control_removes_csi_and_control_bytes() {
        let noisy = "\x1b[01;32mgreen\x1b[0m\x00 text\x1f";
        assert_eq!(strip_control(noisy), "green text");
    }

    #[test]
    fn decode_falls_back_to_latin1() {
        assert_eq!(decode_chunk(b"caf\xe9"), "caf\u{e9}");
        assert_eq!(decode_chunk("café".as_bytes()), "café");
    }

    #[test]
    fn sentinel_end_requires_final_line() {
        let out = "CMDSTART\nbody\nCMDEND\n";
        assert!(EndText::Sentinel.matches(out, ""));
        assert!(!EndText::Sentinel.matches("CMDSTART\nbody\n", ""));
        // The echoed command line never terminates the read.
        let echo = "echo CMDSTART && true && echo CMDEND";
        assert!(!EndText::Sentinel.matches(echo, echo));
    }

    #[test]
    fn terminator_end_matches_trailing_prompt_chars() {
        assert!(EndText::Terminators.matches("line\n[root@web01 ~]#", ""));
        assert!(EndText::Terminators.matches("bash-5.1$", ""));
        assert!(!EndText::Terminators.matches("still running...", ""));
    }

    #[test]
    fn password_end_matches_prompt_or_password() {
        assert!(EndText::Password.matches("Password:", ""));
        assert!(EndText::Password.matches("[sudo] password for admin:", ""));
        assert!(EndText::Password.matches("back to $", ""));
        assert!(!EndText::Password.matches("waiting", ""));
    }

    #[test]
    fn prompt_end_checks_last_line_only() {
        let out = "mysql> earlier\nrow one\nmysql>";
        assert!(EndText::Prompt("mysql>").matches(out, ""));
        assert!(!EndText::Prompt("mysql>").matches("row one\nrow two", ""));
    }

    #[test]
    fn exit_code_helper_round_trip() {
        let cmd = with_exit_code("grep root /etc/passwd");
        assert!(cmd.ends_with("; echo $?"));
        let (body, ok) = split_exit_code("root:x:0:0:root:/root:/bin/bash\n0\n");
        assert!(ok);
        assert_eq!(body, "root:x:0:0:root:/root:/bin/bash");
        let (_, ok) = split_exit_code("output\n1\n");
        assert!(!ok);
        let (body, ok) = split_exit_code("0");
        assert!(ok);
        assert!(body.is_empty());
    }
}
