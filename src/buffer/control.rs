use std::time::Duration;

use log::{debug, trace};
use tokio::time::{Instant, timeout};

use crate::config::BufferTimeouts;
use crate::error::ToolkitError;
use crate::session::ShellChannel;
use crate::shell::BASH;

use super::{EndText, decode_chunk, frame_command, is_framed, last_nonempty_line, strip_control};

/// Per-call options for one buffer execution.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Explicit prompt used as the read terminator.
    pub prompt: Option<String>,
    /// Bypass end-of-output detection: wait briefly for the first byte, read
    /// what is ready, stop. Only for escalation commands that expect an
    /// interactive prompt next.
    pub unsafe_mode: bool,
    /// Skip the sentinel wrapping entirely.
    pub no_parsing: bool,
    /// Prefix the command with `command ` to bypass aliases (BASH only).
    pub ignore_alias: bool,
    /// Timeout set for this call.
    pub timeouts: BufferTimeouts,
}

impl BufferOptions {
    pub fn new(timeouts: BufferTimeouts) -> Self {
        Self {
            timeouts,
            ..Self::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn unsafe_mode(mut self) -> Self {
        self.unsafe_mode = true;
        self
    }

    pub fn no_parsing(mut self) -> Self {
        self.no_parsing = true;
        self
    }

    pub fn ignore_alias(mut self) -> Self {
        self.ignore_alias = true;
        self
    }
}

/// Low-level read/write control for one shell channel.
///
/// Every read obeys the three-timeout discipline: a total run bound, a
/// time-to-first-byte bound and a between-bytes bound. End of output is
/// detected from the last line of the accumulated, control-stripped text.
#[derive(Debug, Clone)]
pub struct BufferController {
    defaults: BufferTimeouts,
}

impl BufferController {
    pub fn new(defaults: BufferTimeouts) -> Self {
        Self {
            defaults: defaults.clamped(),
        }
    }

    /// The connection-wide timeout defaults this controller was built with.
    pub fn defaults(&self) -> BufferTimeouts {
        self.defaults
    }

    /// Sends a command and reads its output according to `opts`.
    ///
    /// Unless `no_parsing` or `unsafe_mode` is set the command is rewritten
    /// with the framing sentinels before transmission. Stale bytes left on the
    /// channel are drained first. The returned text is decoded, stripped of
    /// control bytes and cleared of the prompt and the command echo.
    pub async fn execute(
        &self,
        chan: &mut ShellChannel,
        cmd: &str,
        opts: &BufferOptions,
    ) -> Result<String, ToolkitError> {
        if chan.is_closed() {
            return Err(ToolkitError::ClosedBuffer(
                "channel closed before send".to_string(),
            ));
        }

        let wire = if opts.no_parsing || opts.unsafe_mode {
            cmd.to_string()
        } else {
            let alias_bypass = opts.ignore_alias && chan.state.current_console() == BASH;
            frame_command(cmd, alias_bypass)
        };

        chan.drain();
        debug!("executing on {}: {}", chan.tag(), cmd);
        chan.send_line(&wire).await?;

        let timeouts = opts.timeouts.clamped();
        let (output, err) = if opts.unsafe_mode {
            self.read_unsafe(chan, timeouts).await
        } else if let Some(prompt) = opts.prompt.as_deref() {
            let (output, err) = self
                .read_loop(chan, EndText::Prompt(prompt), timeouts, &wire)
                .await;
            // With a known prompt every timeout is a hard failure.
            if let Some(err) = err {
                return Err(err);
            }
            (output, None)
        } else {
            let end = if is_framed(&wire) {
                EndText::Sentinel
            } else {
                EndText::Terminators
            };
            self.read_loop(chan, end, timeouts, &wire).await
        };

        match err {
            // Total exhaustion and closed channels always surface.
            Some(err @ ToolkitError::TotalTimeout(_)) | Some(err @ ToolkitError::ClosedBuffer(_)) => {
                return Err(err);
            }
            // In fallback and unsafe modes a quiet buffer is an acceptable
            // stop condition.
            Some(err) => debug!("{} read stopped early: {}", chan.tag(), err),
            None => {}
        }

        Ok(Self::parse_output(&output, opts.prompt.as_deref(), &wire))
    }

    /// Captures the shell prompt by sending a blank line and taking the
    /// trailing printable characters of the last line returned.
    pub async fn capture_prompt(
        &self,
        chan: &mut ShellChannel,
    ) -> Result<Option<String>, ToolkitError> {
        debug!("capturing prompt on {}", chan.tag());
        chan.drain();
        chan.send_line(" ").await?;
        let (output, err) = self.read_unsafe(chan, self.defaults).await;
        if let Some(err @ ToolkitError::ClosedBuffer(_)) = err {
            return Err(err);
        }
        let prompt = last_nonempty_line(&output);
        trace!("captured prompt: {:?}", prompt);
        Ok(prompt)
    }

    /// Waits for a password prompt (or a returned shell prompt) after an
    /// escalation command was sent. Returns the accumulated output.
    pub async fn password_wait(
        &self,
        chan: &mut ShellChannel,
        cmd: &str,
        timeouts: BufferTimeouts,
    ) -> Result<String, ToolkitError> {
        let mut timeouts = timeouts.clamped();
        // The prompt may already be waiting; skip the first-bit stage.
        timeouts.first_bit = Duration::ZERO;
        let (output, err) = self
            .read_loop(chan, EndText::Password, timeouts, cmd)
            .await;
        match err {
            Some(err @ ToolkitError::ClosedBuffer(_)) => Err(err),
            Some(err) => {
                debug!("password wait stopped early: {}", err);
                Ok(output)
            }
            None => Ok(output),
        }
    }

    /// Waits until `marker` appears on the last line of output. Used by
    /// scripted console escalations that expect interactive questions.
    pub async fn await_text(
        &self,
        chan: &mut ShellChannel,
        marker: &str,
        timeouts: BufferTimeouts,
    ) -> Result<String, ToolkitError> {
        let mut timeouts = timeouts.clamped();
        timeouts.first_bit = Duration::ZERO;
        let (output, err) = self
            .read_loop(chan, EndText::Prompt(marker), timeouts, "")
            .await;
        match err {
            Some(err @ ToolkitError::ClosedBuffer(_)) => Err(err),
            Some(err) => {
                debug!("await_text stopped early: {}", err);
                Ok(output)
            }
            None => Ok(output),
        }
    }

    /// Waits for a shell prompt to return, optionally nudging the shell with
    /// blank lines first.
    pub async fn prompt_wait(
        &self,
        chan: &mut ShellChannel,
        timeouts: BufferTimeouts,
        insert_newlines: usize,
    ) -> Result<String, ToolkitError> {
        for _ in 0..insert_newlines {
            chan.send_line("").await?;
        }
        let mut timeouts = timeouts.clamped();
        timeouts.first_bit = Duration::ZERO;
        let (output, err) = self
            .read_loop(chan, EndText::Terminators, timeouts, "")
            .await;
        match err {
            Some(err @ ToolkitError::ClosedBuffer(_)) => Err(err),
            Some(err) => {
                debug!("prompt wait stopped early: {}", err);
                Ok(output)
            }
            None => Ok(output),
        }
    }

    /// Core read loop. Returns the accumulated decoded text and the error
    /// that ended the read, if the end condition was never met.
    async fn read_loop(
        &self,
        chan: &mut ShellChannel,
        end: EndText<'_>,
        timeouts: BufferTimeouts,
        cmd: &str,
    ) -> (String, Option<ToolkitError>) {
        let deadline = Instant::now() + timeouts.run;
        let mut raw: Vec<u8> = Vec::new();

        if !timeouts.first_bit.is_zero() {
            match timeout(timeouts.first_bit, chan.recv()).await {
                Ok(Some(chunk)) => raw.extend_from_slice(&chunk),
                Ok(None) => {
                    return (
                        decode_chunk(&raw),
                        Some(ToolkitError::ClosedBuffer(
                            "channel closed while waiting for first bit".to_string(),
                        )),
                    );
                }
                Err(_) => {
                    return (
                        String::new(),
                        Some(ToolkitError::TimeToFirstBit(timeouts.first_bit)),
                    );
                }
            }
        }

        loop {
            let text = decode_chunk(&raw);
            if end.matches(&text, cmd) {
                return (text, None);
            }
            let now = Instant::now();
            if now >= deadline {
                return (
                    text,
                    Some(ToolkitError::TotalTimeout(format!(
                        "no end of output within {:?}",
                        timeouts.run
                    ))),
                );
            }
            let wait = timeouts.between_bit.min(deadline - now);
            match timeout(wait, chan.recv()).await {
                Ok(Some(chunk)) => {
                    trace!("{} received {} bytes", chan.tag(), chunk.len());
                    raw.extend_from_slice(&chunk);
                }
                Ok(None) => {
                    return (
                        text,
                        Some(ToolkitError::ClosedBuffer(
                            "channel closed mid-read".to_string(),
                        )),
                    );
                }
                Err(_) => {
                    let err = if Instant::now() >= deadline {
                        ToolkitError::TotalTimeout(format!(
                            "no end of output within {:?}",
                            timeouts.run
                        ))
                    } else {
                        ToolkitError::BetweenBits(timeouts.between_bit)
                    };
                    return (text, Some(err));
                }
            }
        }
    }

    /// Unsafe read: wait briefly for the first byte, then drain whatever is
    /// ready until the channel goes quiet.
    async fn read_unsafe(
        &self,
        chan: &mut ShellChannel,
        timeouts: BufferTimeouts,
    ) -> (String, Option<ToolkitError>) {
        let first_wait = Duration::from_secs(1);
        let settle = timeouts.delay.max(Duration::from_millis(100));
        let mut raw: Vec<u8> = Vec::new();

        match timeout(first_wait, chan.recv()).await {
            Ok(Some(chunk)) => raw.extend_from_slice(&chunk),
            Ok(None) => {
                return (
                    String::new(),
                    Some(ToolkitError::ClosedBuffer(
                        "channel closed while waiting for first bit".to_string(),
                    )),
                );
            }
            Err(_) => {
                return (String::new(), Some(ToolkitError::TimeToFirstBit(first_wait)));
            }
        }

        loop {
            match timeout(settle, chan.recv()).await {
                Ok(Some(chunk)) => raw.extend_from_slice(&chunk),
                Ok(None) | Err(_) => break,
            }
        }
        (decode_chunk(&raw), None)
    }

    /// Decodes, strips control bytes, and clears the prompt and the command
    /// echo out of raw output.
    fn parse_output(output: &str, prompt: Option<&str>, wire: &str) -> String {
        let mut cleaned = strip_control(output);
        if let Some(prompt) = prompt {
            let prompt = strip_control(prompt);
            let prompt = prompt.trim();
            if !prompt.is_empty() {
                cleaned = cleaned.replace(prompt, "");
            }
        }
        if !wire.is_empty() {
            cleaned = cleaned.replace(wire, "");
        }
        cleaned.trim().to_string()
    }
}
