//! SSH session layer: transport, shell environments, escalation control and
//! the environment pool.
//!
//! One [`SshTransport`] carries many logical shell environments, each backed
//! by its own channel with a PTY and an interactive shell. The
//! [`EnvironmentPool`] creates, labels and leases environments up to the
//! discovered session cap; the [`EnvironmentController`] performs user and
//! console escalations on a leased environment.
//!
//! # Main Components
//!
//! - [`SshTransport`] - Connection and channel plumbing on one transport
//! - [`Environment`] - One interactive shell session with its state
//! - [`EnvironmentLease`] - Exclusive reservation of an environment
//! - [`EnvironmentController`] - Escalation/de-escalation algorithms
//! - [`EnvironmentPool`] - Bounded registry with labeling and reuse

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use log::{debug, error, info, trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use russh::ChannelMsg;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::buffer::BufferController;
use crate::config::ConnectOptions;
use crate::error::ToolkitError;
use crate::shell::ShellState;

mod control;
mod environment;
mod pool;
mod transport;

pub use control::{BecomeUserOptions, ConsoleEscalation, ExpectStep};

/// The read/write half of one shell channel plus the tracked shell state.
///
/// Lives behind the environment's lock: holding a `ShellChannel` mutably is
/// what it means to have the environment leased.
pub struct ShellChannel {
    sender: Sender<String>,
    recv: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    tag: String,
    /// Escalation stack and captured prompt for this session.
    pub state: ShellState,
}

/// One interactive shell session over one SSH channel.
pub struct Environment {
    id: Uuid,
    main: bool,
    label: StdMutex<String>,
    custom: AtomicBool,
    active: AtomicBool,
    closed: Arc<AtomicBool>,
    shell: Arc<AsyncMutex<ShellChannel>>,
}

/// An exclusive reservation of one environment by one worker.
///
/// Holds the environment's channel guard, so the `active` flag is structurally
/// tied to the lease: it is set when the lease is taken and cleared on drop.
/// Dropping the lease releases the environment without closing the channel.
pub struct EnvironmentLease {
    env: Arc<Environment>,
    guard: OwnedMutexGuard<ShellChannel>,
}

/// The SSH transport shared by all environments of one connection.
pub struct SshTransport {
    client: Client,
    options: Arc<ConnectOptions>,
    proxy: StdMutex<Option<tokio::process::Child>>,
    closed: AtomicBool,
}

/// Escalation and de-escalation algorithms executed on a leased environment.
pub struct EnvironmentController {
    buffer: BufferController,
    options: Arc<ConnectOptions>,
}

/// Bounded registry of shell environments on one transport.
pub struct EnvironmentPool {
    transport: Arc<SshTransport>,
    controller: Arc<EnvironmentController>,
    options: Arc<ConnectOptions>,
    main: Arc<Environment>,
    registry: StdMutex<Vec<Arc<Environment>>>,
    max_sessions: usize,
}
