//! # lxkit - Remote Execution Runtime for Linux Hosts
//!
//! `lxkit` is a Rust library for running commands on Linux hosts over SSH with
//! full control over the interactive shell. It multiplexes many logical shell
//! environments onto a single SSH transport, frames command output so it can be
//! extracted reliably from a PTY stream, tracks privilege and console
//! escalations per session, and drives commands through a hook-aware container
//! lifecycle on a bounded worker pool.
//!
//! ## Features
//!
//! - **Environment Pooling**: Shell sessions are created on one transport up to
//!   the server's `MaxSessions` limit, labeled, leased and reused
//! - **Output Framing**: Commands are wrapped with start/end sentinels so the
//!   runtime never guesses where output ends, even under custom prompts
//! - **Three-Timeout Reads**: Every buffer read enforces a total bound, a
//!   time-to-first-byte bound and a between-bytes bound simultaneously
//! - **Escalation Tracking**: `su`/`sudo` user switches, console pushes (e.g.
//!   `mysql`, `sqlplus`) and environment exports are recorded on a per-session
//!   stack and can be unwound
//! - **Command Containers**: Single, batched (parallel) and queued (serial)
//!   command trees with requirements, pre/post parsers, completion and
//!   on-failure hooks
//! - **Async/Await**: Built on Tokio for high-performance asynchronous
//!   operations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lxkit::config::ConnectOptions;
//! use lxkit::toolkit::Toolkit;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ConnectOptions::new("192.168.1.50", "admin", "password");
//!     let toolkit = Toolkit::new(options);
//!     toolkit.connect().await?;
//!
//!     // Threaded execution returns a container to wait on.
//!     let container = toolkit.execute("uname -r").await?;
//!     let result = container.wait_for_results(None).await;
//!     println!("kernel: {:?}", result);
//!
//!     toolkit.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`toolkit::Toolkit`] - Facade owning the connection, pool and workers
//! - [`session::EnvironmentPool`] - Creates, labels and leases shell sessions
//! - [`session::EnvironmentController`] - Escalation and de-escalation logic
//! - [`buffer::BufferController`] - Framed reads/writes with timeout discipline
//! - [`command::CommandContainer`] - Phase machine wrapping a command tree
//! - [`error::ToolkitError`] - Error types for every failure class

pub mod buffer;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod modules;
pub mod session;
pub mod shell;
pub mod toolkit;
