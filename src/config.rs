//! Configuration surface for connections, buffer timing and command execution.
//!
//! Options flow through the runtime as plain value structs instead of loose
//! keyword bags: [`ConnectOptions`] describes the SSH endpoint and escalation
//! policy, [`BufferTimeouts`] carries the three-timeout discipline for buffer
//! reads, and [`ExecuteOptions`] travels with each command container.
//!
//! The SSH algorithm preference tables below are tuned for maximum
//! compatibility: diagnostic targets are often old enterprise builds whose
//! sshd only speaks legacy key exchanges and CBC ciphers.

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{Preferred, cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key exchange algorithms in order of preference.
///
/// Modern Curve25519 first, with the legacy Diffie-Hellman group exchanges
/// kept for older servers.
pub const COMPAT_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA256,
    kex::DH_GEX_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_G16_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// Cipher algorithms for encryption, CTR and GCM first with CBC fallbacks.
pub const COMPAT_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];

/// MAC algorithms, ETM variants preferred.
pub const COMPAT_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

/// Host key algorithms, including legacy RSA and DSA for old servers.
pub const COMPAT_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

/// Compression preference. ZLIB first: diagnostic commands tend to return
/// large text bodies over slow management links.
pub const COMPAT_COMPRESSION: &[compression::Name] = &[
    compression::ZLIB,
    compression::ZLIB_LEGACY,
    compression::NONE,
];

/// Builds the russh algorithm preference set for a new transport.
pub fn preferred() -> Preferred {
    Preferred {
        kex: Cow::Borrowed(COMPAT_KEX_ORDER),
        key: Cow::Borrowed(COMPAT_KEY_TYPES),
        cipher: Cow::Borrowed(COMPAT_CIPHERS),
        mac: Cow::Borrowed(COMPAT_MAC_ALGORITHMS),
        compression: Cow::Borrowed(COMPAT_COMPRESSION),
    }
}

/// Interval between transport keepalive probes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default total bound for a single command, in seconds.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wait for the first byte after a send.
pub const DEFAULT_FIRST_BIT_TIMEOUT: Duration = Duration::from_secs(240);

/// Default maximum gap between successive bytes.
pub const DEFAULT_BETWEEN_BIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default poll interval for buffer and lease waits.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

/// The login command used to become root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RootLogin {
    /// Plain `su -`.
    #[default]
    Su,
    /// `sudo su -` with the sudo cache cleared first.
    SudoSu,
}

impl RootLogin {
    /// The literal command sent to the shell.
    ///
    /// The `-k` flag clears previous sudo authentications so the password
    /// prompt is always observable.
    pub fn command(&self) -> &'static str {
        match self {
            RootLogin::Su => "su -",
            RootLogin::SudoSu => "/usr/bin/sudo -k; /usr/bin/sudo su -",
        }
    }

    /// The alternate strategy tried when escalation fails and retries are
    /// permitted.
    pub fn alternate(&self) -> RootLogin {
        match self {
            RootLogin::Su => RootLogin::SudoSu,
            RootLogin::SudoSu => RootLogin::Su,
        }
    }

    /// Normalizes a free-form login command string.
    pub fn parse(raw: &str) -> RootLogin {
        if raw.contains("sudo") {
            RootLogin::SudoSu
        } else {
            RootLogin::Su
        }
    }
}

/// The three-timeout discipline applied to every buffer read, plus the poll
/// interval used while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BufferTimeouts {
    /// Absolute wall-clock bound for the whole command.
    pub run: Duration,
    /// Maximum wait until any byte arrives after the send.
    pub first_bit: Duration,
    /// Maximum gap between successive byte arrivals once reading has begun.
    pub between_bit: Duration,
    /// Poll interval.
    pub delay: Duration,
}

impl Default for BufferTimeouts {
    fn default() -> Self {
        Self {
            run: DEFAULT_RUN_TIMEOUT,
            first_bit: DEFAULT_FIRST_BIT_TIMEOUT,
            between_bit: DEFAULT_BETWEEN_BIT_TIMEOUT,
            delay: DEFAULT_DELAY,
        }
    }
}

impl BufferTimeouts {
    /// Returns a copy with `run` replaced, re-clamped.
    pub fn with_run(mut self, run: Duration) -> Self {
        self.run = run;
        self.clamped()
    }

    /// Applies the clamping rules before a read loop uses the values.
    ///
    /// A zero run timeout falls back to the default. The first-bit bound is
    /// clamped to 80% of run, the between-bit bound to 10% of run, and the
    /// poll delay is forced into a sane range.
    pub fn clamped(mut self) -> Self {
        if self.run.is_zero() {
            self.run = DEFAULT_RUN_TIMEOUT;
        }
        if self.first_bit > self.run {
            self.first_bit = self.run.mul_f64(0.8);
        }
        if self.between_bit > self.run {
            self.between_bit = self.run.mul_f64(0.1);
        }
        if self.delay.is_zero() {
            self.delay = DEFAULT_DELAY;
        } else if self.delay > self.run / 5 {
            self.delay = Duration::from_millis(200);
        }
        self
    }
}

/// Proxy-jump configuration: the runtime spawns a local `ssh` subprocess to
/// the proxy host and dials the target through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProxyJump {
    /// User on the proxy host.
    pub user: String,
    /// Proxy host name or address.
    pub server: String,
}

/// Everything needed to establish and operate a connection to one host.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Hostname or address of the target.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password. Also the default sudo password.
    pub password: String,
    /// Optional private key file used instead of the password.
    pub key: Option<PathBuf>,
    /// Passphrase for the private key.
    pub key_passphrase: Option<String>,
    /// Escalate every new environment to root after login.
    pub root: bool,
    /// Root password for `su -` style escalation.
    pub root_password: Option<String>,
    /// Which root login command to use first.
    pub root_login: RootLogin,
    /// Disable the fallback-strategy retry for root escalation.
    pub root_login_explicit: bool,
    /// TCP connect and handshake bound.
    pub conn_timeout: Duration,
    /// Transport inactivity bound; the connection is torn down when nothing
    /// moves for this long. `None` disables the check.
    pub io_timeout: Option<Duration>,
    /// Buffer read timing defaults for this connection.
    pub timeouts: BufferTimeouts,
    /// Override for the discovered session cap (clamped to 1..=10).
    pub max_channels: Option<usize>,
    /// Optional proxy jump.
    pub proxy: Option<ProxyJump>,
    /// Switch new environments into `bash -norc` after login so custom
    /// prompts do not confuse the framing layer.
    pub use_bash_norc: bool,
}

impl ConnectOptions {
    /// Creates options for a password login with defaults everywhere else.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            password: password.into(),
            key: None,
            key_passphrase: None,
            root: false,
            root_password: None,
            root_login: RootLogin::Su,
            root_login_explicit: false,
            conn_timeout: Duration::from_secs(30),
            io_timeout: None,
            timeouts: BufferTimeouts::default(),
            max_channels: None,
            proxy: None,
            use_bash_norc: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.key = Some(path.into());
        self.key_passphrase = passphrase;
        self
    }

    /// Enables root mode: new environments become root right after login.
    pub fn root(mut self, password: impl Into<String>) -> Self {
        self.root = true;
        self.root_password = Some(password.into());
        self
    }

    pub fn root_login(mut self, login: RootLogin) -> Self {
        self.root_login = login;
        self
    }

    pub fn root_login_explicit(mut self, explicit: bool) -> Self {
        self.root_login_explicit = explicit;
        self
    }

    pub fn conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn timeouts(mut self, timeouts: BufferTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Caps the number of worker sessions. Values above 10 are clamped when
    /// the pool applies the limit.
    pub fn max_channels(mut self, max: usize) -> Self {
        self.max_channels = Some(max);
        self
    }

    pub fn proxy(mut self, user: impl Into<String>, server: impl Into<String>) -> Self {
        self.proxy = Some(ProxyJump {
            user: user.into(),
            server: server.into(),
        });
        self
    }

    pub fn use_bash_norc(mut self, enabled: bool) -> Self {
        self.use_bash_norc = enabled;
        self
    }

    /// The password used when escalating to root.
    pub fn effective_root_password(&self) -> &str {
        self.root_password.as_deref().unwrap_or(&self.password)
    }

    /// `user@host:port` form used in log lines.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Per-command options carried by a container.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteOptions {
    /// Total bound for the container's whole pipeline.
    pub timeout: Duration,
    /// Scheduling priority. The executor orders ascending, so containers with
    /// higher values are scheduled later.
    pub priority: i32,
    /// Abort the remaining children of a queue when one fails.
    pub stop_on_failure: bool,
    /// Bypass output framing and frame extraction.
    pub no_parsing: bool,
    /// Prefix commands with `command ` to bypass shell aliases. Only applied
    /// on a BASH console.
    pub ignore_alias: bool,
    /// Return a typed timeout failure instead of an empty result when a wait
    /// times out.
    pub timeout_exceptions: bool,
    /// Require root on the leased environment before executing.
    pub root: bool,
    /// Lease only an environment carrying this label.
    pub label: Option<String>,
    /// Lease only the environment with this exact id.
    pub environment_id: Option<Uuid>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RUN_TIMEOUT,
            priority: 10,
            stop_on_failure: false,
            no_parsing: false,
            ignore_alias: false,
            timeout_exceptions: false,
            root: false,
            label: None,
            environment_id: None,
        }
    }
}

impl ExecuteOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        // A zero timeout is never usable; fall back to the default bound.
        self.timeout = if timeout.is_zero() {
            DEFAULT_RUN_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn no_parsing(mut self, no_parsing: bool) -> Self {
        self.no_parsing = no_parsing;
        self
    }

    pub fn ignore_alias(mut self, ignore: bool) -> Self {
        self.ignore_alias = ignore;
        self
    }

    pub fn timeout_exceptions(mut self, enabled: bool) -> Self {
        self.timeout_exceptions = enabled;
        self
    }

    pub fn root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn environment_id(mut self, id: Uuid) -> Self {
        self.environment_id = Some(id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bit_clamps_to_eighty_percent_of_run() {
        let timeouts = BufferTimeouts::default().with_run(Duration::from_secs(10));
        assert_eq!(timeouts.run, Duration::from_secs(10));
        assert_eq!(timeouts.first_bit, Duration::from_secs(8));
        assert_eq!(timeouts.between_bit, Duration::from_secs(1));
    }

    #[test]
    fn zero_run_falls_back_to_default() {
        let timeouts = BufferTimeouts::default().with_run(Duration::ZERO);
        assert_eq!(timeouts.run, DEFAULT_RUN_TIMEOUT);
        assert_eq!(timeouts.first_bit, DEFAULT_FIRST_BIT_TIMEOUT);
    }

    #[test]
    fn oversized_delay_is_forced_sane() {
        let mut timeouts = BufferTimeouts::default();
        timeouts.delay = Duration::from_secs(120);
        let clamped = timeouts.clamped();
        assert_eq!(clamped.delay, Duration::from_millis(200));

        timeouts.delay = Duration::ZERO;
        assert_eq!(timeouts.clamped().delay, DEFAULT_DELAY);
    }

    #[test]
    fn root_login_parses_and_alternates() {
        assert_eq!(RootLogin::parse("sudo su -"), RootLogin::SudoSu);
        assert_eq!(RootLogin::parse("su -"), RootLogin::Su);
        assert_eq!(RootLogin::Su.alternate(), RootLogin::SudoSu);
        assert!(RootLogin::SudoSu.command().contains("sudo -k"));
    }

    #[test]
    fn zero_execute_timeout_is_rejected() {
        let opts = ExecuteOptions::default().timeout(Duration::ZERO);
        assert_eq!(opts.timeout, DEFAULT_RUN_TIMEOUT);
    }
}
