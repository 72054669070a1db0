//! The toolkit facade: one connection, one pool, one worker set, and the
//! module registry.
//!
//! [`Toolkit`] is the entry point callers hold on to. It owns the SSH
//! transport, the environment pool and the threader, wires containers to
//! them, and resolves command modules by name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::command::{CommandContainer, CommandRequest, CommandResult, HookSet};
use crate::config::{ConnectOptions, ExecuteOptions};
use crate::error::ToolkitError;
use crate::executor::{ExecBackend, Threader};
use crate::modules::{CommandModule, ModuleRegistry};
use crate::session::{
    BecomeUserOptions, ConsoleEscalation, Environment, EnvironmentController, EnvironmentLease,
    EnvironmentPool, SshTransport,
};

/// Default quiesce budget for [`Toolkit::disconnect`].
const DISCONNECT_WAIT: Duration = Duration::from_secs(90);

struct Connection {
    backend: Arc<ExecBackend>,
    threader: Arc<Threader>,
    digest: [u8; 32],
}

/// Entry point owning the connection, the environment pool, the worker set
/// and a lazy registry of command modules.
pub struct Toolkit {
    options: StdMutex<Arc<ConnectOptions>>,
    connection: AsyncMutex<Option<Connection>>,
    modules: StdMutex<HashMap<String, Arc<dyn CommandModule>>>,
    registry: StdMutex<ModuleRegistry>,
}

/// Digest of the inputs that make a connection reusable. A changed password
/// or endpoint forces a reconnect.
fn credentials_digest(options: &ConnectOptions) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(options.host.as_bytes());
    hasher.update(options.port.to_be_bytes());
    hasher.update(options.username.as_bytes());
    hasher.update(options.password.as_bytes());
    hasher.update(options.effective_root_password().as_bytes());
    if let Some(key) = &options.key {
        hasher.update(key.display().to_string().as_bytes());
    }
    hasher.finalize().into()
}

impl Toolkit {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options: StdMutex::new(Arc::new(options)),
            connection: AsyncMutex::new(None),
            modules: StdMutex::new(HashMap::new()),
            registry: StdMutex::new(ModuleRegistry::new()),
        }
    }

    /// The options the next connection will use.
    pub fn options(&self) -> Arc<ConnectOptions> {
        self.options
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| Arc::new(ConnectOptions::new("", "", "")))
    }

    /// Replaces the connection options. Takes effect on the next
    /// [`connect`](Self::connect); a live connection with a different
    /// credential digest is torn down then.
    pub fn set_options(&self, options: ConnectOptions) {
        if let Ok(mut guard) = self.options.lock() {
            *guard = Arc::new(options);
        }
    }

    /// Establishes the connection: transport, main environment, pool and
    /// worker set. Reuses a healthy connection with unchanged credentials.
    pub async fn connect(&self) -> Result<(), ToolkitError> {
        let options = self.options();
        let digest = credentials_digest(&options);
        let mut connection = self.connection.lock().await;

        if let Some(existing) = connection.as_ref() {
            if !existing.backend.pool().transport().is_closed() && existing.digest == digest {
                debug!("reusing existing connection to {}", options.endpoint());
                return Ok(());
            }
            debug!("connection stale or parameters changed, reconnecting");
            existing.threader.shutdown(Duration::from_secs(30)).await;
            *connection = None;
        }

        info!("connecting to {}", options.endpoint());
        let transport = Arc::new(SshTransport::connect(options.clone()).await?);
        let controller = Arc::new(EnvironmentController::new(options.clone()));
        let pool = Arc::new(EnvironmentPool::connect(transport, controller, options.clone()).await?);
        let backend = ExecBackend::new(pool);
        let threader = Threader::new(backend.clone());
        *connection = Some(Connection {
            backend,
            threader,
            digest,
        });
        Ok(())
    }

    /// Quiesces the workers, logs out of every environment and closes the
    /// transport.
    pub async fn disconnect(&self) -> Result<(), ToolkitError> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.take() {
            existing.threader.shutdown(DISCONNECT_WAIT).await;
        }
        Ok(())
    }

    /// Whether a usable connection exists.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.backend.pool().transport().is_closed())
    }

    async fn ensure_connected(&self) -> Result<Arc<ExecBackend>, ToolkitError> {
        {
            let connection = self.connection.lock().await;
            if let Some(existing) = connection.as_ref()
                && !existing.backend.pool().transport().is_closed()
            {
                return Ok(existing.backend.clone());
            }
        }
        self.connect().await?;
        let connection = self.connection.lock().await;
        connection
            .as_ref()
            .map(|c| c.backend.clone())
            .ok_or_else(|| ToolkitError::ConnectionFailure("connection unavailable".to_string()))
    }

    // ----- execution -------------------------------------------------------

    /// Wraps `request` in a container and submits it to the worker pool.
    /// The returned container is the handle to wait on.
    pub async fn execute(
        &self,
        request: impl Into<CommandRequest>,
    ) -> Result<Arc<CommandContainer>, ToolkitError> {
        self.execute_with(request, ExecuteOptions::default(), HookSet::default())
            .await
    }

    /// [`execute`](Self::execute) with explicit options and hooks.
    pub async fn execute_with(
        &self,
        request: impl Into<CommandRequest>,
        opts: ExecuteOptions,
        hooks: HookSet,
    ) -> Result<Arc<CommandContainer>, ToolkitError> {
        let backend = self.ensure_connected().await?;
        let container = CommandContainer::new(request, opts, hooks)?;
        backend.submit(container.clone())?;
        Ok(container)
    }

    /// Runs `request` to completion on the main environment and returns the
    /// published result directly.
    pub async fn execute_unthreaded(
        &self,
        request: impl Into<CommandRequest>,
        opts: ExecuteOptions,
        hooks: HookSet,
    ) -> Result<CommandResult, ToolkitError> {
        let backend = self.ensure_connected().await?;
        let container = CommandContainer::new(request, opts, hooks)?;
        container.execute(&backend, None).await;
        Ok(container
            .results()
            .unwrap_or_else(|| CommandResult::Text(String::new())))
    }

    /// Blocks until the worker pool has no queued or running containers.
    pub async fn wait_idle(&self, timeout: Duration, delay: Duration) -> bool {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(existing) => existing.threader.wait_idle(timeout, delay).await,
            None => true,
        }
    }

    // ----- environments ----------------------------------------------------

    /// Leases an environment, optionally by label or exact id.
    pub async fn lease_environment(
        &self,
        label: Option<&str>,
        id: Option<Uuid>,
        wait: Duration,
    ) -> Result<Option<EnvironmentLease>, ToolkitError> {
        let backend = self.ensure_connected().await?;
        backend
            .pool()
            .lease(true, label, id, wait, Duration::from_millis(100))
            .await
    }

    /// Creates a new environment, optionally labeled.
    pub async fn create_environment(
        &self,
        label: Option<&str>,
    ) -> Result<Arc<Environment>, ToolkitError> {
        let backend = self.ensure_connected().await?;
        backend.pool().create(label).await
    }

    /// The escalation controller of the live connection.
    pub async fn controller(&self) -> Result<Arc<EnvironmentController>, ToolkitError> {
        let backend = self.ensure_connected().await?;
        Ok(backend.controller().clone())
    }

    /// Escalates the leased environment to root.
    pub async fn become_root(&self, lease: &mut EnvironmentLease) -> Result<(), ToolkitError> {
        let controller = self.controller().await?;
        controller.become_root(lease.channel(), true).await
    }

    /// Escalates or de-escalates the leased environment to `user`.
    pub async fn become_user(
        &self,
        lease: &mut EnvironmentLease,
        login_cmd: &str,
        user: &str,
        password: Option<&str>,
        opts: BecomeUserOptions,
    ) -> Result<(), ToolkitError> {
        let controller = self.controller().await?;
        controller
            .become_user(lease.channel(), login_cmd, user, password, opts)
            .await
    }

    /// Pushes a console (e.g. `mysql`) on the leased environment.
    pub async fn console_escalate(
        &self,
        lease: &mut EnvironmentLease,
        escalation: ConsoleEscalation,
    ) -> Result<(), ToolkitError> {
        let controller = self.controller().await?;
        controller.console_escalation(lease.channel(), escalation).await
    }

    /// Records an environment mutation (e.g. `export`) on the leased
    /// environment.
    pub async fn environment_change(
        &self,
        lease: &mut EnvironmentLease,
        name: &str,
        command: &str,
    ) -> Result<(), ToolkitError> {
        let controller = self.controller().await?;
        controller
            .environment_change(lease.channel(), name, command)
            .await
    }

    /// Prompt-free authoritative user check on the given lease, or on the
    /// main environment when none is given.
    pub async fn whoami(
        &self,
        lease: Option<&mut EnvironmentLease>,
    ) -> Result<String, ToolkitError> {
        let backend = self.ensure_connected().await?;
        match lease {
            Some(lease) => backend.controller().check_whoami(lease.channel()).await,
            None => {
                let main = backend.pool().main().clone();
                let mut lease = main.acquire().await?;
                backend.controller().check_whoami(lease.channel()).await
            }
        }
    }

    // ----- modules ---------------------------------------------------------

    /// Registers a module constructor on this toolkit instance.
    pub fn register_module(
        &self,
        name: impl Into<String>,
        constructor: impl Fn() -> Arc<dyn CommandModule> + Send + Sync + 'static,
    ) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.register(name, constructor);
        }
    }

    /// Resolves a module by name: cached instance first, then the registry.
    /// Modules are singletons per toolkit.
    pub fn get_module(&self, name: &str) -> Result<Arc<dyn CommandModule>, ToolkitError> {
        if let Some(module) = self
            .modules
            .lock()
            .ok()
            .and_then(|modules| modules.get(name).cloned())
        {
            return Ok(module);
        }
        let constructed = self
            .registry
            .lock()
            .ok()
            .and_then(|registry| registry.construct(name));
        match constructed {
            Some(module) => {
                if let Ok(mut modules) = self.modules.lock() {
                    modules.insert(name.to_string(), module.clone());
                }
                Ok(module)
            }
            None => Err(ToolkitError::DataFormat(format!("unknown module: {name}"))),
        }
    }

    /// Builds and submits the request of the named module.
    pub async fn run_module(
        &self,
        name: &str,
        flags: Option<&str>,
    ) -> Result<Arc<CommandContainer>, ToolkitError> {
        let module = self.get_module(name)?;
        self.execute(module.build_request(flags)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{GenericModule, ModuleDefaults};

    fn toolkit() -> Toolkit {
        Toolkit::new(ConnectOptions::new("web01", "admin", "secret"))
    }

    #[test]
    fn credential_digest_tracks_inputs() {
        let a = credentials_digest(&ConnectOptions::new("web01", "admin", "secret"));
        let b = credentials_digest(&ConnectOptions::new("web01", "admin", "secret"));
        let c = credentials_digest(&ConnectOptions::new("web01", "admin", "changed"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn modules_are_singletons_per_toolkit() {
        let toolkit = toolkit();
        toolkit.register_module("uptime", || {
            GenericModule::new("uptime", ModuleDefaults::new("uptime").key("uptime"))
        });

        let first = toolkit.get_module("uptime").expect("module");
        let second = toolkit.get_module("uptime").expect("module");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(toolkit.get_module("nope").is_err());
    }

    #[test]
    fn separate_toolkits_do_not_share_modules() {
        let one = toolkit();
        let two = toolkit();
        one.register_module("free", || {
            GenericModule::new("free", ModuleDefaults::new("free").flags("-m"))
        });
        assert!(one.get_module("free").is_ok());
        assert!(two.get_module("free").is_err());
    }
}
