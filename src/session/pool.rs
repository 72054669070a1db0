use super::*;

use crate::buffer::{BufferOptions, extract_frame};

/// Fallback cap when the server's limit cannot be discovered.
const DEFAULT_MAX_SESSIONS: usize = 8;

/// Hard ceiling applied to caller overrides.
const MAX_SESSIONS_CEILING: usize = 10;

/// Shell snippet that reads `MaxSessions` out of the target's sshd_config.
///
/// Echoes the fallback value when the file is missing or the directive is
/// commented out; the pool subtracts one for its own bookkeeping session.
fn max_sessions_probe(fallback: usize) -> String {
    format!(
        "if [ -f /etc/ssh/sshd_config ]; then \
         output=$(grep -v '^#' /etc/ssh/sshd_config 2>&1 | awk '/MaxSessions/ {{print $2}}'); \
         if [ -z \"$output\" ]; then output='{fallback}'; fi; \
         else output='{fallback}'; fi; echo $output"
    )
}

/// Clamps a caller-provided session override into the permitted range.
fn configured_cap(max_channels: Option<usize>) -> Option<usize> {
    max_channels.map(|cap| cap.clamp(1, MAX_SESSIONS_CEILING))
}

impl EnvironmentPool {
    /// Opens the main environment on the transport, bootstraps it, and
    /// discovers the session cap.
    pub async fn connect(
        transport: Arc<SshTransport>,
        controller: Arc<EnvironmentController>,
        options: Arc<ConnectOptions>,
    ) -> Result<EnvironmentPool, ToolkitError> {
        let main = Environment::open(&transport, true, None).await?;
        {
            let mut lease = main.acquire().await?;
            controller.bootstrap(lease.channel()).await?;
        }
        let max_sessions = Self::discover_max_sessions(&main, &controller, &options).await;
        info!(
            "environment pool ready on {} with session cap {}",
            options.endpoint(),
            max_sessions
        );
        Ok(EnvironmentPool {
            transport,
            controller,
            options,
            main: main.clone(),
            registry: StdMutex::new(vec![main]),
            max_sessions,
        })
    }

    /// The session cap in effect: the caller override when present, otherwise
    /// the server's `MaxSessions` minus one, defaulting to 8 when unknown.
    async fn discover_max_sessions(
        main: &Arc<Environment>,
        controller: &EnvironmentController,
        options: &ConnectOptions,
    ) -> usize {
        if let Some(cap) = configured_cap(options.max_channels) {
            return cap;
        }
        // The probe fallback is one above the default so the subtraction
        // lands back on it.
        let probe = max_sessions_probe(DEFAULT_MAX_SESSIONS + 1);
        let timeouts = controller
            .buffer()
            .defaults()
            .with_run(Duration::from_secs(15));

        let Ok(mut lease) = main.acquire().await else {
            return DEFAULT_MAX_SESSIONS;
        };
        let output = match controller
            .buffer()
            .execute(lease.channel(), &probe, &BufferOptions::new(timeouts))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!("error probing MaxSessions: {}", e);
                return DEFAULT_MAX_SESSIONS;
            }
        };
        let discovered = extract_frame(&output)
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<usize>().ok());
        match discovered {
            Some(value) if value > 0 => (value - 1).max(1),
            _ => DEFAULT_MAX_SESSIONS,
        }
    }

    /// Leases an environment, blocking up to `wait`.
    ///
    /// Matching order: exact id, then label, then any inactive non-custom
    /// environment. When nothing matches and `auto_create` holds (and no id
    /// was requested), a new environment is created under the cap. Returns
    /// `None` when the wait expires.
    pub async fn lease(
        &self,
        auto_create: bool,
        label: Option<&str>,
        id: Option<Uuid>,
        wait: Duration,
        delay: Duration,
    ) -> Result<Option<EnvironmentLease>, ToolkitError> {
        let deadline = tokio::time::Instant::now() + wait;
        let auto_create = auto_create && id.is_none();
        loop {
            self.reap_closed();
            if let Some(lease) = self.try_match(label, id) {
                return Ok(Some(lease));
            }
            if auto_create && self.count() < self.max_sessions {
                let env = self.create(label).await?;
                if let Some(lease) = env.lease() {
                    return Ok(Some(lease));
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!("lease wait of {:?} expired", wait);
                return Ok(None);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    /// One matching pass over the registry.
    fn try_match(&self, label: Option<&str>, id: Option<Uuid>) -> Option<EnvironmentLease> {
        let registry = self.registry.lock().ok()?;
        let candidates: Vec<&Arc<Environment>> = if let Some(id) = id {
            registry.iter().filter(|e| e.id() == id).collect()
        } else if let Some(label) = label {
            registry.iter().filter(|e| e.label() == label).collect()
        } else {
            // The main environment is reserved for bootstrap work and labeled
            // environments for the callers that asked for them.
            registry
                .iter()
                .filter(|e| !e.is_main() && !e.is_custom())
                .collect()
        };
        candidates
            .into_iter()
            .filter(|e| !e.is_active())
            .find_map(|e| e.lease())
    }

    /// Opens a new environment on the transport and registers it.
    pub async fn create(&self, label: Option<&str>) -> Result<Arc<Environment>, ToolkitError> {
        if self.count() >= self.max_sessions {
            return Err(ToolkitError::ChannelFailure(format!(
                "session cap of {} reached",
                self.max_sessions
            )));
        }
        let env = Environment::open(&self.transport, false, label).await?;
        {
            let mut lease = env.acquire().await?;
            self.controller.bootstrap(lease.channel()).await?;
        }

        let registered = self
            .registry
            .lock()
            .map(|mut registry| {
                // Re-check under the lock: another worker may have filled the
                // last slot while this session was bootstrapping.
                if registry.len() >= self.max_sessions {
                    false
                } else {
                    registry.push(env.clone());
                    true
                }
            })
            .unwrap_or(false);
        if !registered {
            env.mark_closed();
            return Err(ToolkitError::ChannelFailure(format!(
                "session cap of {} reached",
                self.max_sessions
            )));
        }
        debug!("created environment {} (label: {:?})", env.id(), label);
        Ok(env)
    }

    /// Returns a lease to the pool. The channel stays open for reuse.
    pub fn release(&self, lease: EnvironmentLease) {
        drop(lease);
    }

    /// Unregisters an environment. The main environment is never removed
    /// while the connection is alive.
    pub fn remove(&self, env: &Arc<Environment>) {
        if env.is_main() && !self.transport.is_closed() {
            warn!("refusing to remove the main environment from the pool");
            return;
        }
        if let Ok(mut registry) = self.registry.lock() {
            registry.retain(|e| e.id() != env.id());
        }
    }

    /// Drops environments whose channels have closed underneath us.
    fn reap_closed(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.retain(|e| {
                let keep = e.is_main() || !e.is_closed();
                if !keep {
                    debug!("reaping closed environment {}", e.id());
                }
                keep
            });
        }
    }

    /// Logs out and closes every environment, non-main first, then the main
    /// environment, then the transport.
    pub async fn disconnect_all(&self) {
        info!("disconnecting all environments");
        let environments = self.environments();
        for env in environments.iter().filter(|e| !e.is_main()) {
            if let Ok(mut lease) = env.acquire().await {
                let _ = self.controller.disconnect(lease.channel()).await;
            }
            env.mark_closed();
            self.remove(env);
        }
        if let Ok(mut lease) = self.main.acquire().await {
            let _ = self.controller.disconnect(lease.channel()).await;
        }
        self.main.mark_closed();
        self.transport.close().await;
    }

    /// The main environment opened at connect time.
    pub fn main(&self) -> &Arc<Environment> {
        &self.main
    }

    /// Number of registered environments, main included.
    pub fn count(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Snapshot of the registry.
    pub fn environments(&self) -> Vec<Arc<Environment>> {
        self.registry
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// The session cap in effect.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// The escalation controller shared by this pool.
    pub fn controller(&self) -> &Arc<EnvironmentController> {
        &self.controller
    }

    /// The transport all environments share.
    pub fn transport(&self) -> &Arc<SshTransport> {
        &self.transport
    }

    /// The connection options this pool was built with.
    pub fn connect_options(&self) -> &Arc<ConnectOptions> {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_override_is_hard_capped() {
        assert_eq!(configured_cap(Some(4)), Some(4));
        assert_eq!(configured_cap(Some(25)), Some(10));
        assert_eq!(configured_cap(Some(0)), Some(1));
        assert_eq!(configured_cap(None), None);
    }

    #[test]
    fn probe_snippet_carries_fallback() {
        let probe = max_sessions_probe(9);
        assert!(probe.contains("output='9'"));
        assert!(probe.contains("/etc/ssh/sshd_config"));
        assert!(probe.contains("MaxSessions"));
    }
}
