use super::*;

impl ShellChannel {
    /// Receives the next chunk of channel output. Returns `None` once the
    /// channel's I/O task has ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.recv.recv().await
    }

    /// Discards any stale bytes left on the channel from a previous command.
    pub fn drain(&mut self) {
        let mut dropped = 0usize;
        while let Ok(chunk) = self.recv.try_recv() {
            dropped += chunk.len();
        }
        if dropped > 0 {
            debug!("{} drained {} stale bytes", self.tag, dropped);
        }
    }

    /// Sends `data` followed by a newline to the remote shell.
    pub async fn send_line(&mut self, data: &str) -> Result<(), ToolkitError> {
        if self.is_closed() {
            return Err(ToolkitError::ClosedBuffer(
                "channel closed while attempting to send data".to_string(),
            ));
        }
        self.sender.send(format!("{data}\n")).await?;
        Ok(())
    }

    /// Whether the channel's I/O task has observed EOF or exit.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Short identifier used in log lines.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Environment {
    /// Opens a new environment on the transport: session channel, PTY,
    /// interactive shell, and the I/O task bridging the channel to the
    /// runtime.
    pub async fn open(
        transport: &SshTransport,
        main: bool,
        label: Option<&str>,
    ) -> Result<Arc<Environment>, ToolkitError> {
        let id = Uuid::new_v4();
        let tag = format!("env-{}", &id.to_string()[..8]);
        let channel = transport.open_shell_channel().await?;
        debug!("{} shell request successful", tag);

        let (sender_to_shell, receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<Vec<u8>>(256);
        let closed = Arc::new(AtomicBool::new(false));

        Self::spawn_io_task(
            channel,
            receiver_from_user,
            sender_to_user,
            closed.clone(),
            tag.clone(),
        );

        let shell = ShellChannel {
            sender: sender_to_shell,
            recv: receiver_from_shell,
            closed: closed.clone(),
            tag,
            state: ShellState::new(),
        };

        Ok(Arc::new(Environment {
            id,
            main,
            label: StdMutex::new(label.unwrap_or_default().to_string()),
            custom: AtomicBool::new(label.is_some_and(|l| !l.is_empty())),
            active: AtomicBool::new(false),
            closed,
            shell: Arc::new(AsyncMutex::new(shell)),
        }))
    }

    fn spawn_io_task(
        mut channel: russh::Channel<russh::client::Msg>,
        mut from_user: Receiver<String>,
        to_user: Sender<Vec<u8>>,
        closed: Arc<AtomicBool>,
        tag: String,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = from_user.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} failed to send data to shell: {:?}", tag, e);
                            break;
                        }
                    },
                    msg = channel.wait() => {
                        let Some(msg) = msg else { break };
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if to_user.send(data.to_vec()).await.is_err() {
                                    debug!("{} shell output receiver dropped, closing task", tag);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} shell exited with status code: {}", tag, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} shell sent EOF", tag);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            debug!("{} SSH I/O task ended", tag);
        });
    }

    /// Tries to take the lease without waiting. Returns `None` when the
    /// environment is dead or another worker holds it.
    pub fn lease(self: &Arc<Self>) -> Option<EnvironmentLease> {
        if self.is_closed() {
            return None;
        }
        let guard = self.shell.clone().try_lock_owned().ok()?;
        self.active.store(true, Ordering::SeqCst);
        trace!("environment {} leased", self.id);
        Some(EnvironmentLease {
            env: self.clone(),
            guard,
        })
    }

    /// Waits for the lease. Used for the main environment, whose traffic is
    /// serialized rather than pooled.
    pub async fn acquire(self: &Arc<Self>) -> Result<EnvironmentLease, ToolkitError> {
        if self.is_closed() {
            return Err(ToolkitError::ClosedBuffer(format!(
                "environment {} is closed",
                self.id
            )));
        }
        let guard = self.shell.clone().lock_owned().await;
        self.active.store(true, Ordering::SeqCst);
        Ok(EnvironmentLease {
            env: self.clone(),
            guard,
        })
    }

    /// Stable identifier of this environment.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this is the main environment opened at connect time.
    pub fn is_main(&self) -> bool {
        self.main
    }

    /// The label, `MAIN` for the main environment.
    pub fn label(&self) -> String {
        if self.main {
            return "MAIN".to_string();
        }
        self.label.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Applies a custom label. The main environment cannot be relabeled.
    pub fn set_label(&self, label: &str) {
        if self.main {
            warn!("refusing to relabel the main environment");
            return;
        }
        if let Ok(mut guard) = self.label.lock() {
            *guard = label.to_string();
        }
        self.custom.store(!label.is_empty(), Ordering::SeqCst);
    }

    /// Whether this environment was created with (or assigned) a label and is
    /// therefore reserved for callers asking for it.
    pub fn is_custom(&self) -> bool {
        self.custom.load(Ordering::SeqCst)
    }

    /// Whether a worker currently holds the lease.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the underlying channel is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the channel dead so the pool reaps it.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("main", &self.main)
            .field("label", &self.label())
            .field("active", &self.is_active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EnvironmentLease {
    /// The environment this lease reserves.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Mutable access to the shell channel for the duration of the lease.
    pub fn channel(&mut self) -> &mut ShellChannel {
        &mut self.guard
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.env.active.store(false, Ordering::SeqCst);
        trace!("environment {} released", self.env.id);
    }
}
