use super::*;

impl SshTransport {
    /// Establishes the SSH connection: TCP (optionally through a proxy jump),
    /// handshake with the compatibility algorithm set, then authentication
    /// with a private key when configured, password otherwise.
    pub async fn connect(options: Arc<ConnectOptions>) -> Result<SshTransport, ToolkitError> {
        let endpoint = options.endpoint();

        let config = Config {
            preferred: crate::config::preferred(),
            keepalive_interval: Some(crate::config::KEEPALIVE_INTERVAL),
            inactivity_timeout: options.io_timeout,
            ..Default::default()
        };

        let auth = match (&options.key, &options.password) {
            (Some(path), _) => {
                AuthMethod::with_key_file(path.clone(), options.key_passphrase.as_deref())
            }
            (None, password) => AuthMethod::with_password(password),
        };

        let (addr, proxy) = match &options.proxy {
            Some(jump) => {
                let (addr, child) = Self::spawn_proxy(&options, jump).await?;
                (addr, Some(child))
            }
            None => ((options.host.clone(), options.port), None),
        };

        let connect = Client::connect_with_config(
            addr,
            &options.username,
            auth,
            ServerCheckMethod::NoCheck,
            config,
        );
        let client = match tokio::time::timeout(options.conn_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                error!("{} connection failed: {}", endpoint, e);
                return Err(ToolkitError::from(e));
            }
            Err(_) => {
                return Err(ToolkitError::ConnectionFailure(format!(
                    "{} handshake did not complete within {:?}",
                    endpoint, options.conn_timeout
                )));
            }
        };
        debug!("{} TCP connection successful", endpoint);

        Ok(SshTransport {
            client,
            options,
            proxy: StdMutex::new(proxy),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawns a local `ssh` subprocess that forwards a loopback port to the
    /// target through the proxy host, and returns the loopback address to
    /// dial.
    async fn spawn_proxy(
        options: &ConnectOptions,
        jump: &crate::config::ProxyJump,
    ) -> Result<((String, u16), tokio::process::Child), ToolkitError> {
        // Reserve an ephemeral port, then hand it to ssh -L. The tiny window
        // between the drop and the forward starting is acceptable on loopback.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| {
                ToolkitError::ConnectionFailure(format!("failed to reserve proxy port: {e}"))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                ToolkitError::ConnectionFailure(format!("failed to read proxy port: {e}"))
            })?
            .port();
        drop(listener);

        let forward = format!("{}:{}:{}", port, options.host, options.port);
        let destination = format!("{}@{}", jump.user, jump.server);
        info!("starting proxy jump through {} ({})", destination, forward);

        let child = tokio::process::Command::new("ssh")
            .args([
                "-F",
                "/dev/null",
                "-o",
                "TCPKeepAlive=yes",
                "-o",
                "ServerAliveInterval=300",
                "-o",
                "ExitOnForwardFailure=yes",
                "-N",
                "-L",
                &forward,
                &destination,
            ])
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ToolkitError::ConnectionFailure(format!("failed to spawn proxy ssh: {e}"))
            })?;

        // Give the forward a moment to come up; the handshake timeout covers
        // the case where it never does.
        tokio::time::sleep(Duration::from_millis(750)).await;
        Ok((("127.0.0.1".to_string(), port), child))
    }

    /// Opens a new session channel with a PTY and an interactive shell.
    pub async fn open_shell_channel(
        &self,
    ) -> Result<russh::Channel<russh::client::Msg>, ToolkitError> {
        if self.is_closed() {
            return Err(ToolkitError::ChannelFailure(
                "transport is closed".to_string(),
            ));
        }
        let mut channel = self.client.get_channel().await.map_err(|e| {
            error!("failed to open session channel: {}", e);
            ToolkitError::ChannelFailure(e.to_string())
        })?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await
            .map_err(|e| ToolkitError::ChannelFailure(format!("pty request failed: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ToolkitError::ChannelFailure(format!("shell request failed: {e}")))?;
        Ok(channel)
    }

    /// Whether the transport is still usable.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.client.is_closed()
    }

    /// The connection options this transport was built with.
    pub fn options(&self) -> &Arc<ConnectOptions> {
        &self.options
    }

    /// Invalidates the transport and tears down the proxy subprocess. The
    /// underlying client closes when the last channel is dropped.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let child = self.proxy.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut child) = child {
            debug!("stopping proxy jump subprocess");
            let _ = child.kill().await;
        }
        debug!("{} transport closed", self.options.endpoint());
    }
}
