use crate::errors::{Error, Result};
use crate::services::command::{CommandExecutor, EchoMode};
use crate::services::settings::Settings;
use crate::services::shell::RemoteShell;
use crate::utils::local_socket::{Endpoint, ListenerArtifacts, LocalListener, LocalStream};
use crate::utils::relay::ForwarderPair;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Snapshot of a tunnel's lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub prerequisite_installed: bool,
    pub listening: bool,
    pub endpoint: Option<String>,
    pub active_pairs: usize,
}

struct Listening {
    endpoint: Endpoint,
    artifacts: ListenerArtifacts,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

#[derive(Default)]
struct TunnelState {
    prerequisite_installed: bool,
    listening: Option<Listening>,
}

/// Exposes the remote control-plane socket as a local endpoint. Every
/// accepted local connection gets its own remote bridge channel and its own
/// forwarding pair.
pub struct SocketTunnel {
    shell: Arc<dyn RemoteShell>,
    executor: CommandExecutor,
    settings: Arc<Settings>,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<TunnelState>,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
    pairs: Arc<Mutex<Vec<CancellationToken>>>,
}

impl SocketTunnel {
    pub fn new(executor: CommandExecutor, settings: Arc<Settings>) -> Self {
        Self {
            shell: executor.shell().clone(),
            executor,
            settings,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(TunnelState::default()),
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
            pairs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Installs the bridge helper if needed, binds the local endpoint and
    /// starts accepting. Opening an already open tunnel returns its endpoint.
    pub async fn open(&self) -> Result<Endpoint> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(endpoint) = self.endpoint() {
            return Ok(endpoint);
        }

        if !self.lock_state().prerequisite_installed {
            let executor = self.executor.clone();
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || ensure_prerequisite(&executor, &settings))
                .await
                .map_err(|err| Error::Prerequisite(format!("install task failed: {}", err)))??;
            self.lock_state().prerequisite_installed = true;
        }

        let listener = LocalListener::bind(&self.settings.listen).await?;
        let endpoint = listener.endpoint().clone();
        let artifacts = listener.artifacts();
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(AcceptContext {
            listener,
            shell: self.shell.clone(),
            tracker: self.tracker.clone(),
            bridge_command: self.settings.bridge_command(),
            poll: self.settings.poll_interval(),
            shutdown: shutdown.clone(),
            active: self.active.clone(),
            pairs: self.pairs.clone(),
        }));

        self.lock_state().listening = Some(Listening {
            endpoint: endpoint.clone(),
            artifacts,
            shutdown,
            accept_task,
        });
        tracing::info!(endpoint = %endpoint, "tunnel listening");
        Ok(endpoint)
    }

    /// Stops accepting and removes the local endpoint. In-flight pairs are
    /// left to finish on their own. Closing a closed tunnel is a no-op.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(listening) = self.lock_state().listening.take() else {
            return;
        };
        listening.shutdown.cancel();
        if let Err(err) = listening.accept_task.await {
            tracing::warn!(error = %err, "tunnel accept loop ended abnormally");
        }
        listening.artifacts.remove();
        tracing::info!(
            endpoint = %listening.endpoint,
            in_flight = self.active_pairs(),
            "tunnel closed"
        );
    }

    /// Waits up to `timeout` for in-flight forwarders; stragglers are then
    /// cancelled and given a few poll intervals to exit. Returns whether
    /// every forwarder finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let mut drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            let tokens = std::mem::take(
                &mut *self.pairs.lock().unwrap_or_else(|err| err.into_inner()),
            );
            for token in tokens {
                token.cancel();
            }
            let grace = self.settings.poll_interval() * 4;
            drained = tokio::time::timeout(grace, self.tracker.wait())
                .await
                .is_ok();
        }
        self.tracker.reopen();
        drained
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.lock_state()
            .listening
            .as_ref()
            .map(|listening| listening.endpoint.clone())
    }

    pub fn is_listening(&self) -> bool {
        self.lock_state().listening.is_some()
    }

    pub fn active_pairs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TunnelStatus {
        let state = self.lock_state();
        TunnelStatus {
            prerequisite_installed: state.prerequisite_installed,
            listening: state.listening.is_some(),
            endpoint: state
                .listening
                .as_ref()
                .map(|listening| listening.endpoint.docker_host()),
            active_pairs: self.active_pairs(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Drop for SocketTunnel {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|err| err.into_inner());
        if let Some(listening) = state.listening.take() {
            listening.shutdown.cancel();
            listening.accept_task.abort();
            listening.artifacts.remove();
            tracing::debug!(endpoint = %listening.endpoint, "tunnel dropped while open");
        }
    }
}

/// Probes for the bridge helper and installs it when the probe fails.
pub fn ensure_prerequisite(executor: &CommandExecutor, settings: &Settings) -> Result<()> {
    let probe = settings.helper_probe_command.as_str();
    if executor.execute(probe, EchoMode::NONE)? == 0 {
        return Ok(());
    }
    tracing::info!(probe, "bridge helper missing, installing");
    for command in &settings.helper_install_commands {
        let status = executor
            .execute(command, EchoMode::ALL)
            .map_err(|err| Error::Prerequisite(format!("'{}': {}", command, err)))?;
        if status != 0 {
            return Err(Error::Prerequisite(format!(
                "'{}' exited with status {}",
                command, status
            )));
        }
    }
    match executor.execute(probe, EchoMode::NONE)? {
        0 => Ok(()),
        status => Err(Error::Prerequisite(format!(
            "'{}' still fails after install (status {})",
            probe, status
        ))),
    }
}

struct AcceptContext {
    listener: LocalListener,
    shell: Arc<dyn RemoteShell>,
    tracker: TaskTracker,
    bridge_command: String,
    poll: Duration,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    pairs: Arc<Mutex<Vec<CancellationToken>>>,
}

async fn accept_loop(ctx: AcceptContext) {
    let mut next_connection = 0u64;
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = ctx.listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "tunnel accept failed");
                tokio::time::sleep(ctx.poll).await;
                continue;
            }
        };
        next_connection += 1;
        let connection = next_connection;
        tracing::debug!(connection, "tunnel connection accepted");

        let shell = ctx.shell.clone();
        let tracker = ctx.tracker.clone();
        let command = ctx.bridge_command.clone();
        let poll = ctx.poll;
        let active = ctx.active.clone();
        let pairs = ctx.pairs.clone();
        ctx.tracker.spawn_blocking(move || {
            start_pair(
                &tracker, &*shell, &command, connection, stream, poll, active, &pairs,
            );
        });
    }
    tracing::debug!(endpoint = %ctx.listener.endpoint(), "tunnel accept loop stopped");
}

#[allow(clippy::too_many_arguments)]
fn start_pair(
    tracker: &TaskTracker,
    shell: &dyn RemoteShell,
    command: &str,
    connection: u64,
    stream: LocalStream,
    poll: Duration,
    active: Arc<AtomicUsize>,
    pairs: &Mutex<Vec<CancellationToken>>,
) {
    let pipe = match shell.spawn(command).and_then(|process| process.into_pipe()) {
        Ok(pipe) => pipe,
        Err(err) => {
            tracing::warn!(connection, error = %err, "cannot open bridge channel");
            stream.shutdown();
            return;
        }
    };
    match ForwarderPair::spawn(tracker, connection, stream, pipe, poll, active) {
        Ok(pair) => {
            let mut pairs = pairs.lock().unwrap_or_else(|err| err.into_inner());
            pairs.retain(|token| !token.is_cancelled());
            pairs.push(pair.token());
        }
        Err(err) => tracing::warn!(connection, error = %err, "cannot start forwarding pair"),
    }
}
