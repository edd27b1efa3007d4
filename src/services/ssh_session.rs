use crate::constants::{network as network_constants, tunnel as tunnel_constants};
use crate::errors::{Error, Result};
use crate::services::host_keys::{policy_for, HostKeyPolicy};
use crate::services::inventory::HostRecord;
use crate::services::settings::Settings;
use crate::services::shell::{Connector, RemotePipe, RemoteProcess, RemoteShell};
use ssh2::{Channel, Session};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One authenticated ssh2 connection. After authentication the session runs
/// non-blocking so that many channels can be pumped from different threads.
pub struct SshSession {
    session: Session,
    host: String,
    open_lock: Mutex<()>,
    io_timeout: Duration,
    closed: AtomicBool,
}

impl SshSession {
    pub fn connect(host: &str, settings: &Settings, policy: &dyn HostKeyPolicy) -> Result<Self> {
        let port = settings.ssh_port;
        let timeout = settings.connect_timeout();
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|err| Error::Unreachable(format!("{}: {}", host, err)))?
            .next()
            .ok_or_else(|| Error::Unreachable(format!("{}: no address", host)))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| Error::Unreachable(format!("{}: {}", addr, err)))?;
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();

        let mut session =
            Session::new().map_err(|err| Error::Protocol(format!("session init: {}", err)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|err| Error::Protocol(format!("{}: handshake failed: {}", host, err)))?;

        policy.verify(&session, host, port)?;

        let user = settings.ssh_user.as_str();
        let auth = match settings.identity_file.as_ref() {
            Some(identity) => session.userauth_pubkey_file(user, None, identity, None),
            None => session.userauth_agent(user),
        };
        auth.map_err(|err| Error::Authentication(format!("{}@{}: {}", user, host, err)))?;
        if !session.authenticated() {
            return Err(Error::Authentication(format!(
                "{}@{}: no accepted credentials",
                user, host
            )));
        }

        let interval = std::cmp::max(1, (settings.keepalive_interval_ms / 1000) as u32);
        session.set_keepalive(true, interval);
        session.set_timeout(0);
        session.set_blocking(false);

        tracing::info!(host, user, "ssh session established");
        Ok(Self {
            session,
            host: host.to_string(),
            open_lock: Mutex::new(()),
            io_timeout: timeout,
            closed: AtomicBool::new(false),
        })
    }
}

impl RemoteShell for SshSession {
    fn spawn(&self, command: &str) -> Result<Box<dyn RemoteProcess>> {
        // Channel setup is serialised; byte traffic on open channels is not.
        let _guard = self.open_lock.lock().unwrap_or_else(|err| err.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::execution(format!("session to {} is closed", self.host)));
        }
        let mut channel = retry_eagain(self.io_timeout, || self.session.channel_session())
            .map_err(|err| Error::execution(format!("open channel: {}", err)))?;
        retry_eagain(self.io_timeout, || channel.exec(command))
            .map_err(|err| Error::execution(format!("exec '{}': {}", command, err)))?;
        tracing::debug!(host = %self.host, command, "remote channel opened");
        Ok(Box::new(SshProcess {
            channel,
            io_timeout: self.io_timeout,
        }))
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.open_lock.lock().unwrap_or_else(|err| err.into_inner());
        if let Err(err) = retry_eagain(self.io_timeout, || {
            self.session.disconnect(None, "swarmlink session closed", None)
        }) {
            tracing::debug!(host = %self.host, error = %err, "ssh disconnect was not clean");
        }
        tracing::info!(host = %self.host, "ssh session closed");
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct SshProcess {
    channel: Channel,
    io_timeout: Duration,
}

impl RemoteProcess for SshProcess {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.stderr().read(buf)
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn wait(mut self: Box<Self>) -> Result<i32> {
        let timeout = self.io_timeout;
        retry_eagain(timeout, || self.channel.close())
            .map_err(|err| Error::execution(format!("close channel: {}", err)))?;
        retry_eagain(timeout, || self.channel.wait_close())
            .map_err(|err| Error::execution(format!("wait for channel close: {}", err)))?;
        self.channel
            .exit_status()
            .map_err(|err| Error::execution(format!("exit status unavailable: {}", err)))
    }

    fn into_pipe(self: Box<Self>) -> Result<RemotePipe> {
        let SshProcess {
            channel,
            io_timeout,
        } = *self;
        let writer = channel.stream(0);
        let channel = Arc::new(Mutex::new(channel));
        let reader = ChannelReader {
            channel: channel.clone(),
            scratch: vec![0u8; 4096],
        };
        Ok(RemotePipe::new(Box::new(reader), Box::new(writer), move || {
            let mut channel = channel.lock().unwrap_or_else(|err| err.into_inner());
            if let Err(err) = retry_eagain(io_timeout, || channel.close()) {
                tracing::debug!(error = %err, "bridge channel close failed");
            }
        }))
    }
}

/// Stdout side of a bridge channel. Stderr is drained on every poll so a
/// chatty helper cannot exhaust the channel window.
struct ChannelReader {
    channel: Arc<Mutex<Channel>>,
    scratch: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut channel = self.channel.lock().unwrap_or_else(|err| err.into_inner());
        if let Ok(n) = channel.stderr().read(&mut self.scratch) {
            if n > 0 {
                tracing::debug!(
                    stderr = %String::from_utf8_lossy(&self.scratch[..n]).trim_end(),
                    "bridge helper stderr"
                );
            }
        }
        match channel.read(buf) {
            Ok(0) if !channel.eof() => Err(io::ErrorKind::WouldBlock.into()),
            other => other,
        }
    }
}

fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(code) if code == network_constants::SSH_ERROR_EAGAIN)
}

/// Repeats a libssh2 call while it reports EAGAIN, up to `timeout`.
fn retry_eagain<T, F>(timeout: Duration, mut op: F) -> std::result::Result<T, ssh2::Error>
where
    F: FnMut() -> std::result::Result<T, ssh2::Error>,
{
    let started = Instant::now();
    let backoff = Duration::from_millis(tunnel_constants::IDLE_BACKOFF_MS);
    loop {
        match op() {
            Err(err) if is_eagain(&err) && started.elapsed() < timeout => {
                std::thread::sleep(backoff);
            }
            other => return other,
        }
    }
}

/// Opens ssh2 sessions for discovered hosts.
pub struct SshConnector {
    settings: Arc<Settings>,
    policy: Arc<dyn HostKeyPolicy>,
}

impl SshConnector {
    pub fn new(settings: Arc<Settings>) -> Self {
        let policy = policy_for(&settings);
        Self { settings, policy }
    }

    pub fn with_policy(settings: Arc<Settings>, policy: Arc<dyn HostKeyPolicy>) -> Self {
        Self { settings, policy }
    }
}

impl Connector for SshConnector {
    fn connect(&self, host: &HostRecord) -> Result<Arc<dyn RemoteShell>> {
        let session = SshSession::connect(&host.dns_name, &self.settings, self.policy.as_ref())?;
        Ok(Arc::new(session))
    }
}
