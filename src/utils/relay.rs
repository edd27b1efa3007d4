use crate::constants::tunnel as tunnel_constants;
use crate::services::shell::RemotePipe;
use crate::utils::local_socket::LocalStream;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client towards the remote socket.
    Upstream,
    /// Remote socket back to the local client.
    Downstream,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// Releases both ends of a pair once the last worker lets go of it.
struct PairResources {
    connection: u64,
    local: LocalStream,
    remote_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    active: Arc<AtomicUsize>,
}

impl Drop for PairResources {
    fn drop(&mut self) {
        self.local.shutdown();
        let closer = self
            .remote_close
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(close) = closer {
            close();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(connection = self.connection, "forwarding pair closed");
    }
}

/// Two relay workers bridging one local connection to one remote pipe.
/// Either side closing or failing cancels the shared token; both workers
/// notice within one poll interval and exit.
pub struct ForwarderPair {
    cancel: CancellationToken,
}

impl ForwarderPair {
    pub fn spawn(
        tracker: &TaskTracker,
        connection: u64,
        local: LocalStream,
        remote: RemotePipe,
        poll: Duration,
        active: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        local.set_poll_timeout(poll)?;
        let local_reader = local.try_clone()?;
        let local_writer = local.try_clone()?;
        let (remote_reader, remote_writer, remote_close) = remote.into_parts();
        let cancel = CancellationToken::new();

        active.fetch_add(1, Ordering::SeqCst);
        let resources = Arc::new(PairResources {
            connection,
            local,
            remote_close: Mutex::new(Some(remote_close)),
            active,
        });

        {
            let cancel = cancel.clone();
            let resources = resources.clone();
            tracker.spawn_blocking(move || {
                run_worker(
                    connection,
                    Direction::Upstream,
                    local_reader,
                    remote_writer,
                    &cancel,
                    poll,
                );
                drop(resources);
            });
        }
        {
            let cancel = cancel.clone();
            tracker.spawn_blocking(move || {
                run_worker(
                    connection,
                    Direction::Downstream,
                    remote_reader,
                    local_writer,
                    &cancel,
                    poll,
                );
                drop(resources);
            });
        }

        Ok(Self { cancel })
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn run_worker<R, W>(
    connection: u64,
    direction: Direction,
    reader: R,
    writer: W,
    cancel: &CancellationToken,
    poll: Duration,
) where
    R: Read,
    W: Write,
{
    match relay(reader, writer, cancel, poll) {
        Ok(bytes) => tracing::debug!(
            connection,
            direction = direction.as_str(),
            bytes,
            "relay finished"
        ),
        Err(err) => tracing::debug!(
            connection,
            direction = direction.as_str(),
            error = %err,
            "relay stopped on error"
        ),
    }
    cancel.cancel();
}

/// Copies bytes from `reader` to `writer` until EOF, an error or
/// cancellation. Idle reads (`WouldBlock`/`TimedOut`) just re-check the
/// token, so the loop never outlives its peer by more than one poll.
pub fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: &CancellationToken,
    poll: Duration,
) -> io::Result<u64>
where
    R: Read,
    W: Write,
{
    let mut buf = vec![0u8; tunnel_constants::RELAY_BUFFER_SIZE];
    let backoff = idle_backoff(poll);
    let mut total = 0u64;
    while !cancel.is_cancelled() {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                write_fully(&mut writer, &buf[..n], cancel, backoff)?;
                total += n as u64;
            }
            Err(err) if is_idle(&err) => std::thread::sleep(backoff),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

fn write_fully<W: Write>(
    writer: &mut W,
    mut data: &[u8],
    cancel: &CancellationToken,
    backoff: Duration,
) -> io::Result<()> {
    while !data.is_empty() {
        if cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer closed while writing",
            ));
        }
        match writer.write(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer accepted no bytes",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(err) if is_idle(&err) => std::thread::sleep(backoff),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn idle_backoff(poll: Duration) -> Duration {
    std::cmp::min(poll, Duration::from_millis(tunnel_constants::IDLE_BACKOFF_MS))
}
