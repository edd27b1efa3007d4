use crate::errors::Result;
use crate::services::inventory::HostRecord;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Opens a remote shell session for a host. Blocking.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &HostRecord) -> Result<Arc<dyn RemoteShell>>;
}

/// A session able to start remote commands. Implementations must allow
/// concurrent `spawn` calls from several threads.
pub trait RemoteShell: Send + Sync {
    fn spawn(&self, command: &str) -> Result<Box<dyn RemoteProcess>>;

    /// Tears the underlying connection down. Safe to call more than once.
    fn disconnect(&self);
}

/// One remote command on its own channel.
///
/// Reads are non-blocking: `WouldBlock` means nothing is pending yet.
pub trait RemoteProcess: Send {
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// True once the remote side has sent EOF on its output.
    fn is_eof(&self) -> bool;

    /// Closes the channel and returns the remote exit status.
    fn wait(self: Box<Self>) -> Result<i32>;

    /// Turns the process into a raw byte pipe onto its stdin/stdout.
    fn into_pipe(self: Box<Self>) -> Result<RemotePipe>;
}

/// Duplex byte pipe onto a remote process. The reader may return
/// `WouldBlock`/`TimedOut` when idle; `Ok(0)` means the far side is gone.
pub struct RemotePipe {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl RemotePipe {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            reader,
            writer,
            closer: Some(Box::new(closer)),
        }
    }

    /// Splits into halves plus a close hook that releases the remote channel.
    pub fn into_parts(
        mut self,
    ) -> (
        Box<dyn Read + Send>,
        Box<dyn Write + Send>,
        Box<dyn FnOnce() + Send>,
    ) {
        let closer = self.closer.take().unwrap_or_else(|| Box::new(|| {}));
        (self.reader, self.writer, closer)
    }
}

impl fmt::Debug for RemotePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePipe").finish_non_exhaustive()
    }
}
