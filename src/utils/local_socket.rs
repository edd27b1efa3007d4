use crate::constants::tunnel;
use crate::errors::{Error, Result};
use crate::services::settings::ListenMode;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the tunnel listens locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Client-style address, e.g. `unix:///tmp/swarmlink-…/docker.sock`.
    pub fn docker_host(&self) -> String {
        match self {
            Endpoint::Unix(path) => format!("unix://{}", path.display()),
            Endpoint::Tcp(addr) => format!("tcp://{}", addr),
        }
    }

    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.docker_host())
    }
}

/// A bound listener plus the filesystem artifacts it owns.
pub struct LocalListener {
    inner: ListenerKind,
    endpoint: Endpoint,
    socket_dir: Option<PathBuf>,
}

enum ListenerKind {
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

impl LocalListener {
    /// Binds according to `mode`. Must run inside a tokio runtime.
    pub async fn bind(mode: &ListenMode) -> Result<Self> {
        match mode {
            ListenMode::Unix => {
                let socket_dir = std::env::temp_dir().join(format!(
                    "{}-{}",
                    tunnel::LOCAL_DIR_PREFIX,
                    uuid::Uuid::new_v4()
                ));
                create_private_dir(&socket_dir)
                    .map_err(|err| Error::Bind(format!("{}: {}", socket_dir.display(), err)))?;
                let path = socket_dir.join(tunnel::LOCAL_SOCKET_NAME);
                match tokio::net::UnixListener::bind(&path) {
                    Ok(listener) => Ok(Self {
                        inner: ListenerKind::Unix(listener),
                        endpoint: Endpoint::Unix(path),
                        socket_dir: Some(socket_dir),
                    }),
                    Err(err) => {
                        let _ = std::fs::remove_dir_all(&socket_dir);
                        Err(Error::Bind(format!("{}: {}", path.display(), err)))
                    }
                }
            }
            ListenMode::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|err| Error::Bind(format!("{}: {}", addr, err)))?;
                let bound = listener
                    .local_addr()
                    .map_err(|err| Error::Bind(format!("{}: {}", addr, err)))?;
                Ok(Self {
                    inner: ListenerKind::Tcp(listener),
                    endpoint: Endpoint::Tcp(bound),
                    socket_dir: None,
                })
            }
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn artifacts(&self) -> ListenerArtifacts {
        ListenerArtifacts {
            socket_path: self.endpoint.unix_path().map(Path::to_path_buf),
            socket_dir: self.socket_dir.clone(),
        }
    }

    /// Accepts one connection and hands it back as a blocking std stream.
    pub async fn accept(&self) -> io::Result<LocalStream> {
        let stream = match &self.inner {
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                LocalStream::Unix(stream)
            }
            ListenerKind::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let stream = stream.into_std()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                LocalStream::Tcp(stream)
            }
        };
        Ok(stream)
    }
}

/// Filesystem entries created by a unix listener; removed on teardown.
#[derive(Debug, Clone, Default)]
pub struct ListenerArtifacts {
    pub socket_path: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
}

impl ListenerArtifacts {
    pub fn remove(&self) {
        if let Some(path) = self.socket_path.as_ref() {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove tunnel socket");
                }
            }
        }
        if let Some(dir) = self.socket_dir.as_ref() {
            if let Err(err) = std::fs::remove_dir(dir) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir.display(), error = %err, "failed to remove tunnel directory");
                }
            }
        }
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// An accepted local client connection.
#[derive(Debug)]
pub enum LocalStream {
    Unix(std::os::unix::net::UnixStream),
    Tcp(std::net::TcpStream),
}

impl LocalStream {
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            LocalStream::Unix(s) => LocalStream::Unix(s.try_clone()?),
            LocalStream::Tcp(s) => LocalStream::Tcp(s.try_clone()?),
        })
    }

    /// Bounds every read and write so relay loops can observe cancellation.
    pub fn set_poll_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self {
            LocalStream::Unix(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
            LocalStream::Tcp(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = match self {
            LocalStream::Unix(s) => s.shutdown(Shutdown::Both),
            LocalStream::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalStream::Unix(s) => s.read(buf),
            LocalStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalStream::Unix(s) => s.write(buf),
            LocalStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalStream::Unix(s) => s.flush(),
            LocalStream::Tcp(s) => s.flush(),
        }
    }
}
