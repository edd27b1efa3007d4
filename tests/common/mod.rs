#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarmlink::errors::{Error, Result};
use swarmlink::services::echo::{Echo, EchoLine};
use bytes::Bytes;
use swarmlink::services::engine::{ObjectApi, ServiceApi, ServiceDefinition, ServiceRef, SwarmObject};
use swarmlink::services::inventory::HostRecord;
use swarmlink::services::settings::Settings;
use swarmlink::services::shell::{Connector, RemotePipe, RemoteProcess, RemoteShell};
use tokio::sync::Mutex as AsyncMutex;

pub static ENV_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

pub const POLL_MS: u64 = 20;

pub fn test_settings() -> Settings {
    Settings {
        poll_interval_ms: POLL_MS,
        ..Settings::default()
    }
}

/// Canned result for one remote command.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Drop the "connection" after the scripted output.
    pub disconnect: bool,
}

impl Script {
    pub fn status(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn output(stdout: &str, stderr: &str, status: i32) -> Self {
        Self {
            status,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            disconnect: false,
        }
    }
}

/// Far end of one bridge channel, standing in for the remote socket.
#[derive(Clone)]
pub struct RemoteEnd {
    stream: Arc<UnixStream>,
    closed: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl RemoteEnd {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Simulates the remote socket going away.
    pub fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// In-process remote shell. Scripted commands answer from a queue (the
/// last entry repeats); the bridge command gets a socket pair whose far end
/// echoes everything back.
pub struct FakeShell {
    bridge_command: String,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    executed: Mutex<Vec<String>>,
    remote_ends: Mutex<Vec<RemoteEnd>>,
    failing_bridges: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeShell {
    pub fn new(settings: &Settings) -> Arc<Self> {
        Arc::new(Self {
            bridge_command: settings.bridge_command(),
            scripts: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            remote_ends: Mutex::new(Vec::new()),
            failing_bridges: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, command: &str, responses: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(command.to_string(), responses.into());
    }

    /// Makes the next `count` bridge channels fail to open.
    pub fn fail_next_bridges(&self, count: usize) {
        self.failing_bridges.store(count, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn remote_ends(&self) -> Vec<RemoteEnd> {
        self.remote_ends
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn next_script(&self, command: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap_or_else(|err| err.into_inner());
        match scripts.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Script::default(),
        }
    }

    fn open_bridge(&self) -> Result<Box<dyn RemoteProcess>> {
        let pending = self.failing_bridges.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_bridges.store(pending - 1, Ordering::SeqCst);
            return Err(Error::execution("channel open refused"));
        }
        let (local, remote) = UnixStream::pair()?;
        local.set_read_timeout(Some(Duration::from_millis(POLL_MS)))?;
        let end = RemoteEnd {
            stream: Arc::new(remote.try_clone()?),
            closed: Arc::new(AtomicBool::new(false)),
            received: Arc::new(Mutex::new(Vec::new())),
        };
        spawn_echo(remote, end.clone());
        self.remote_ends
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(end);
        Ok(Box::new(BridgeProcess { local }))
    }
}

fn spawn_echo(mut remote: UnixStream, end: RemoteEnd) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match remote.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    end.received
                        .lock()
                        .unwrap_or_else(|err| err.into_inner())
                        .extend_from_slice(&buf[..n]);
                    if remote.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = remote.shutdown(std::net::Shutdown::Both);
        end.closed.store(true, Ordering::SeqCst);
    });
}

impl RemoteShell for FakeShell {
    fn spawn(&self, command: &str) -> Result<Box<dyn RemoteProcess>> {
        self.executed
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(command.to_string());
        if command == self.bridge_command {
            return self.open_bridge();
        }
        Ok(Box::new(ScriptedProcess::new(self.next_script(command))))
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedProcess {
    script: Script,
    stdout_pos: usize,
    stderr_pos: usize,
    chunk: usize,
}

impl ScriptedProcess {
    fn new(script: Script) -> Self {
        Self {
            script,
            stdout_pos: 0,
            stderr_pos: 0,
            chunk: 3,
        }
    }

    fn drained(&self) -> bool {
        self.stdout_pos >= self.script.stdout.len() && self.stderr_pos >= self.script.stderr.len()
    }
}

fn take_chunk(source: &[u8], pos: &mut usize, chunk: usize, buf: &mut [u8]) -> usize {
    let end = (*pos + chunk).min(source.len());
    let n = (end - *pos).min(buf.len());
    buf[..n].copy_from_slice(&source[*pos..*pos + n]);
    *pos += n;
    n
}

impl RemoteProcess for ScriptedProcess {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.script.disconnect && self.drained() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "session dropped"));
        }
        Ok(take_chunk(&self.script.stdout, &mut self.stdout_pos, self.chunk, buf))
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(take_chunk(&self.script.stderr, &mut self.stderr_pos, self.chunk, buf))
    }

    fn is_eof(&self) -> bool {
        self.drained() && !self.script.disconnect
    }

    fn wait(self: Box<Self>) -> Result<i32> {
        Ok(self.script.status)
    }

    fn into_pipe(self: Box<Self>) -> Result<RemotePipe> {
        Err(Error::execution("scripted command has no pipe"))
    }
}

struct BridgeProcess {
    local: UnixStream,
}

impl RemoteProcess for BridgeProcess {
    fn read_stdout(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn read_stderr(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn is_eof(&self) -> bool {
        false
    }

    fn wait(self: Box<Self>) -> Result<i32> {
        Ok(0)
    }

    fn into_pipe(self: Box<Self>) -> Result<RemotePipe> {
        let reader = self.local.try_clone()?;
        let closer = self.local.try_clone()?;
        Ok(RemotePipe::new(
            Box::new(reader),
            Box::new(self.local),
            move || {
                let _ = closer.shutdown(std::net::Shutdown::Both);
            },
        ))
    }
}

pub struct FakeConnector {
    shell: Arc<FakeShell>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(shell: Arc<FakeShell>) -> Arc<Self> {
        Arc::new(Self {
            shell,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _host: &HostRecord) -> Result<Arc<dyn RemoteShell>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.shell.clone())
    }
}

#[derive(Default)]
pub struct RecordingEcho {
    lines: Mutex<Vec<EchoLine>>,
}

impl RecordingEcho {
    pub fn lines(&self) -> Vec<EchoLine> {
        self.lines
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

impl Echo for RecordingEcho {
    fn emit(&self, line: EchoLine) {
        self.lines
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(line);
    }
}

/// Engine service list held in memory. Creating a name that exists fails
/// like the real engine does.
#[derive(Default)]
pub struct MemoryServices {
    services: Mutex<Vec<ServiceRef>>,
    next_id: AtomicUsize,
    fail_create: Mutex<Option<String>>,
    fail_remove: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    definitions: Mutex<HashMap<String, ServiceDefinition>>,
}

impl MemoryServices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds a service, optionally labelled with a namespace.
    pub fn insert(&self, name: &str, namespace: Option<&str>) -> String {
        let mut labels = HashMap::new();
        if let Some(namespace) = namespace {
            labels.insert(
                swarmlink::constants::stack::NAMESPACE_LABEL.to_string(),
                namespace.to_string(),
            );
        }
        let id = format!("svc{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock_services().push(ServiceRef {
            id: id.clone(),
            name: name.to_string(),
            labels,
            image: Some("busybox".to_string()),
        });
        id
    }

    pub fn fail_create_of(&self, name: &str) {
        *self.fail_create.lock().unwrap_or_else(|err| err.into_inner()) = Some(name.to_string());
    }

    pub fn fail_remove_of(&self, name: &str) {
        *self.fail_remove.lock().unwrap_or_else(|err| err.into_inner()) = Some(name.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_services()
            .iter()
            .map(|service| service.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<ServiceRef> {
        self.lock_services()
            .iter()
            .find(|service| service.name == name)
            .cloned()
    }

    /// The last definition a service was created from.
    pub fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.definitions
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(name)
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn lock_services(&self) -> std::sync::MutexGuard<'_, Vec<ServiceRef>> {
        self.services.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(call);
    }
}

#[async_trait]
impl ServiceApi for MemoryServices {
    async fn list_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(self.lock_services().clone())
    }

    async fn create_service(&self, definition: &ServiceDefinition) -> Result<String> {
        self.record(format!("create {}", definition.name));
        let failing = self
            .fail_create
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        if failing.as_deref() == Some(definition.name.as_str()) {
            return Err(Error::Engine(format!("cannot create {}", definition.name)));
        }
        let mut services = self.lock_services();
        if services.iter().any(|service| service.name == definition.name) {
            return Err(Error::conflict(format!(
                "service {} already exists",
                definition.name
            )));
        }
        let id = format!("svc{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        services.push(ServiceRef {
            id: id.clone(),
            name: definition.name.clone(),
            labels: definition.labels.clone(),
            image: Some(definition.image.clone()),
        });
        self.definitions
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(definition.name.clone(), definition.clone());
        Ok(id)
    }

    async fn remove_service(&self, id: &str) -> Result<()> {
        let mut services = self.lock_services();
        let Some(pos) = services.iter().position(|service| service.id == id) else {
            return Err(Error::not_found(format!("service {}", id)));
        };
        self.record(format!("remove {}", services[pos].name));
        let failing = self
            .fail_remove
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        if failing.as_deref() == Some(services[pos].name.as_str()) {
            return Err(Error::Engine(format!("cannot remove {}", services[pos].name)));
        }
        services.remove(pos);
        Ok(())
    }
}

/// Secrets or configs held in memory, keyed by name.
#[derive(Default)]
pub struct MemoryObjects {
    objects: Mutex<Vec<(SwarmObject, Bytes)>>,
    next_id: AtomicUsize,
    fail_create: Mutex<Option<String>>,
    fail_remove: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryObjects {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, name: &str, data: &[u8]) -> String {
        let id = format!("obj{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock_objects().push((
            SwarmObject {
                id: id.clone(),
                name: name.to_string(),
                updated_at: None,
            },
            Bytes::copy_from_slice(data),
        ));
        id
    }

    pub fn fail_create_of(&self, name: &str) {
        *self.fail_create.lock().unwrap_or_else(|err| err.into_inner()) = Some(name.to_string());
    }

    pub fn fail_remove_of(&self, name: &str) {
        *self.fail_remove.lock().unwrap_or_else(|err| err.into_inner()) = Some(name.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_objects()
            .iter()
            .map(|(object, _)| object.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn data(&self, name: &str) -> Option<Bytes> {
        self.lock_objects()
            .iter()
            .find(|(object, _)| object.name == name)
            .map(|(_, data)| data.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, Vec<(SwarmObject, Bytes)>> {
        self.objects.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(call);
    }
}

#[async_trait]
impl ObjectApi for MemoryObjects {
    fn kind(&self) -> &'static str {
        "config"
    }

    async fn list(&self) -> Result<Vec<SwarmObject>> {
        Ok(self
            .lock_objects()
            .iter()
            .map(|(object, _)| object.clone())
            .collect())
    }

    async fn create(&self, name: &str, data: Bytes) -> Result<String> {
        self.record(format!("create {}", name));
        let failing = self
            .fail_create
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        if failing.as_deref() == Some(name) {
            return Err(Error::Engine(format!("cannot create {}", name)));
        }
        if self.lock_objects().iter().any(|(object, _)| object.name == name) {
            return Err(Error::conflict(format!("config {} already exists", name)));
        }
        Ok(self.insert(name, &data))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut objects = self.lock_objects();
        let Some(pos) = objects.iter().position(|(object, _)| object.id == id) else {
            return Err(Error::not_found(format!("config {}", id)));
        };
        let name = objects[pos].0.name.clone();
        self.record(format!("remove {}", name));
        let failing = self
            .fail_remove
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        if failing.as_deref() == Some(name.as_str()) {
            return Err(Error::Engine(format!("cannot remove {}", name)));
        }
        objects.remove(pos);
        Ok(())
    }
}
