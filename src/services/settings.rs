use crate::constants::{network, tunnel};
use crate::errors::{Error, Result};
use crate::utils::user_paths::expand_home_path;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyMode {
    /// Accept any key without prompting; the fingerprint is only logged.
    #[default]
    Accept,
    Tofu,
    /// Only keys already present in the known-hosts file.
    KnownHosts,
}

impl FromStr for HostKeyMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "accept" => Ok(HostKeyMode::Accept),
            "tofu" => Ok(HostKeyMode::Tofu),
            "known_hosts" | "known-hosts" | "reject" | "strict" => Ok(HostKeyMode::KnownHosts),
            other => Err(Error::Config(format!(
                "unknown host key policy '{}' (use accept, tofu or known_hosts)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListenMode {
    /// Fresh socket file under a private temp directory.
    #[default]
    Unix,
    Tcp(SocketAddr),
}

impl FromStr for ListenMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("unix") {
            return Ok(ListenMode::Unix);
        }
        let addr = trimmed.strip_prefix("tcp:").unwrap_or(trimmed);
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen address '{}'", raw)))?;
        if !addr.ip().is_loopback() {
            return Err(Error::Config(format!(
                "tunnel must listen on loopback, got {}",
                addr
            )));
        }
        Ok(ListenMode::Tcp(addr))
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ssh_user: String,
    pub ssh_port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub host_key_mode: HostKeyMode,
    pub known_hosts_path: PathBuf,
    pub remote_socket: String,
    pub helper_probe_command: String,
    pub helper_install_commands: Vec<String>,
    pub poll_interval_ms: u64,
    pub listen: ListenMode,
    pub engine_timeout_secs: u64,
    pub endpoint_env_var: String,
    /// Static `stack=dns` manager entries.
    pub hosts: Vec<String>,
    /// Root of the directory blob store holding config backups.
    pub backup_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_user: network::SSH_DEFAULT_USER.to_string(),
            ssh_port: network::SSH_DEFAULT_PORT,
            identity_file: None,
            connect_timeout_ms: network::TIMEOUT_SSH_READY_MS,
            keepalive_interval_ms: network::KEEPALIVE_INTERVAL_MS,
            host_key_mode: HostKeyMode::default(),
            known_hosts_path: expand_home_path("~/.ssh/known_hosts"),
            remote_socket: tunnel::REMOTE_SOCKET_PATH.to_string(),
            helper_probe_command: tunnel::HELPER_PROBE_COMMAND.to_string(),
            helper_install_commands: tunnel::HELPER_INSTALL_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            poll_interval_ms: tunnel::POLL_INTERVAL_MS,
            listen: ListenMode::default(),
            engine_timeout_secs: network::TIMEOUT_ENGINE_REQUEST_SECS,
            endpoint_env_var: tunnel::ENDPOINT_ENV_VAR.to_string(),
            hosts: Vec::new(),
            backup_dir: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Overlays `SWARMLINK_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(&format!("SWARMLINK_{}", name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(user) = read("SSH_USER") {
            self.ssh_user = user;
        }
        if let Some(port) = read("SSH_PORT") {
            self.ssh_port = parse_number(&port, "SWARMLINK_SSH_PORT")?;
        }
        if let Some(path) = read("IDENTITY_FILE") {
            // "autodetect" defers to the agent.
            self.identity_file = if path.eq_ignore_ascii_case("autodetect") {
                None
            } else {
                Some(expand_home_path(path))
            };
        }
        if let Some(ms) = read("CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_number(&ms, "SWARMLINK_CONNECT_TIMEOUT_MS")?;
        }
        if let Some(mode) = read("HOST_KEY_POLICY") {
            self.host_key_mode = mode.parse()?;
        }
        if let Some(path) = read("KNOWN_HOSTS") {
            self.known_hosts_path = expand_home_path(path);
        }
        if let Some(socket) = read("REMOTE_SOCKET") {
            self.remote_socket = socket;
        }
        if let Some(ms) = read("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_number(&ms, "SWARMLINK_POLL_INTERVAL_MS")?;
        }
        if let Some(listen) = read("LISTEN") {
            self.listen = listen.parse()?;
        }
        if let Some(hosts) = read("HOSTS") {
            self.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(dir) = read("BACKUP_DIR") {
            self.backup_dir = Some(expand_home_path(dir));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssh_user.trim().is_empty() {
            return Err(Error::Config("ssh_user must not be empty".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.remote_socket.trim().is_empty() {
            return Err(Error::Config("remote_socket must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Remote invocation that splices the control-plane socket onto stdio.
    pub fn bridge_command(&self) -> String {
        format!("socat UNIX-CONNECT:{} STDIO", self.remote_socket)
    }
}

fn parse_number<T: FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| Error::Config(format!("{} must be a positive integer", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overlay(pairs: &[(&str, &str)]) -> Result<Settings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut settings = Settings::default();
        settings.apply_env(|key| env.get(key).cloned())?;
        Ok(settings)
    }

    #[test]
    fn defaults_match_swarm_managers() {
        let settings = Settings::default();
        assert_eq!(settings.ssh_user, "docker");
        assert_eq!(settings.listen, ListenMode::Unix);
        assert_eq!(
            settings.bridge_command(),
            "socat UNIX-CONNECT:/var/run/docker.sock STDIO"
        );
    }

    #[test]
    fn env_overlay_parses_values() {
        let settings = overlay(&[
            ("SWARMLINK_SSH_USER", "ops"),
            ("SWARMLINK_HOST_KEY_POLICY", "tofu"),
            ("SWARMLINK_LISTEN", "tcp:127.0.0.1:23750"),
            ("SWARMLINK_IDENTITY_FILE", "autodetect"),
            ("SWARMLINK_HOSTS", "prod=m1.example.com, ,staging=m2.example.com"),
            ("SWARMLINK_BACKUP_DIR", "/var/backups/swarmlink"),
        ])
        .expect("settings");
        assert_eq!(settings.ssh_user, "ops");
        assert_eq!(settings.host_key_mode, HostKeyMode::Tofu);
        assert_eq!(
            settings.listen,
            ListenMode::Tcp("127.0.0.1:23750".parse().expect("addr"))
        );
        assert!(settings.identity_file.is_none());
        assert_eq!(
            settings.hosts,
            vec!["prod=m1.example.com", "staging=m2.example.com"]
        );
        assert_eq!(
            settings.backup_dir,
            Some(PathBuf::from("/var/backups/swarmlink"))
        );
        assert!(Settings::default().backup_dir.is_none());
    }

    #[test]
    fn host_key_mode_aliases() {
        for raw in ["known_hosts", "known-hosts", "reject", "Strict"] {
            assert_eq!(raw.parse::<HostKeyMode>().expect("mode"), HostKeyMode::KnownHosts);
        }
        assert_eq!(" accept ".parse::<HostKeyMode>().expect("mode"), HostKeyMode::Accept);
    }

    #[test]
    fn env_overlay_rejects_bad_values() {
        assert!(overlay(&[("SWARMLINK_HOST_KEY_POLICY", "maybe")]).is_err());
        assert!(overlay(&[("SWARMLINK_LISTEN", "tcp:0.0.0.0:23750")]).is_err());
        assert!(overlay(&[("SWARMLINK_POLL_INTERVAL_MS", "0")]).is_err());
    }
}
