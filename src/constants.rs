pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const SSH_DEFAULT_USER: &str = "docker";
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
    pub const TIMEOUT_ENGINE_REQUEST_SECS: u64 = 120;
    /// libssh2 LIBSSH2_ERROR_EAGAIN.
    pub const SSH_ERROR_EAGAIN: i32 = -37;
}

pub mod tunnel {
    pub const REMOTE_SOCKET_PATH: &str = "/var/run/docker.sock";
    pub const HELPER_PROBE_COMMAND: &str = "socat -V";
    pub const HELPER_INSTALL_COMMANDS: &[&str] = &["sudo apk update", "sudo apk add socat"];
    pub const LOCAL_SOCKET_NAME: &str = "docker.sock";
    pub const LOCAL_DIR_PREFIX: &str = "swarmlink";
    pub const ENDPOINT_ENV_VAR: &str = "DOCKER_HOST";
    pub const POLL_INTERVAL_MS: u64 = 200;
    pub const IDLE_BACKOFF_MS: u64 = 5;
    pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;
}

pub mod stack {
    pub const NAMESPACE_LABEL: &str = "com.docker.stack.namespace";
    pub const DROPPED_SERVICE_KEYS: &[&str] = &["healthcheck", "deploy", "secrets", "ports"];
}

pub mod configs {
    /// Prints `docker config inspect` JSON for every config, nothing when there are none.
    pub const LIST_COMMAND: &str = "docker config ls -q | xargs -r docker config inspect";
    pub const TEMP_FILE_COMMAND: &str = "mktemp";
    /// Base64 characters per upload command, well under the exec argument limit.
    pub const UPLOAD_CHUNK_CHARS: usize = 48 * 1024;
    pub const BACKUP_KEY_PREFIX: &str = "swarms";
}
