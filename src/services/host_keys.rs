use crate::errors::{Error, Result};
use crate::services::settings::{HostKeyMode, Settings};
use crate::utils::fs_atomic::ensure_dir_for_file;
use base64::Engine;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Decides whether the key a server presented during the handshake is trusted.
pub trait HostKeyPolicy: Send + Sync {
    fn verify(&self, session: &Session, host: &str, port: u16) -> Result<()>;
}

/// Trusts every key. The fingerprint is logged so the decision stays auditable.
#[derive(Debug, Clone, Default)]
pub struct AcceptAny;

impl HostKeyPolicy for AcceptAny {
    fn verify(&self, session: &Session, host: &str, port: u16) -> Result<()> {
        let fingerprint = fingerprint_host_key_sha256(session);
        tracing::info!(
            host,
            port,
            fingerprint = fingerprint.as_deref().unwrap_or("unknown"),
            "accepting ssh host key without verification"
        );
        Ok(())
    }
}

/// Verifies against an OpenSSH known-hosts file. With `record_unknown`
/// set, first-seen hosts are appended instead of rejected.
#[derive(Debug, Clone)]
pub struct KnownHostsPolicy {
    path: PathBuf,
    record_unknown: bool,
}

impl KnownHostsPolicy {
    pub fn strict(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record_unknown: false,
        }
    }

    pub fn trust_on_first_use(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record_unknown: true,
        }
    }
}

impl HostKeyPolicy for KnownHostsPolicy {
    fn verify(&self, session: &Session, host: &str, port: u16) -> Result<()> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| Error::Protocol("server presented no host key".to_string()))?;
        let mut known = session
            .known_hosts()
            .map_err(|err| Error::Protocol(err.to_string()))?;
        if self.path.exists() {
            known
                .read_file(&self.path, KnownHostFileKind::OpenSSH)
                .map_err(|err| {
                    Error::HostKey(format!("cannot read {}: {}", self.path.display(), err))
                })?;
        }
        let check = known.check_port(host, port, key);
        match decide(check, self.record_unknown, host, &self.path)? {
            Decision::Trusted => Ok(()),
            Decision::Record => {
                known
                    .add(&known_hosts_entry(host, port), key, "added by swarmlink", key_type.into())
                    .map_err(|err| Error::HostKey(err.to_string()))?;
                ensure_dir_for_file(&self.path)?;
                known
                    .write_file(&self.path, KnownHostFileKind::OpenSSH)
                    .map_err(|err| {
                        Error::HostKey(format!("cannot write {}: {}", self.path.display(), err))
                    })?;
                tracing::warn!(
                    host,
                    port,
                    fingerprint = fingerprint_host_key_sha256(session).as_deref().unwrap_or("unknown"),
                    "recorded previously unknown ssh host key"
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Trusted,
    Record,
}

fn decide(check: CheckResult, record_unknown: bool, host: &str, path: &Path) -> Result<Decision> {
    match check {
        CheckResult::Match => Ok(Decision::Trusted),
        CheckResult::NotFound if record_unknown => Ok(Decision::Record),
        CheckResult::Mismatch => Err(Error::HostKey(format!(
            "key for {} does not match {}",
            host,
            path.display()
        ))),
        CheckResult::NotFound => Err(Error::HostKey(format!(
            "{} is not listed in {}",
            host,
            path.display()
        ))),
        CheckResult::Failure => Err(Error::HostKey(format!(
            "known-hosts lookup failed for {}",
            host
        ))),
    }
}

/// OpenSSH writes non-default ports as `[host]:port`.
fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

pub fn policy_for(settings: &Settings) -> Arc<dyn HostKeyPolicy> {
    match settings.host_key_mode {
        HostKeyMode::Accept => Arc::new(AcceptAny),
        HostKeyMode::Tofu => Arc::new(KnownHostsPolicy::trust_on_first_use(
            settings.known_hosts_path.clone(),
        )),
        HostKeyMode::KnownHosts => {
            Arc::new(KnownHostsPolicy::strict(settings.known_hosts_path.clone()))
        }
    }
}

pub fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn path() -> PathBuf {
        PathBuf::from("/home/ops/.ssh/known_hosts")
    }

    #[test]
    fn matching_keys_are_trusted_in_both_modes() {
        for record in [false, true] {
            let decision = decide(CheckResult::Match, record, "m1", &path()).expect("match");
            assert_eq!(decision, Decision::Trusted);
        }
    }

    #[test]
    fn mismatches_are_rejected_even_when_recording() {
        for record in [false, true] {
            let err = decide(CheckResult::Mismatch, record, "m1", &path()).expect_err("mismatch");
            assert_eq!(err.kind(), ErrorKind::HostKey);
            assert!(err.to_string().contains("does not match"), "{}", err);
        }
    }

    #[test]
    fn unknown_hosts_depend_on_mode() {
        let decision = decide(CheckResult::NotFound, true, "m1", &path()).expect("tofu");
        assert_eq!(decision, Decision::Record);

        let err = decide(CheckResult::NotFound, false, "m1", &path()).expect_err("strict");
        assert_eq!(err.kind(), ErrorKind::HostKey);
        assert!(err.to_string().contains("not listed"), "{}", err);
    }

    #[test]
    fn lookup_failures_are_rejected() {
        let err = decide(CheckResult::Failure, true, "m1", &path()).expect_err("failure");
        assert_eq!(err.kind(), ErrorKind::HostKey);
    }

    #[test]
    fn entries_bracket_non_default_ports() {
        assert_eq!(known_hosts_entry("m1.example.com", 22), "m1.example.com");
        assert_eq!(known_hosts_entry("m1.example.com", 2222), "[m1.example.com]:2222");
    }
}
