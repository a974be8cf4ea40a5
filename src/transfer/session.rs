use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::QueueError;
use crate::config::{ActivationMethod, Config, EnvSource};
use crate::group::Destination;
use crate::transfer::sftp_like::{SftpLike, Ssh2Adapter};

/// How a session authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Public key; `None` tries the usual keys under `~/.ssh`.
    Key { username: String, private_key: Option<PathBuf> },
    Password { username: String, password: String },
}

impl Credential {
    pub fn username(&self) -> &str {
        match self {
            Credential::Key { username, .. } | Credential::Password { username, .. } => username,
        }
    }
}

// never print the password
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Key { username, private_key } => f
                .debug_struct("Key")
                .field("username", username)
                .field("private_key", private_key)
                .finish(),
            Credential::Password { username, .. } => {
                f.debug_struct("Password").field("username", username).finish_non_exhaustive()
            }
        }
    }
}

/// Resolves the credential for one scope.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, scope: &str, env: &dyn EnvSource) -> Result<Credential, QueueError>;
}

/// Key-based admin credentials. Per-scope variables win over the shared
/// defaults:
/// `ADMIN_<SCOPE>_VPS_USERNAME`, `DEFAULT_ADMIN_VPS_USERNAME`, `VPS_USERNAME` and
/// `ADMIN_<SCOPE>_SSH_PRIVATE_KEY_PATH`, `DEFAULT_ADMIN_SSH_KEY_PATH`, `SSH_KEY_PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdminKeys;

impl CredentialSource for AdminKeys {
    fn resolve(&self, scope: &str, env: &dyn EnvSource) -> Result<Credential, QueueError> {
        let username = env
            .var(&format!("ADMIN_{}_VPS_USERNAME", scope))
            .or_else(|| env.var("DEFAULT_ADMIN_VPS_USERNAME"))
            .or_else(|| env.var("VPS_USERNAME"))
            .ok_or_else(|| QueueError::MissingCredential(scope.to_string(), "VPS username".into()))?;
        let private_key = env
            .var(&format!("ADMIN_{}_SSH_PRIVATE_KEY_PATH", scope))
            .or_else(|| env.var("DEFAULT_ADMIN_SSH_KEY_PATH"))
            .or_else(|| env.var("SSH_KEY_PATH"))
            .map(|p| expand_home(p.trim()));
        if let Some(p) = &private_key
            && !p.exists()
        {
            return Err(QueueError::MissingCredential(
                scope.to_string(),
                format!("private key {} not found", p.display()),
            ));
        }
        Ok(Credential::Key { username, private_key })
    }
}

/// One username and password shared by every destination.
#[derive(Clone)]
pub struct SharedPassword {
    username: String,
    password: String,
}

impl SharedPassword {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        SharedPassword { username: username.into(), password: password.into() }
    }
}

impl CredentialSource for SharedPassword {
    fn resolve(&self, _scope: &str, _env: &dyn EnvSource) -> Result<Credential, QueueError> {
        Ok(Credential::Password { username: self.username.clone(), password: self.password.clone() })
    }
}

fn expand_home(p: &str) -> PathBuf {
    if let Some(rest) = p.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(p)
}

/// Opens an authenticated remote for one destination.
pub trait Connector: Send + Sync {
    fn connect(&self, dest: &Destination, cred: &Credential) -> Result<Box<dyn SftpLike>, QueueError>;
}

/// Real SSH/SFTP connector built on `ssh2`.
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
    io_timeout: Duration,
    method: ActivationMethod,
}

impl Ssh2Connector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration, method: ActivationMethod) -> Self {
        Ssh2Connector { connect_timeout, io_timeout, method }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            Duration::from_secs(cfg.connect_timeout_secs),
            Duration::from_secs(cfg.io_timeout_secs),
            cfg.activation_method,
        )
    }

    fn create_tcp_connection(&self, addr: &str) -> Result<TcpStream, QueueError> {
        let sock = addr
            .to_socket_addrs()
            .map_err(|_| QueueError::SshNoAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| QueueError::SshNoAddress(addr.to_string()))?;
        let tcp = TcpStream::connect_timeout(&sock, self.connect_timeout)
            .map_err(|e| QueueError::SshConnectFailed(addr.to_string(), e.to_string()))?;
        let _ = tcp.set_read_timeout(Some(self.io_timeout));
        let _ = tcp.set_write_timeout(Some(self.io_timeout));
        Ok(tcp)
    }
}

// try the usual key files in ~/.ssh
fn try_default_keys(sess: &ssh2::Session, username: &str) -> bool {
    if let Some(home_p) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let p = home_p.join(".ssh").join(name);
            if p.exists() {
                let _ = sess.userauth_pubkey_file(username, None, &p, None);
                if sess.authenticated() {
                    return true;
                }
            }
        }
    }
    false
}

fn authenticate(sess: &ssh2::Session, cred: &Credential) -> bool {
    match cred {
        Credential::Key { username, private_key: Some(key) } => {
            let _ = sess.userauth_pubkey_file(username, None, Path::new(key), None);
            sess.authenticated()
        }
        Credential::Key { username, private_key: None } => try_default_keys(sess, username),
        Credential::Password { username, password } => {
            let _ = sess.userauth_password(username, password);
            sess.authenticated()
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, dest: &Destination, cred: &Credential) -> Result<Box<dyn SftpLike>, QueueError> {
        let addr = dest.addr();
        let tcp = self.create_tcp_connection(&addr)?;
        let mut sess =
            ssh2::Session::new().map_err(|_| QueueError::SshSessionCreateFailed(addr.clone()))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(u32::try_from(self.io_timeout.as_millis()).unwrap_or(u32::MAX));
        sess.handshake().map_err(|_| QueueError::SshHandshakeFailed(addr.clone()))?;
        if !authenticate(&sess, cred) {
            return Err(QueueError::SshAuthFailed(format!("{}@{}", cred.username(), addr)));
        }
        let sftp = sess.sftp().map_err(|e| QueueError::SftpCreateFailed(addr.clone(), e.to_string()))?;
        tracing::debug!("[session] connected to {} as {}", dest, cred.username());
        Ok(Box::new(Ssh2Adapter::new(sess, sftp, self.method)))
    }
}

/// One authenticated channel to one destination. Teardown runs on drop,
/// whatever path the group took.
pub struct TransferSession {
    destination: Destination,
    remote: Box<dyn SftpLike>,
}

impl TransferSession {
    pub fn open(
        connector: &dyn Connector,
        destination: &Destination,
        cred: &Credential,
    ) -> Result<Self, QueueError> {
        let remote = connector.connect(destination, cred)?;
        Ok(TransferSession { destination: destination.clone(), remote })
    }

    pub fn remote(&self) -> &dyn SftpLike {
        self.remote.as_ref()
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.remote.shutdown();
        tracing::debug!("[session] closed {}", self.destination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn scoped_admin_username_wins() {
        let e = env(&[
            ("ADMIN_SITE1_VPS_USERNAME", "deploy"),
            ("DEFAULT_ADMIN_VPS_USERNAME", "admin"),
            ("VPS_USERNAME", "ops"),
        ]);
        let c = AdminKeys.resolve("SITE1", &e).unwrap();
        assert_eq!(c, Credential::Key { username: "deploy".into(), private_key: None });
        let c = AdminKeys.resolve("SHOP", &e).unwrap();
        assert_eq!(c.username(), "admin");
    }

    #[test]
    fn missing_username_is_a_credential_error() {
        let err = AdminKeys.resolve("SITE1", &env(&[])).unwrap_err();
        assert!(matches!(err, QueueError::MissingCredential(ref s, _) if s == "SITE1"));
        assert!(err.is_group_fatal());
    }

    #[test]
    fn missing_key_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_test");
        let key_s = key.to_string_lossy().to_string();
        let e = env(&[("VPS_USERNAME", "ops"), ("SSH_KEY_PATH", key_s.as_str())]);
        assert!(AdminKeys.resolve("S", &e).is_err());
        std::fs::write(&key, b"k").unwrap();
        assert_eq!(
            AdminKeys.resolve("S", &e).unwrap(),
            Credential::Key { username: "ops".into(), private_key: Some(key) }
        );
    }

    #[test]
    fn debug_hides_password() {
        let c = SharedPassword::new("bob", "hunter2").resolve("X", &env(&[])).unwrap();
        assert!(!format!("{:?}", c).contains("hunter2"));
    }
}
