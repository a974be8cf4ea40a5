/// Structured failures of the queueing pipeline.
///
/// Every variant carries the subject it applies to (artifact filename,
/// credential scope or remote address) so the run report can name it without
/// extra bookkeeping. Classification helpers below decide how far a failure
/// reaches: one artifact, one job, or a whole host group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    // configuration: fatal to one artifact or one destination
    NoBinding(String),
    MissingRemotePath(String),
    MissingIdentity(String),
    HostUnresolved(String),
    PortInvalid(String, String),
    MissingCredential(String, String),
    // connection / authentication: fatal to a host group
    SshNoAddress(String),
    SshConnectFailed(String, String),
    SshSessionCreateFailed(String),
    SshHandshakeFailed(String),
    SshAuthFailed(String),
    SftpCreateFailed(String, String),
    // staging steps: fatal to a single job
    CreateTempDirFailed(String, String),
    MetaUploadFailed(String, String),
    PayloadUploadFailed(String, String),
    ActivateFailed(String, String),
    // local filesystem: logged only
    StageMoveFailed(String, String),
    LocalIo(String, String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use QueueError::*;
        match self {
            NoBinding(name) => write!(f, "no site binding matches '{}'", name),
            MissingRemotePath(name) => {
                write!(f, "no remote install path (wp_path) resolved for '{}'", name)
            }
            MissingIdentity(name) => write!(
                f,
                "no author identity resolved for '{}' (site wp_author and default_user_author are both empty)",
                name
            ),
            HostUnresolved(scope) => write!(f, "{}_VPS_HOST is not set", scope),
            PortInvalid(scope, raw) => write!(f, "{}_VPS_PORT is missing or invalid: '{}'", scope, raw),
            MissingCredential(scope, what) => write!(f, "missing credential for {}: {}", scope, what),
            SshNoAddress(addr) => write!(f, "cannot resolve address: {}", addr),
            SshConnectFailed(addr, msg) => write!(f, "cannot connect to {}: {}", addr, msg),
            SshSessionCreateFailed(addr) => write!(f, "cannot create SSH session: {}", addr),
            SshHandshakeFailed(addr) => write!(f, "SSH handshake failed: {}", addr),
            SshAuthFailed(addr) => write!(f, "SSH authentication failed: {}", addr),
            SftpCreateFailed(addr, msg) => write!(f, "cannot open SFTP channel on {}: {}", addr, msg),
            CreateTempDirFailed(path, msg) => {
                write!(f, "cannot create remote job directory {}: {}", path, msg)
            }
            MetaUploadFailed(path, msg) => write!(f, "metadata upload to {} failed: {}", path, msg),
            PayloadUploadFailed(path, msg) => write!(f, "payload upload to {} failed: {}", path, msg),
            ActivateFailed(path, msg) => write!(f, "job activation of {} failed: {}", path, msg),
            StageMoveFailed(name, msg) => write!(f, "cannot move '{}' into staging: {}", name, msg),
            LocalIo(path, msg) => write!(f, "local I/O error on {}: {}", path, msg),
        }
    }
}

impl std::error::Error for QueueError {}

impl QueueError {
    /// Connection and authentication failures take down every job routed to
    /// the same destination; nothing was created remotely, so nothing is
    /// cleaned up.
    pub fn is_group_fatal(&self) -> bool {
        use QueueError::*;
        matches!(
            self,
            SshNoAddress(_)
                | SshConnectFailed(_, _)
                | SshSessionCreateFailed(_)
                | SshHandshakeFailed(_)
                | SshAuthFailed(_)
                | SftpCreateFailed(_, _)
                | MissingCredential(_, _)
        )
    }

    /// Whether a job failing with this error may have left entries inside its
    /// `tmp_` directory. Temp directory creation failures leave nothing behind.
    pub fn needs_remote_cleanup(&self) -> bool {
        use QueueError::*;
        matches!(self, MetaUploadFailed(_, _) | PayloadUploadFailed(_, _) | ActivateFailed(_, _))
    }

    /// Configuration problems are reported per artifact and never touch the network.
    pub fn is_configuration(&self) -> bool {
        use QueueError::*;
        matches!(
            self,
            NoBinding(_)
                | MissingRemotePath(_)
                | MissingIdentity(_)
                | HostUnresolved(_)
                | PortInvalid(_, _)
        )
    }

    /// Stable variant name used in the JSON Lines failure log.
    pub fn variant(&self) -> &'static str {
        use QueueError::*;
        match self {
            NoBinding(_) => "NoBinding",
            MissingRemotePath(_) => "MissingRemotePath",
            MissingIdentity(_) => "MissingIdentity",
            HostUnresolved(_) => "HostUnresolved",
            PortInvalid(_, _) => "PortInvalid",
            MissingCredential(_, _) => "MissingCredential",
            SshNoAddress(_) => "SshNoAddress",
            SshConnectFailed(_, _) => "SshConnectFailed",
            SshSessionCreateFailed(_) => "SshSessionCreateFailed",
            SshHandshakeFailed(_) => "SshHandshakeFailed",
            SshAuthFailed(_) => "SshAuthFailed",
            SftpCreateFailed(_, _) => "SftpCreateFailed",
            CreateTempDirFailed(_, _) => "CreateTempDirFailed",
            MetaUploadFailed(_, _) => "MetaUploadFailed",
            PayloadUploadFailed(_, _) => "PayloadUploadFailed",
            ActivateFailed(_, _) => "ActivateFailed",
            StageMoveFailed(_, _) => "StageMoveFailed",
            LocalIo(_, _) => "LocalIo",
        }
    }
}
