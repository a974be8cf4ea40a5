use std::io::Read;
use std::path::Path;

use crate::config::ActivationMethod;

/// Remote filesystem operations the activation protocol needs. Writers are
/// boxed so tests can substitute an in-memory remote. Implementors must be
/// Send so a session can move onto a host worker thread.
pub trait SftpLike: Send {
    fn mkdir(&self, p: &Path, mode: i32) -> Result<(), String>;
    fn create_write(&self, p: &Path) -> Result<Box<dyn std::io::Write + Send + '_>, String>;
    fn remove_file(&self, p: &Path) -> Result<(), String>;
    fn rmdir(&self, p: &Path) -> Result<(), String>;
    /// Atomically rename a staged directory to its final name. Must fail if
    /// `to` already exists.
    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), String>;
    /// Close the channel, then the connection. Called once on teardown.
    fn shutdown(&mut self) {}
}

/// Owns the SSH session and its SFTP channel for one destination.
pub struct Ssh2Adapter {
    sftp: Option<ssh2::Sftp>,
    session: ssh2::Session,
    method: ActivationMethod,
}

impl Ssh2Adapter {
    pub fn new(session: ssh2::Session, sftp: ssh2::Sftp, method: ActivationMethod) -> Self {
        Ssh2Adapter { sftp: Some(sftp), session, method }
    }

    fn sftp(&self) -> Result<&ssh2::Sftp, String> {
        self.sftp.as_ref().ok_or_else(|| "SFTP channel already closed".to_string())
    }

    // `mv` over an exec channel; the exit status decides, stderr becomes the message
    fn exec_rename(&self, from: &Path, to: &Path) -> Result<(), String> {
        let cmd = mv_command(from, to);
        let mut channel = self.session.channel_session().map_err(|e| e.to_string())?;
        channel.exec(&cmd).map_err(|e| e.to_string())?;
        let mut out = String::new();
        let _ = channel.read_to_string(&mut out);
        let mut err = String::new();
        let _ = channel.stderr().read_to_string(&mut err);
        channel.wait_close().map_err(|e| e.to_string())?;
        let status = channel.exit_status().map_err(|e| e.to_string())?;
        if status == 0 {
            Ok(())
        } else {
            let msg = err.trim();
            Err(if msg.is_empty() {
                format!("mv exited with status {}", status)
            } else {
                format!("mv exited with status {}: {}", status, msg)
            })
        }
    }
}

// -T: fail instead of moving `from` inside an existing `to`
fn mv_command(from: &Path, to: &Path) -> String {
    format!(
        "mv -T -- {} {}",
        shell_escape::unix::escape(from.to_string_lossy()),
        shell_escape::unix::escape(to.to_string_lossy())
    )
}

impl SftpLike for Ssh2Adapter {
    fn mkdir(&self, p: &Path, mode: i32) -> Result<(), String> {
        self.sftp()?.mkdir(p, mode).map_err(|e| e.to_string())
    }

    fn create_write(&self, p: &Path) -> Result<Box<dyn std::io::Write + Send + '_>, String> {
        match self.sftp()?.create(p) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn remove_file(&self, p: &Path) -> Result<(), String> {
        self.sftp()?.unlink(p).map_err(|e| e.to_string())
    }

    fn rmdir(&self, p: &Path) -> Result<(), String> {
        self.sftp()?.rmdir(p).map_err(|e| e.to_string())
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), String> {
        match self.method {
            ActivationMethod::Exec => self.exec_rename(from, to),
            // no OVERWRITE flag: an existing target is an error
            ActivationMethod::Sftp => self
                .sftp()?
                .rename(from, to, Some(ssh2::RenameFlags::ATOMIC | ssh2::RenameFlags::NATIVE))
                .map_err(|e| e.to_string()),
        }
    }

    fn shutdown(&mut self) {
        drop(self.sftp.take());
        if let Err(e) = self.session.disconnect(None, "hostqueue session closed", None) {
            tracing::debug!("[session] disconnect: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mv_command_leaves_plain_paths_unquoted() {
        assert_eq!(
            mv_command(Path::new("/srv/queue/tmp_job_1_alice_site1.alic"), Path::new("/srv/queue/job_1_alice_site1.alic")),
            "mv -T -- /srv/queue/tmp_job_1_alice_site1.alic /srv/queue/job_1_alice_site1.alic"
        );
    }

    #[test]
    fn mv_command_quotes_spaces_and_quotes() {
        assert_eq!(mv_command(Path::new("/q/tmp_a b"), Path::new("/q/a b")), "mv -T -- '/q/tmp_a b' '/q/a b'");
        assert_eq!(
            mv_command(Path::new("/q/tmp_it's"), Path::new("/q/it's; rm -rf /")),
            r#"mv -T -- '/q/tmp_it'\''s' '/q/it'\''s; rm -rf /'"#
        );
    }
}
