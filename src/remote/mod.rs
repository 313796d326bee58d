//! Remote host access.
//!
//! The core only needs three things from the repository host: run a shell
//! command, copy a file down and copy a file up. [`RemoteChannel`] captures
//! exactly that, and [`Connector`] opens a fresh channel on demand so every
//! package transfer gets its own connection.

mod key;
mod ssh;

use anyhow::Result;
use std::io::{Read, Write};

pub use key::is_encrypted_key;
pub use ssh::{SshChannel, SshConnector};

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    /// Empty when the channel merges error output into `stdout`.
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Text explaining a failure: `stderr`, or `stdout` when nothing was
    /// written to `stderr` separately.
    pub fn error_text(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// An open session on the repository host.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteChannel: Send {
    /// Run `command` through the remote shell and wait for it to exit.
    fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Stream the remote file at `remote_path` into `dest`. Returns the byte count.
    fn download(&mut self, remote_path: &str, dest: &mut dyn Write) -> Result<u64>;

    /// Stream `size` bytes from `source` to `remote_path`, created with `mode`.
    fn upload(&mut self, source: &mut dyn Read, size: u64, remote_path: &str, mode: i32)
    -> Result<()>;
}

/// Opens channels to the repository host.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteChannel>>;
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@%,=".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Join remote path segments with `/`.
pub fn remote_join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}
