//! Connection parameters for the repository host.
//!
//! Built once at process start and handed to the package manager; nothing in
//! the core reads the environment itself.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::remote::remote_join;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub key_passphrase: Option<String>,
    /// Remote directory holding one sub-directory per package.
    pub root_dir: String,
    /// Deadline for a whole publish or update invocation; also bounds the TCP connect.
    pub timeout: Duration,
}

impl ServerSettings {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `<root_dir>/<package>`
    pub fn package_dir(&self, package: &str) -> String {
        remote_join(&self.root_dir, package)
    }
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("key_path", &self.key_path)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "********"),
            )
            .field("root_dir", &self.root_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ServerSettings {
        ServerSettings {
            host: "repo.internal".into(),
            port: 2222,
            user: "deploy".into(),
            key_path: PathBuf::from("/keys/id_ed25519"),
            key_passphrase: Some("hunter2".into()),
            root_dir: "/srv/packages/".into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[test]
    fn test_address_and_package_dir() {
        let s = settings();
        assert_eq!(s.address(), "repo.internal:2222");
        assert_eq!(s.package_dir("packet-1"), "/srv/packages/packet-1");
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let debug = format!("{:?}", settings());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("********"));
    }
}
