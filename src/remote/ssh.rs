use anyhow::{Context, Result, bail};
use log::debug;
use ssh2::{ExtendedData, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use super::{CommandOutput, Connector, RemoteChannel};
use crate::deadline::Deadline;
use crate::runtime::Runtime;
use crate::settings::ServerSettings;

/// Opens authenticated SSH sessions with a private key.
pub struct SshConnector {
    settings: ServerSettings,
    deadline: Deadline,
}

impl SshConnector {
    /// Fails early when the private key cannot be read.
    pub fn new<R: Runtime>(runtime: &R, settings: &ServerSettings) -> Result<Self> {
        runtime
            .read(&settings.key_path)
            .with_context(|| format!("Failed to read SSH key {:?}", settings.key_path))?;
        Ok(Self {
            settings: settings.clone(),
            deadline: Deadline::none(),
        })
    }

    /// Bound every connection attempt by the time left before `deadline`.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// The configured connect timeout, shortened to what the deadline leaves.
    fn connect_timeout(&self) -> Result<Duration> {
        self.deadline.check("Connect to SSH server")?;
        Ok(match self.deadline.remaining() {
            Some(left) => left.min(self.settings.timeout),
            None => self.settings.timeout,
        })
    }
}

impl Connector for SshConnector {
    #[tracing::instrument(skip(self))]
    fn connect(&self) -> Result<Box<dyn RemoteChannel>> {
        let timeout = self.connect_timeout()?;
        Ok(Box::new(SshChannel::open(&self.settings, timeout)?))
    }
}

/// One authenticated SSH session.
pub struct SshChannel {
    session: Session,
}

impl SshChannel {
    pub fn open(settings: &ServerSettings, timeout: Duration) -> Result<Self> {
        let address = settings.address();
        let socket = address
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", address))?
            .next()
            .with_context(|| format!("No address found for {}", address))?;

        let tcp = TcpStream::connect_timeout(&socket, timeout)
            .with_context(|| format!("Failed to connect to SSH server {}", address))?;

        let mut session = Session::new().context("Failed to create SSH session")?;
        session.set_tcp_stream(tcp);
        session.handshake().context("SSH handshake failed")?;
        // Host keys are not checked against known_hosts.
        debug!("Connected to {}, host key not verified", address);

        session
            .userauth_pubkey_file(
                &settings.user,
                None,
                &settings.key_path,
                settings.key_passphrase.as_deref(),
            )
            .with_context(|| format!("SSH authentication failed for user {}", settings.user))?;
        if !session.authenticated() {
            bail!("SSH authentication failed for user {}", settings.user);
        }

        Ok(Self { session })
    }
}

impl RemoteChannel for SshChannel {
    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        debug!("exec: {}", command);
        let mut channel = self
            .session
            .channel_session()
            .context("Can't create SSH session")?;
        // stderr shares the stdout stream so neither can stall the other.
        channel
            .handle_extended_data(ExtendedData::Merge)
            .context("Failed to merge command error output")?;
        channel
            .exec(command)
            .with_context(|| format!("Failed to execute {:?}", command))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .context("Failed to read command output")?;

        channel.wait_close().context("Failed to close SSH channel")?;
        let exit_status = channel.exit_status().context("Missing exit status")?;

        Ok(CommandOutput {
            exit_status,
            stdout,
            stderr: String::new(),
        })
    }

    fn download(&mut self, remote_path: &str, dest: &mut dyn Write) -> Result<u64> {
        let (mut remote, stat) = self
            .session
            .scp_recv(Path::new(remote_path))
            .with_context(|| format!("Failed to start download of {}", remote_path))?;
        debug!("downloading {} ({} bytes)", remote_path, stat.size());

        let copied = std::io::copy(&mut remote, dest)
            .with_context(|| format!("Failed to download {}", remote_path))?;

        remote.send_eof()?;
        remote.wait_eof()?;
        remote.close()?;
        remote.wait_close()?;
        Ok(copied)
    }

    fn upload(
        &mut self,
        source: &mut dyn Read,
        size: u64,
        remote_path: &str,
        mode: i32,
    ) -> Result<()> {
        let mut remote = self
            .session
            .scp_send(Path::new(remote_path), mode, size, None)
            .with_context(|| format!("Failed to start upload to {}", remote_path))?;

        let copied = std::io::copy(source, &mut remote)
            .with_context(|| format!("Failed to upload {}", remote_path))?;
        debug!("uploaded {} bytes to {}", copied, remote_path);

        remote.send_eof()?;
        remote.wait_eof()?;
        remote.close()?;
        remote.wait_close()?;
        Ok(())
    }
}
