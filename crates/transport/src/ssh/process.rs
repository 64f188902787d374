//! Session backend driving the OpenSSH client binary.
//!
//! Every command is a separate `ssh` process; connection reuse and
//! keepalives are left to the client. Processes are polled with
//! [`Child::try_wait`], so nothing here blocks the loop for long. Output is
//! read once the process has exited, which limits commands to what fits in
//! the pipe buffer; resource agent output is far below that.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;

use tracing::debug;

use super::session::{ShellConnector, ShellSession};
use crate::transport::NodeInfo;

/// Exit status `ssh` reports for its own failures.
const SSH_CONNECTION_ERROR: i32 = 255;

/// Builds [`ProcessSession`]s for the `ssh` client.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    program: PathBuf,
    user: String,
    identity: Option<PathBuf>,
    connect_timeout: Duration,
}

impl ProcessConnector {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("ssh"),
            user: user.into(),
            identity: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Use another client binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Authenticate with this private key.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-l".to_string(),
            self.user.clone(),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }
}

impl ShellConnector for ProcessConnector {
    type Session = ProcessSession;

    fn connect(&self, node: &NodeInfo) -> io::Result<ProcessSession> {
        if node.address.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("assembly '{}' has no address", node.name),
            ));
        }
        Ok(ProcessSession {
            program: self.program.clone(),
            options: self.options(),
            destination: node.address.clone(),
            keepalive: None,
            liveness: None,
        })
    }
}

/// A logical session: the client invocation every command shares.
#[derive(Debug)]
pub struct ProcessSession {
    program: PathBuf,
    options: Vec<String>,
    destination: String,
    keepalive: Option<Duration>,
    liveness: Option<Child>,
}

impl ProcessSession {
    fn command(&self, remote: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.options);
        if let Some(interval) = self.keepalive {
            command
                .arg("-o")
                .arg(format!("ServerAliveInterval={}", interval.as_secs().max(1)));
        }
        command.arg(&self.destination).arg("--").arg(remote);
        command
    }

    /// Run `true` on the node to find out if it accepts us.
    fn poll_liveness(&mut self) -> io::Result<()> {
        if self.liveness.is_none() {
            let child = self
                .command("true")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            self.liveness = Some(child);
        }
        let status = match self.liveness.as_mut() {
            Some(child) => child.try_wait()?,
            None => None,
        };
        match status {
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(status) => {
                self.liveness = None;
                match status.code() {
                    Some(0) => Ok(()),
                    Some(SSH_CONNECTION_ERROR) | None => Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("ssh to {} failed: {status}", self.destination),
                    )),
                    Some(_) => Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("ssh to {} rejected: {status}", self.destination),
                    )),
                }
            }
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.liveness.take() {
            reap(&mut child);
        }
    }
}

/// One remote command.
#[derive(Debug, Default)]
pub struct ProcessChannel {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    status: Option<ExitStatus>,
}

impl ProcessChannel {
    fn poll(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let Some(child) = self.child.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        match child.try_wait()? {
            Some(status) => {
                self.status = Some(status);
                Ok(status)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if self.status.is_none() {
            if let Some(mut child) = self.child.take() {
                reap(&mut child);
            }
        }
    }
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "ssh process already gone");
    }
    if let Err(e) = child.wait() {
        debug!(error = %e, "cannot reap ssh process");
    }
}

impl ShellSession for ProcessSession {
    type Channel = ProcessChannel;

    fn startup(&mut self) -> io::Result<()> {
        self.poll_liveness()
    }

    fn configure_keepalive(&mut self, _want_reply: bool, interval: Duration) {
        self.keepalive = Some(interval);
    }

    fn authenticate(&mut self) -> io::Result<()> {
        // BatchMode makes the startup check fail on any authentication prompt
        Ok(())
    }

    fn keepalive_send(&mut self) -> io::Result<Duration> {
        Ok(self.keepalive.unwrap_or(Duration::from_secs(15)))
    }

    fn open_channel(&mut self) -> io::Result<ProcessChannel> {
        Ok(ProcessChannel::default())
    }

    fn exec(&mut self, channel: &mut ProcessChannel, command: &str) -> io::Result<()> {
        let mut child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        channel.stdout = child.stdout.take();
        channel.child = Some(child);
        Ok(())
    }

    fn read(&mut self, channel: &mut ProcessChannel, buf: &mut [u8]) -> io::Result<usize> {
        channel.poll()?;
        match channel.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }

    fn send_eof(&mut self, _channel: &mut ProcessChannel) -> io::Result<()> {
        Ok(())
    }

    fn wait_eof(&mut self, channel: &mut ProcessChannel) -> io::Result<()> {
        channel.stdout = None;
        Ok(())
    }

    fn close(&mut self, _channel: &mut ProcessChannel) -> io::Result<()> {
        Ok(())
    }

    fn wait_closed(&mut self, channel: &mut ProcessChannel) -> io::Result<()> {
        channel.poll().map(|_| ())
    }

    fn exit_status(&mut self, channel: &mut ProcessChannel) -> io::Result<i32> {
        let status = channel.poll()?;
        status.code().ok_or_else(|| {
            io::Error::other(format!("remote command {status}"))
        })
    }
}
