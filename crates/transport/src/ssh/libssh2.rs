//! Session backend on libssh2, one non-blocking session per node.
//!
//! libssh2 reports `EAGAIN` as [`io::ErrorKind::WouldBlock`] when its errors
//! are converted to [`io::Error`], which is exactly what the step machines
//! expect.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use ssh2::{Channel, Session};

use super::session::{ShellConnector, ShellSession};
use crate::transport::NodeInfo;

const SSH_PORT: u16 = 22;

/// Opens libssh2 sessions authenticated with a key pair.
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    user: String,
    private_key: PathBuf,
    public_key: Option<PathBuf>,
    connect_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(user: impl Into<String>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            private_key: private_key.into(),
            public_key: None,
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn with_public_key(mut self, public_key: impl Into<PathBuf>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    /// Bound on a single TCP connection attempt. The attempt blocks.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    (address, SSH_PORT)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {address}")))
}

impl ShellConnector for Ssh2Connector {
    type Session = Ssh2Session;

    fn connect(&self, node: &NodeInfo) -> io::Result<Ssh2Session> {
        let addr = resolve(&node.address)?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        tcp.set_nonblocking(true)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_blocking(false);
        Ok(Ssh2Session {
            session,
            user: self.user.clone(),
            private_key: self.private_key.clone(),
            public_key: self.public_key.clone(),
        })
    }
}

/// A live libssh2 session.
pub struct Ssh2Session {
    session: Session,
    user: String,
    private_key: PathBuf,
    public_key: Option<PathBuf>,
}

impl ShellSession for Ssh2Session {
    type Channel = Channel;

    fn startup(&mut self) -> io::Result<()> {
        Ok(self.session.handshake()?)
    }

    fn configure_keepalive(&mut self, want_reply: bool, interval: Duration) {
        let secs = u32::try_from(interval.as_secs()).unwrap_or(u32::MAX);
        self.session.set_keepalive(want_reply, secs);
    }

    fn authenticate(&mut self) -> io::Result<()> {
        Ok(self.session.userauth_pubkey_file(
            &self.user,
            self.public_key.as_deref(),
            &self.private_key,
            None,
        )?)
    }

    fn keepalive_send(&mut self) -> io::Result<Duration> {
        let secs = self.session.keepalive_send()?;
        Ok(Duration::from_secs(u64::from(secs)))
    }

    fn open_channel(&mut self) -> io::Result<Channel> {
        Ok(self.session.channel_session()?)
    }

    fn exec(&mut self, channel: &mut Channel, command: &str) -> io::Result<()> {
        Ok(channel.exec(command)?)
    }

    fn read(&mut self, channel: &mut Channel, buf: &mut [u8]) -> io::Result<usize> {
        channel.read(buf)
    }

    fn send_eof(&mut self, channel: &mut Channel) -> io::Result<()> {
        Ok(channel.send_eof()?)
    }

    fn wait_eof(&mut self, channel: &mut Channel) -> io::Result<()> {
        Ok(channel.wait_eof()?)
    }

    fn close(&mut self, channel: &mut Channel) -> io::Result<()> {
        Ok(channel.close()?)
    }

    fn wait_closed(&mut self, channel: &mut Channel) -> io::Result<()> {
        Ok(channel.wait_close()?)
    }

    fn exit_status(&mut self, channel: &mut Channel) -> io::Result<i32> {
        Ok(channel.exit_status()?)
    }
}
