//! Non-blocking remote shell sessions.
//!
//! Every call either makes progress or fails with
//! [`std::io::ErrorKind::WouldBlock`], in which case the caller tries the
//! same call again later. Any other error is final for the step.

use std::io;
use std::time::Duration;

use crate::transport::NodeInfo;

/// Opens sessions to nodes.
pub trait ShellConnector {
    type Session: ShellSession;

    /// Open the transport stream to `node`. A refused or unreachable node is
    /// an error; the caller retries later.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the connection attempt.
    fn connect(&self, node: &NodeInfo) -> io::Result<Self::Session>;
}

/// One authenticated shell session and the channels running on it.
#[allow(clippy::missing_errors_doc)]
pub trait ShellSession {
    type Channel;

    /// Protocol handshake.
    fn startup(&mut self) -> io::Result<()>;

    /// Ask the session to send keepalives every `interval`.
    fn configure_keepalive(&mut self, want_reply: bool, interval: Duration);

    fn authenticate(&mut self) -> io::Result<()>;

    /// Send a keepalive if one is due. Returns the time until the next one.
    fn keepalive_send(&mut self) -> io::Result<Duration>;

    fn open_channel(&mut self) -> io::Result<Self::Channel>;

    fn exec(&mut self, channel: &mut Self::Channel, command: &str) -> io::Result<()>;

    /// Read command output. `Ok(0)` once the output is exhausted.
    fn read(&mut self, channel: &mut Self::Channel, buf: &mut [u8]) -> io::Result<usize>;

    fn send_eof(&mut self, channel: &mut Self::Channel) -> io::Result<()>;

    fn wait_eof(&mut self, channel: &mut Self::Channel) -> io::Result<()>;

    fn close(&mut self, channel: &mut Self::Channel) -> io::Result<()>;

    fn wait_closed(&mut self, channel: &mut Self::Channel) -> io::Result<()>;

    /// Exit status of the remote command, valid once the channel closed.
    fn exit_status(&mut self, channel: &mut Self::Channel) -> io::Result<i32>;
}
