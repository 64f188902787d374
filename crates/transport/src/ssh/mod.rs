//! Remote shell transport.
//!
//! Connecting and every command execution are step machines driven by
//! [`Wakeup`]s. A step that would block is deferred and tried again; any
//! other failure ends the machine. Each command runs under its own timer;
//! a command outliving it means the node stopped answering, so every
//! command on the node is dropped and the node is reported failed.

mod command;
#[cfg(feature = "libssh2")]
pub mod libssh2;
mod process;
mod session;

use std::collections::BTreeMap;
use std::time::Duration;

use cape_core::{OcfExitCode, OpHandle, RecoveryState};
use cape_mainloop::{Priority, TimerId};
use tracing::{debug, info, warn};

pub use command::{ExitMapping, HEALTHCHECK_COMMAND, OCF_ROOT, render};
pub use process::{ProcessChannel, ProcessConnector, ProcessSession};
pub use session::{ShellConnector, ShellSession};

use crate::error::would_block;
use crate::transport::{NodeInfo, Transport, TransportContext, TransportFactory, Wakeup};

/// Default time a single command may take.
pub const EXEC_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default keepalive interval asked of the session.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Default period of the liveness check.
pub const HEALTHCHECK_INTERVAL: Duration = Duration::from_millis(3000);
/// Pause before retrying a refused connection.
pub const CONNECT_RETRY: Duration = Duration::from_millis(1000);

const READ_CHUNK: usize = 4096;

/// Timing knobs of the remote shell transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub exec_timeout: Duration,
    pub keepalive_interval: Duration,
    pub healthcheck_interval: Duration,
    pub connect_retry: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            exec_timeout: EXEC_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            healthcheck_interval: HEALTHCHECK_INTERVAL,
            connect_retry: CONNECT_RETRY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStep {
    Idle,
    Connect,
    Startup,
    KeepaliveConfig,
    Authenticate,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecStep {
    OpenChannel,
    Exec,
    Read,
    SendEof,
    WaitEof,
    Close,
    WaitClosed,
    Free,
}

impl ExecStep {
    const fn next(self) -> Self {
        match self {
            Self::OpenChannel => Self::Exec,
            Self::Exec => Self::Read,
            Self::Read => Self::SendEof,
            Self::SendEof => Self::WaitEof,
            Self::WaitEof => Self::Close,
            Self::Close => Self::WaitClosed,
            Self::WaitClosed | Self::Free => Self::Free,
        }
    }
}

enum Purpose {
    Action { op: OpHandle, mapping: ExitMapping },
    Healthcheck,
}

struct ShellExec<Ch> {
    purpose: Purpose,
    command: String,
    step: ExecStep,
    channel: Option<Ch>,
    output: Vec<u8>,
    status: Option<i32>,
    failed: bool,
    timer: Option<TimerId>,
}

type ChannelOf<C> = <<C as ShellConnector>::Session as ShellSession>::Channel;

/// Runs resource actions as shell commands over a [`ShellSession`].
pub struct SshTransport<C: ShellConnector> {
    node: NodeInfo,
    config: SshConfig,
    connector: C,
    session: Option<C::Session>,
    link: LinkStep,
    execs: BTreeMap<u64, ShellExec<ChannelOf<C>>>,
    next_exec: u64,
    connect_timer: Option<TimerId>,
    keepalive_timer: Option<TimerId>,
    healthcheck_timer: Option<TimerId>,
    healthcheck_running: bool,
}

impl<C: ShellConnector> SshTransport<C> {
    pub fn new(node: NodeInfo, connector: C, config: SshConfig) -> Self {
        Self {
            node,
            config,
            connector,
            session: None,
            link: LinkStep::Idle,
            execs: BTreeMap::new(),
            next_exec: 0,
            connect_timer: None,
            keepalive_timer: None,
            healthcheck_timer: None,
            healthcheck_running: false,
        }
    }

    #[must_use]
    pub const fn node(&self) -> &NodeInfo {
        &self.node
    }

    /// Number of commands still running.
    #[must_use]
    pub fn running_commands(&self) -> usize {
        self.execs.len()
    }

    fn advance_link(&mut self, ctx: &mut dyn TransportContext) {
        self.connect_timer = None;
        loop {
            let step = match self.link {
                LinkStep::Idle | LinkStep::Connected => return,
                LinkStep::Connect => self.connector.connect(&self.node).map(|session| {
                    self.session = Some(session);
                    LinkStep::Startup
                }),
                LinkStep::Startup => self
                    .with_session(ShellSession::startup)
                    .map(|()| LinkStep::KeepaliveConfig),
                LinkStep::KeepaliveConfig => {
                    let interval = self.config.keepalive_interval;
                    self.with_session(|s| {
                        s.configure_keepalive(true, interval);
                        Ok(())
                    })
                    .map(|()| LinkStep::Authenticate)
                }
                LinkStep::Authenticate => self
                    .with_session(ShellSession::authenticate)
                    .map(|()| LinkStep::Connected),
            };

            match step {
                Ok(LinkStep::Connected) => {
                    self.link = LinkStep::Connected;
                    self.on_connected(ctx);
                    return;
                }
                Ok(next) => self.link = next,
                Err(e) if would_block(&e) => {
                    ctx.defer(Priority::Low, Wakeup::Connect);
                    return;
                }
                Err(e) if unreachable_yet(&e) => {
                    debug!(assembly = %self.node.name, error = %e, "node not reachable yet, retrying");
                    self.session = None;
                    self.link = LinkStep::Connect;
                    self.connect_timer = Some(ctx.start_timer(
                        Priority::Low,
                        self.config.connect_retry,
                        Wakeup::Connect,
                    ));
                    return;
                }
                Err(e) => {
                    warn!(assembly = %self.node.name, step = ?self.link, error = %e, "session setup failed");
                    self.session = None;
                    self.link = LinkStep::Idle;
                    ctx.node_state(RecoveryState::Failed, "session setup failed");
                    return;
                }
            }
        }
    }

    fn with_session<T>(
        &mut self,
        f: impl FnOnce(&mut C::Session) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        match self.session.as_mut() {
            Some(session) => f(session),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    fn on_connected(&mut self, ctx: &mut dyn TransportContext) {
        info!(assembly = %self.node.name, "authenticated");
        ctx.defer(Priority::Low, Wakeup::Keepalive);
        self.healthcheck_timer = Some(ctx.start_timer(
            Priority::Low,
            self.config.healthcheck_interval,
            Wakeup::Healthcheck,
        ));
        ctx.node_state(RecoveryState::Running, "connected");
    }

    fn keepalive(&mut self, ctx: &mut dyn TransportContext) {
        self.keepalive_timer = None;
        if self.link != LinkStep::Connected {
            return;
        }
        let next = match self.with_session(ShellSession::keepalive_send) {
            Ok(next) => next,
            Err(e) => {
                if !would_block(&e) {
                    debug!(assembly = %self.node.name, error = %e, "keepalive failed");
                }
                self.config.keepalive_interval
            }
        };
        let next = next.max(Duration::from_secs(1));
        self.keepalive_timer = Some(ctx.start_timer(Priority::Low, next, Wakeup::Keepalive));
    }

    fn start_exec(&mut self, purpose: Purpose, command: String, ctx: &mut dyn TransportContext) {
        let id = self.next_exec;
        self.next_exec = self.next_exec.wrapping_add(1);
        info!(assembly = %self.node.name, command = %command, "ssh exec");

        let timer = ctx.start_timer(Priority::Low, self.config.exec_timeout, Wakeup::Timeout(id));
        self.execs.insert(
            id,
            ShellExec {
                purpose,
                command,
                step: ExecStep::OpenChannel,
                channel: None,
                output: Vec::new(),
                status: None,
                failed: false,
                timer: Some(timer),
            },
        );
        ctx.defer(Priority::Low, Wakeup::Step(id));
    }

    fn advance_exec(&mut self, id: u64, ctx: &mut dyn TransportContext) {
        let Some(exec) = self.execs.get_mut(&id) else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            exec.failed = true;
            self.finish_exec(id, ctx);
            return;
        };

        loop {
            let progress = match exec.step {
                ExecStep::Free => break,
                ExecStep::OpenChannel => session.open_channel().map(|channel| {
                    exec.channel = Some(channel);
                }),
                step => match exec.channel.as_mut() {
                    None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
                    Some(channel) => match step {
                        ExecStep::Exec => session.exec(channel, &exec.command),
                        ExecStep::Read => read_to_end(session, channel, &mut exec.output),
                        ExecStep::SendEof => session.send_eof(channel),
                        ExecStep::WaitEof => session.wait_eof(channel),
                        ExecStep::Close => session.close(channel),
                        ExecStep::WaitClosed => session
                            .wait_closed(channel)
                            .and_then(|()| session.exit_status(channel))
                            .map(|status| exec.status = Some(status)),
                        ExecStep::OpenChannel | ExecStep::Free => Ok(()),
                    },
                },
            };

            match progress {
                Ok(()) => exec.step = exec.step.next(),
                Err(e) if would_block(&e) => {
                    ctx.defer(Priority::Low, Wakeup::Step(id));
                    return;
                }
                Err(e) => {
                    warn!(
                        assembly = %self.node.name,
                        command = %exec.command,
                        step = ?exec.step,
                        error = %e,
                        "ssh exec failed"
                    );
                    exec.failed = true;
                    exec.step = ExecStep::Free;
                }
            }
        }
        self.finish_exec(id, ctx);
    }

    fn finish_exec(&mut self, id: u64, ctx: &mut dyn TransportContext) {
        let Some(exec) = self.execs.remove(&id) else {
            return;
        };
        if let Some(timer) = exec.timer {
            ctx.cancel_timer(timer);
        }
        let status = if exec.failed { None } else { exec.status };
        debug!(
            assembly = %self.node.name,
            command = %exec.command,
            ?status,
            output = %String::from_utf8_lossy(&exec.output).trim_end(),
            "ssh exec finished"
        );

        match exec.purpose {
            Purpose::Action { op, mapping } => {
                let rc = status.map_or(OcfExitCode::UnknownError, |status| mapping.map(status));
                ctx.action_completed(op, rc);
            }
            Purpose::Healthcheck => {
                self.healthcheck_running = false;
                if status == Some(0) {
                    if self.link == LinkStep::Connected {
                        self.healthcheck_timer = Some(ctx.start_timer(
                            Priority::Low,
                            self.config.healthcheck_interval,
                            Wakeup::Healthcheck,
                        ));
                    }
                } else {
                    warn!(assembly = %self.node.name, ?status, "healthcheck failed");
                    ctx.node_state(RecoveryState::Failed, "healthcheck failed");
                }
            }
        }
    }

    fn exec_timed_out(&mut self, id: u64, ctx: &mut dyn TransportContext) {
        let Some(exec) = self.execs.get_mut(&id) else {
            return;
        };
        exec.timer = None;
        warn!(assembly = %self.node.name, command = %exec.command, "ssh service timeout");
        self.drop_execs(ctx);
        ctx.node_state(RecoveryState::Failed, "ssh service timeout");
    }

    /// Abandon every running command, completing actions as failed.
    fn drop_execs(&mut self, ctx: &mut dyn TransportContext) {
        let execs = std::mem::take(&mut self.execs);
        self.healthcheck_running = false;
        for (_, exec) in execs {
            debug!(assembly = %self.node.name, command = %exec.command, "dropping ssh exec");
            if let Some(timer) = exec.timer {
                ctx.cancel_timer(timer);
            }
            if let Purpose::Action { op, .. } = exec.purpose {
                ctx.action_completed(op, OcfExitCode::UnknownError);
            }
        }
    }
}

/// Errors of a node that is still booting. Connecting starts over later.
fn unreachable_yet(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
    )
}

fn read_to_end<S: ShellSession>(
    session: &mut S,
    channel: &mut S::Channel,
    output: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = session.read(channel, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        output.extend_from_slice(buf.get(..n).unwrap_or_default());
    }
}

impl<C: ShellConnector> Transport for SshTransport<C> {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn is_connected(&self) -> bool {
        self.link == LinkStep::Connected
    }

    fn connect(&mut self, ctx: &mut dyn TransportContext) {
        if self.link != LinkStep::Idle {
            return;
        }
        info!(assembly = %self.node.name, address = %self.node.address, "connection in progress");
        self.link = LinkStep::Connect;
        ctx.defer(Priority::Low, Wakeup::Connect);
    }

    fn disconnect(&mut self, ctx: &mut dyn TransportContext) {
        info!(assembly = %self.node.name, "disconnecting");
        self.drop_execs(ctx);
        for timer in [
            self.connect_timer.take(),
            self.keepalive_timer.take(),
            self.healthcheck_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            ctx.cancel_timer(timer);
        }
        self.session = None;
        self.link = LinkStep::Idle;
    }

    fn resource_action(&mut self, op: OpHandle, ctx: &mut dyn TransportContext) {
        if self.link != LinkStep::Connected {
            warn!(assembly = %self.node.name, op = %*op, "not connected");
            ctx.action_completed(op, OcfExitCode::UnknownError);
            return;
        }
        match render(&op) {
            Some((command, mapping)) => self.start_exec(Purpose::Action { op, mapping }, command, ctx),
            None => {
                warn!(assembly = %self.node.name, op = %*op, "unsupported over ssh");
                ctx.action_completed(op, OcfExitCode::UnimplementFeature);
            }
        }
    }

    fn healthcheck(&mut self, ctx: &mut dyn TransportContext) {
        if self.link != LinkStep::Connected || self.healthcheck_running {
            return;
        }
        self.healthcheck_running = true;
        self.start_exec(Purpose::Healthcheck, HEALTHCHECK_COMMAND.to_string(), ctx);
    }

    fn wakeup(&mut self, wakeup: Wakeup, ctx: &mut dyn TransportContext) {
        match wakeup {
            Wakeup::Connect => self.advance_link(ctx),
            Wakeup::Step(id) => self.advance_exec(id, ctx),
            Wakeup::Timeout(id) => self.exec_timed_out(id, ctx),
            Wakeup::Keepalive => self.keepalive(ctx),
            Wakeup::Healthcheck => {
                self.healthcheck_timer = None;
                self.healthcheck(ctx);
            }
        }
    }
}

/// Creates [`SshTransport`]s sharing one connector setup.
#[derive(Debug, Clone)]
pub struct SshFactory<C> {
    connector: C,
    config: SshConfig,
}

impl<C> SshFactory<C> {
    pub const fn new(connector: C, config: SshConfig) -> Self {
        Self { connector, config }
    }
}

impl<C> TransportFactory for SshFactory<C>
where
    C: ShellConnector + Clone + 'static,
{
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn supports_class(&self, class: &str) -> bool {
        matches!(class, "lsb" | "ocf")
    }

    fn create(&self, node: &NodeInfo) -> Box<dyn Transport> {
        Box::new(SshTransport::new(
            node.clone(),
            self.connector.clone(),
            self.config.clone(),
        ))
    }
}
