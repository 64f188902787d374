//! Shell commands for resource actions.

use cape_core::{Method, OcfExitCode, Operation};

/// Where OCF resource agents live on the node.
pub const OCF_ROOT: &str = "/usr/lib/ocf";

/// Command used to check a node.
pub const HEALTHCHECK_COMMAND: &str = "uptime";

/// How a command's exit status becomes an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMapping {
    /// LSB init script semantics for the named action.
    Lsb(&'static str),
    /// The status already is an OCF code.
    Ocf,
}

impl ExitMapping {
    #[must_use]
    pub fn map(self, status: i32) -> OcfExitCode {
        match self {
            Self::Lsb(action) => OcfExitCode::from_lsb(action, status),
            Self::Ocf => OcfExitCode::from_agent(status),
        }
    }
}

/// Build the command line running `op`, or `None` if the operation cannot
/// run over a shell.
#[must_use]
pub fn render(op: &Operation) -> Option<(String, ExitMapping)> {
    match op.class.as_str() {
        "lsb" => {
            let action = match op.method {
                Method::Start => "start",
                Method::Stop => "stop",
                Method::Monitor => "status",
                Method::Delete => return None,
            };
            Some((
                format!("systemctl {action} {}.service", op.kind),
                ExitMapping::Lsb(action),
            ))
        }
        "ocf" => {
            if op.method == Method::Delete {
                return None;
            }
            let provider = op.provider.as_deref().unwrap_or("heartbeat");
            let mut line = format!("OCF_ROOT={OCF_ROOT}");
            for (key, value) in &op.params {
                line.push_str(&format!(" OCF_RESKEY_{key}={}", quote(value)));
            }
            line.push_str(&format!(
                " {OCF_ROOT}/resource.d/{provider}/{} {}",
                op.kind, op.method
            ));
            Some((line, ExitMapping::Ocf))
        }
        _ => None,
    }
}

/// Single-quote a value for a POSIX shell.
fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
