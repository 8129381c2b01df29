//! Operating-system side effects: steering traffic into the proxy and trusting
//! its root certificate. One implementation per platform, chosen at build time.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crepe_proxy::CertFormat;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(any(target_os = "linux", windows)))]
mod unsupported;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::Linux as Platform;
#[cfg(not(any(target_os = "linux", windows)))]
pub use unsupported::Unsupported as Platform;
#[cfg(windows)]
pub use windows::Windows as Platform;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("only loopback listen addresses can be redirected, got {0}")]
    NonLoopback(String),
    #[error("{0} requires administrator privileges and no escalation tool was found")]
    NoPrivilege(&'static str),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Command { program: String, status: ExitStatus },
}

pub trait SystemIntegration {
    /// Routes this machine's traffic for `redirect_ports` through the proxy
    /// listening on `host:port`.
    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        redirect_ports: &[u16],
    ) -> Result<(), SystemError>;

    /// Reverses [`SystemIntegration::set_system_proxy`] with the same arguments.
    async fn unset_system_proxy(
        &self,
        host: &str,
        port: u16,
        redirect_ports: &[u16],
    ) -> Result<(), SystemError>;

    /// Encoding the platform's trust store imports.
    fn certificate_format(&self) -> CertFormat;

    /// Adds the certificate at `path` to the system trust store.
    async fn install_certificate(&self, path: &Path) -> Result<(), SystemError>;
}

/// Runs administrative commands, prefixed with an escalation tool when the
/// current user lacks privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Privileged {
    escalate: Option<String>,
    elevated: bool,
}

impl Privileged {
    pub(crate) fn new(elevated: bool, escalate: Option<String>) -> Self {
        Self { escalate, elevated }
    }

    /// Full argv for `args`, or `None` when the command cannot be privileged.
    pub(crate) fn argv(&self, args: &[String]) -> Option<Vec<String>> {
        if self.elevated {
            return Some(args.to_vec());
        }
        let escalate = self.escalate.as_ref()?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(escalate.clone());
        argv.extend_from_slice(args);
        Some(argv)
    }

    pub(crate) async fn run(&self, what: &'static str, args: &[String]) -> Result<(), SystemError> {
        let argv = self.argv(args).ok_or(SystemError::NoPrivilege(what))?;
        run(&argv).await
    }
}

pub(crate) async fn run(argv: &[String]) -> Result<(), SystemError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    debug!(command = %argv.join(" "), "running");
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| SystemError::Spawn {
            program: program.clone(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(SystemError::Command {
            program: program.clone(),
            status,
        })
    }
}

/// First of `candidates` found on `PATH`.
pub(crate) fn find_escalation(candidates: &[&str]) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    candidates
        .iter()
        .find(|name| find_in(&path, name).is_some())
        .map(|name| name.to_string())
}

fn find_in(path: &OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(path).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        let exe = dir.join(format!("{name}.exe"));
        exe.is_file().then_some(exe)
    })
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::{Privileged, args, find_in};

    #[test]
    fn elevated_commands_run_as_is() {
        let runner = Privileged::new(true, Some("sudo".to_string()));
        assert_eq!(
            runner.argv(&args(["update-ca-trust"])),
            Some(args(["update-ca-trust"]))
        );
    }

    #[test]
    fn unprivileged_commands_are_prefixed() {
        let runner = Privileged::new(false, Some("pkexec".to_string()));
        assert_eq!(
            runner.argv(&args(["trust", "anchor"])),
            Some(args(["pkexec", "trust", "anchor"]))
        );
        assert_eq!(Privileged::new(false, None).argv(&args(["trust"])), None);
    }

    #[test]
    fn finds_programs_on_search_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("doas"), b"").expect("write");
        let path = std::env::join_paths([dir.path()]).expect("join");
        assert!(find_in(&path, "doas").is_some());
        assert!(find_in(&path, "sudo").is_none());
        assert!(find_in(&OsString::new(), "doas").is_none());
    }
}
