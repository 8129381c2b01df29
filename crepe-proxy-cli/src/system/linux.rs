use std::path::Path;

use crepe_proxy::CertFormat;
use tokio::process::Command;

use super::{Privileged, SystemError, SystemIntegration, args, find_escalation};

const ESCALATION: [&str; 3] = ["pkexec", "sudo", "doas"];
const LOOPBACK_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "0.0.0.0"];

/// iptables NAT redirection and p11-kit trust anchors.
pub struct Linux {
    privileged: Privileged,
}

impl Linux {
    pub async fn detect() -> Self {
        Self {
            privileged: Privileged::new(is_root().await, find_escalation(&ESCALATION)),
        }
    }

    async fn redirect(
        &self,
        action: Action,
        host: &str,
        port: u16,
        redirect_ports: &[u16],
    ) -> Result<(), SystemError> {
        if !LOOPBACK_HOSTS.contains(&host) {
            return Err(SystemError::NonLoopback(host.to_string()));
        }
        self.privileged
            .run("system proxy", &iptables_args(action, port, redirect_ports))
            .await
    }
}

impl SystemIntegration for Linux {
    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        redirect_ports: &[u16],
    ) -> Result<(), SystemError> {
        self.redirect(Action::Append, host, port, redirect_ports)
            .await
    }

    async fn unset_system_proxy(
        &self,
        host: &str,
        port: u16,
        redirect_ports: &[u16],
    ) -> Result<(), SystemError> {
        self.redirect(Action::Delete, host, port, redirect_ports)
            .await
    }

    fn certificate_format(&self) -> CertFormat {
        CertFormat::Pem
    }

    async fn install_certificate(&self, path: &Path) -> Result<(), SystemError> {
        let path = path.to_string_lossy();
        self.privileged
            .run(
                "certificate install",
                &args(["trust", "anchor", "--store", &*path]),
            )
            .await?;
        self.privileged
            .run("certificate install", &args(["update-ca-trust"]))
            .await
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Append,
    Delete,
}

/// Redirects outgoing traffic of every user except root, so the proxy's own
/// upstream connections (when run as root) are not looped back.
fn iptables_args(action: Action, port: u16, redirect_ports: &[u16]) -> Vec<String> {
    let flag = match action {
        Action::Append => "-A",
        Action::Delete => "-D",
    };
    let ports = redirect_ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut argv = args([
        "iptables", "-t", "nat", flag, "OUTPUT", "-p", "tcp", "-m", "owner", "!",
        "--uid-owner", "root", "-m", "multiport", "--dports",
    ]);
    argv.push(ports);
    argv.extend(args(["-j", "REDIRECT", "--to-port"]));
    argv.push(port.to_string());
    argv
}

async fn is_root() -> bool {
    match Command::new("id").arg("-u").output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "0",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Action, Linux, iptables_args};
    use crate::system::{Privileged, SystemError, SystemIntegration};

    #[test]
    fn builds_redirect_rule() {
        let argv = iptables_args(Action::Append, 13168, &[80, 443]);
        assert_eq!(
            argv.join(" "),
            "iptables -t nat -A OUTPUT -p tcp -m owner ! --uid-owner root \
             -m multiport --dports 80,443 -j REDIRECT --to-port 13168"
        );
        let argv = iptables_args(Action::Delete, 8080, &[443]);
        assert_eq!(argv[3], "-D");
        assert_eq!(argv[15], "443");
        assert_eq!(argv.last().map(String::as_str), Some("8080"));
    }

    #[tokio::test]
    async fn refuses_non_loopback_hosts() {
        let linux = Linux {
            privileged: Privileged::new(true, None),
        };
        let result = linux.set_system_proxy("10.0.0.5", 13168, &[443]).await;
        assert_matches!(result, Err(SystemError::NonLoopback(host)) if host == "10.0.0.5");
    }

    #[tokio::test]
    async fn refuses_without_privileges() {
        let linux = Linux {
            privileged: Privileged::new(false, None),
        };
        let result = linux.unset_system_proxy("127.0.0.1", 13168, &[443]).await;
        assert_matches!(result, Err(SystemError::NoPrivilege(_)));
    }
}
