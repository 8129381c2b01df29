use std::path::Path;

use crepe_proxy::CertFormat;
use tokio::process::Command;

use super::{Privileged, SystemError, SystemIntegration, args, find_escalation, run};

const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// WinHTTP and WinINet proxy settings plus the machine root store.
pub struct Windows {
    privileged: Privileged,
}

impl Windows {
    pub async fn detect() -> Self {
        // gsudo also answers to `sudo` on recent Windows builds.
        let escalate = find_escalation(&["gsudo", "sudo"]).map(|_| "gsudo".to_string());
        Self {
            privileged: Privileged::new(is_admin().await, escalate),
        }
    }
}

impl SystemIntegration for Windows {
    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        _redirect_ports: &[u16],
    ) -> Result<(), SystemError> {
        let server = format!("{host}:{port}");
        self.privileged
            .run(
                "system proxy",
                &args(["netsh", "winhttp", "set", "proxy", server.as_str()]),
            )
            .await?;
        run(&reg_add("ProxyEnable", "REG_DWORD", "1")).await?;
        run(&reg_add("ProxyServer", "REG_SZ", &server)).await
    }

    async fn unset_system_proxy(
        &self,
        _host: &str,
        _port: u16,
        _redirect_ports: &[u16],
    ) -> Result<(), SystemError> {
        self.privileged
            .run("system proxy", &args(["netsh", "winhttp", "reset", "proxy"]))
            .await?;
        run(&reg_add("ProxyEnable", "REG_DWORD", "0")).await?;
        run(&reg_add("ProxyServer", "REG_SZ", "")).await
    }

    fn certificate_format(&self) -> CertFormat {
        CertFormat::Der
    }

    async fn install_certificate(&self, path: &Path) -> Result<(), SystemError> {
        let path = path.to_string_lossy();
        self.privileged
            .run(
                "certificate install",
                &args(["certutil.exe", "-addstore", "root", &*path]),
            )
            .await
    }
}

fn reg_add(name: &str, kind: &str, data: &str) -> Vec<String> {
    args([
        "reg.exe",
        "add",
        INTERNET_SETTINGS,
        "/v",
        name,
        "/t",
        kind,
        "/d",
        data,
        "/f",
    ])
}

/// `net session` only succeeds from an elevated prompt.
async fn is_admin() -> bool {
    Command::new("net")
        .arg("session")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::reg_add;

    #[test]
    fn registry_values_are_forced() {
        let argv = reg_add("ProxyServer", "REG_SZ", "127.0.0.1:13168");
        assert_eq!(argv[0], "reg.exe");
        assert_eq!(argv[4], "ProxyServer");
        assert_eq!(argv[8], "127.0.0.1:13168");
        assert_eq!(argv.last().map(String::as_str), Some("/f"));
    }
}
