use std::path::Path;

use crepe_proxy::CertFormat;

use super::{SystemError, SystemIntegration};

pub struct Unsupported;

impl Unsupported {
    pub async fn detect() -> Self {
        Unsupported
    }
}

impl SystemIntegration for Unsupported {
    async fn set_system_proxy(&self, _: &str, _: u16, _: &[u16]) -> Result<(), SystemError> {
        Err(SystemError::Unsupported("setting the system proxy"))
    }

    async fn unset_system_proxy(&self, _: &str, _: u16, _: &[u16]) -> Result<(), SystemError> {
        Err(SystemError::Unsupported("unsetting the system proxy"))
    }

    fn certificate_format(&self) -> CertFormat {
        CertFormat::Pem
    }

    async fn install_certificate(&self, _: &Path) -> Result<(), SystemError> {
        Err(SystemError::Unsupported("installing certificates"))
    }
}
