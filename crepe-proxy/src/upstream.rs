use std::pin::Pin;
use std::time::Duration;

use crepe_net::connect_ssl;
use openssl::ssl::SslConnector;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::debug;

use crate::error::ProxyError;
use crate::rules::{Scheme, Target};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens connections toward resolved targets, re-encrypting when the target
/// scheme is https.
pub struct UpstreamConnector {
    connector: SslConnector,
    insecure: bool,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(
        connector: SslConnector,
        insecure: bool,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            insecure,
            connect_timeout,
            handshake_timeout,
        }
    }

    pub async fn connect(&self, target: &Target) -> Result<BoxedStream, ProxyError> {
        let tcp = self.connect_tcp(&target.host, target.port).await?;
        match target.scheme {
            Scheme::Http => Ok(Box::new(tcp)),
            Scheme::Https => Ok(Box::new(self.handshake(target, tcp).await?)),
        }
    }

    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let unreachable = |reason: String| ProxyError::UpstreamUnreachable {
            host: host.to_string(),
            port,
            reason,
        };

        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| unreachable(format!("no connection after {:?}", self.connect_timeout)))?
            .map_err(|err| unreachable(err.to_string()))?;
        let _ = stream.set_nodelay(true);
        debug!(host, port, "upstream connected");
        Ok(stream)
    }

    async fn handshake(
        &self,
        target: &Target,
        tcp: TcpStream,
    ) -> Result<SslStream<TcpStream>, ProxyError> {
        let failed = |message: String| ProxyError::Handshake {
            peer: target.host.clone(),
            message,
        };

        let ssl = connect_ssl(&self.connector, &target.host, self.insecure)
            .map_err(|err| failed(err.message))?;
        let mut stream = SslStream::new(ssl, tcp).map_err(|err| failed(err.to_string()))?;
        timeout(self.handshake_timeout, Pin::new(&mut stream).connect())
            .await
            .map_err(|_| failed("handshake timed out".to_string()))?
            .map_err(|err| failed(err.to_string()))?;
        Ok(stream)
    }
}
