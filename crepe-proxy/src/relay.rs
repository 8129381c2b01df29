use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const RELAY_BUFFER: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    Cancelled,
    Failed(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client to upstream.
    pub bytes_up: u64,
    /// Bytes copied upstream to client.
    pub bytes_down: u64,
    pub end: RelayEnd,
}

/// Copies bytes both ways until either side reaches end-of-stream, fails, or
/// `cancel` fires. Both streams are shut down and dropped before returning.
pub async fn relay<C, U>(client: C, upstream: U, cancel: &CancellationToken) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    relay_bounded(client, upstream, None, cancel).await
}

/// Like [`relay`], but with `Some(limit)` at most `limit` client bytes reach
/// the upstream. Once they have, the client is no longer read and the relay
/// runs until the upstream finishes its reply.
pub async fn relay_bounded<C, U>(
    client: C,
    upstream: U,
    limit: Option<u64>,
    cancel: &CancellationToken,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut bytes_up = 0;
    let mut bytes_down = 0;

    let end = {
        let up = async {
            match pump_up(&mut client_read, &mut upstream_write, limit, &mut bytes_up).await {
                Ok(true) => Ok(()),
                Ok(false) => std::future::pending().await,
                Err(err) => Err(err),
            }
        };
        let down = pump(&mut upstream_read, &mut client_write, &mut bytes_down);
        tokio::select! {
            result = up => match result {
                Ok(()) => RelayEnd::ClientClosed,
                Err(err) => RelayEnd::Failed(err.kind()),
            },
            result = down => match result {
                Ok(()) => RelayEnd::UpstreamClosed,
                Err(err) => RelayEnd::Failed(err.kind()),
            },
            _ = cancel.cancelled() => RelayEnd::Cancelled,
        }
    };

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = upstream_write.shutdown().await;
        let _ = client_write.shutdown().await;
    })
    .await;

    RelayStats {
        bytes_up,
        bytes_down,
        end,
    }
}

/// Returns whether the client reached end-of-stream, as opposed to the limit.
async fn pump_up<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    copied: &mut u64,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(limit) = limit else {
        pump(reader, writer, copied).await?;
        return Ok(true);
    };
    pump(&mut reader.take(limit), writer, copied).await?;
    Ok(*copied < limit)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio_util::sync::CancellationToken;

    use super::{RelayEnd, relay, relay_bounded};

    #[tokio::test]
    async fn copies_both_directions() {
        let (mut client, client_peer) = duplex(1024);
        let (mut upstream, upstream_peer) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { relay(client_peer, upstream_peer, &cancel).await });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut request = [0u8; 18];
        upstream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.1\r\n\r\n");

        upstream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        let mut response = [0u8; 27];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");

        drop(upstream);
        let stats = task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::UpstreamClosed);
        assert_eq!(stats.bytes_up, 18);
        assert_eq!(stats.bytes_down, 27);
    }

    #[tokio::test]
    async fn eof_closes_the_other_side() {
        let (client, client_peer) = duplex(1024);
        let (mut upstream, upstream_peer) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { relay(client_peer, upstream_peer, &cancel).await });

        drop(client);
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), upstream.read_to_end(&mut rest))
            .await
            .expect("upstream was not closed")
            .unwrap();
        assert!(rest.is_empty());

        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.end, RelayEnd::ClientClosed);
    }

    #[tokio::test]
    async fn bounded_relay_stops_reading_the_client() {
        let (mut client, client_peer) = duplex(1024);
        let (mut upstream, upstream_peer) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move {
            relay_bounded(client_peer, upstream_peer, Some(5), &cancel).await
        });

        client.write_all(b"hello").await.unwrap();
        client.write_all(b"GET /next HTTP/1.1\r\n\r\n").await.unwrap();
        let mut body = [0u8; 5];
        upstream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");

        upstream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(upstream);
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");

        let stats = task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::UpstreamClosed);
        assert_eq!(stats.bytes_up, 5);
    }

    #[tokio::test]
    async fn cancellation_closes_both_streams() {
        let (mut client, client_peer) = duplex(1024);
        let (mut upstream, upstream_peer) = duplex(1024);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { relay(client_peer, upstream_peer, &token).await });

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }
}
