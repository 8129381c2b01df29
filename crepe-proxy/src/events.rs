use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 4096;

pub type ProxyEvents = ReceiverStream<ProxyEvent>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyEventKind {
    Accepted {
        client_addr: SocketAddr,
    },
    Redirected {
        host: String,
        target: String,
    },
    Passed {
        host: String,
    },
    Blocked {
        host: String,
    },
    Failed {
        message: String,
        status: Option<u16>,
    },
    Closed {
        bytes_up: u64,
        bytes_down: u64,
        duration_ms: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyEvent {
    pub event_id: Uuid,
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProxyEventKind,
}

/// Publishing side of the event stream. Events are dropped rather than
/// waiting on a slow or absent consumer.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<ProxyEvent>,
}

impl EventSink {
    pub fn publish(&self, session_id: Uuid, kind: ProxyEventKind) {
        let _ = self.sender.try_send(ProxyEvent {
            event_id: Uuid::new_v4(),
            session_id,
            at: Utc::now(),
            kind,
        });
    }
}

pub fn event_channel() -> (EventSink, ProxyEvents) {
    let (sender, receiver) = mpsc::channel(EVENT_CAPACITY);
    (EventSink { sender }, ReceiverStream::new(receiver))
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    use super::{ProxyEventKind, event_channel};

    #[tokio::test]
    async fn delivers_in_order() {
        let (sink, mut events) = event_channel();
        let session = Uuid::new_v4();
        sink.publish(
            session,
            ProxyEventKind::Blocked {
                host: "overseauspider.yuanshen.com".to_string(),
            },
        );
        sink.publish(
            session,
            ProxyEventKind::Closed {
                bytes_up: 0,
                bytes_down: 0,
                duration_ms: 1,
            },
        );
        drop(sink);

        let first = events.next().await.unwrap();
        assert_eq!(first.session_id, session);
        assert!(matches!(first.kind, ProxyEventKind::Blocked { .. }));
        assert!(matches!(
            events.next().await.unwrap().kind,
            ProxyEventKind::Closed { .. }
        ));
        assert!(events.next().await.is_none());
    }

    #[test]
    fn publishing_without_consumer_does_not_block() {
        let (sink, events) = event_channel();
        drop(events);
        for _ in 0..10_000 {
            sink.publish(Uuid::nil(), ProxyEventKind::Passed { host: "a".to_string() });
        }
    }
}
