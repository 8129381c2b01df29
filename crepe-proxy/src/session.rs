use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitClientHello,
    Handshaking,
    Decrypted,
    Relaying,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (from, Closed) => !from.is_terminal(),
            (AwaitClientHello, Handshaking) => true,
            // Plain HTTP and raw tunnels skip decryption.
            (AwaitClientHello, Decrypted) => true,
            (AwaitClientHello, Relaying) => true,
            (Handshaking, Decrypted) => true,
            (Decrypted, Relaying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitClientHello => "await_client_hello",
            SessionState::Handshaking => "handshaking",
            SessionState::Decrypted => "decrypted",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One client connection, owned by its handler task.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub negotiated_host: Option<String>,
    pub negotiated_port: Option<u16>,
    pub started_at: DateTime<Utc>,
    state: SessionState,
}

impl Session {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr,
            negotiated_host: None,
            negotiated_port: None,
            started_at: Utc::now(),
            state: SessionState::AwaitClientHello,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn negotiate(&mut self, host: &str, port: u16) {
        self.negotiated_host = Some(host.to_string());
        self.negotiated_port = Some(port);
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), ProxyError> {
        if !self.state.can_advance_to(next) {
            return Err(ProxyError::Protocol {
                peer: self.client_addr,
                message: format!("invalid session transition {} -> {}", self.state, next),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Error` unless the session already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Error;
        }
    }

    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Closed;
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Session, SessionState};
    use crate::ProxyError;

    fn session() -> Session {
        Session::new("127.0.0.1:50000".parse().unwrap())
    }

    #[test]
    fn follows_interception_lifecycle() {
        let mut session = session();
        for next in [
            SessionState::Handshaking,
            SessionState::Decrypted,
            SessionState::Relaying,
            SessionState::Closed,
        ] {
            session.advance(next).unwrap();
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn rejects_skipping_back() {
        let mut session = session();
        session.advance(SessionState::Handshaking).unwrap();
        assert_matches!(
            session.advance(SessionState::AwaitClientHello),
            Err(ProxyError::Protocol { .. })
        );
        assert_matches!(
            session.advance(SessionState::Relaying),
            Err(ProxyError::Protocol { .. })
        );
    }

    #[test]
    fn error_is_terminal() {
        let mut session = session();
        session.advance(SessionState::Handshaking).unwrap();
        session.fail();
        assert_eq!(session.state(), SessionState::Error);
        session.close();
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.advance(SessionState::Closed).is_err());
    }
}
