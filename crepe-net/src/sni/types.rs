#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniParseStatus {
    NeedMore,
    /// A full ClientHello was read; `server_name` is absent when the client sent no SNI.
    Complete { server_name: Option<String> },
    Error { error: SniError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniError {
    pub kind: SniErrorKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniErrorKind {
    NotHandshake,
    NotClientHello,
    Malformed,
    TooLarge,
    UnexpectedEof,
}

impl std::fmt::Display for SniError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} at offset {}", self.kind, self.offset)
    }
}

impl std::error::Error for SniError {}
