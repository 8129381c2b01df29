mod parser;
mod types;

pub use parser::{ClientHelloParser, is_tls_handshake, parse_client_hello};
pub use types::{SniError, SniErrorKind, SniParseStatus};
