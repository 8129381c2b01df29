mod parser;
mod types;
mod writer;

pub use parser::{ParseStatus, RequestHeadParser, ResponseHeadParser};
pub use types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};
pub use writer::{error_response, synthetic_response};
