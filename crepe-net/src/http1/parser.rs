use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore {
        warnings: Vec<ParseWarning>,
    },
    /// `consumed` is the number of buffered bytes that made up the head; anything
    /// after it belongs to the body or the next message.
    Complete {
        message: T,
        consumed: usize,
        warnings: Vec<ParseWarning>,
    },
    Error {
        error: ParseError,
        warnings: Vec<ParseWarning>,
    },
}

/// Incremental request-head parser. Bytes are accumulated across `push` calls
/// until the blank line terminating the headers arrives.
#[derive(Debug, Default)]
pub struct RequestHeadParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl RequestHeadParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<RequestHead> {
        self.buffer.extend_from_slice(bytes);
        parse_head(&self.buffer, self.limits, |line, offset, warnings| {
            parse_request_line(line, offset, warnings)
        })
        .map(|(line, headers)| RequestHead { line, headers })
    }

    /// Everything pushed so far, head and trailing bytes included.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[derive(Debug, Default)]
pub struct ResponseHeadParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl ResponseHeadParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<ResponseHead> {
        self.buffer.extend_from_slice(bytes);
        parse_head(&self.buffer, self.limits, |line, offset, warnings| {
            parse_status_line(line, offset, warnings)
        })
        .map(|(line, headers)| ResponseHead { line, headers })
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

impl<T> ParseStatus<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseStatus<U> {
        match self {
            ParseStatus::NeedMore { warnings } => ParseStatus::NeedMore { warnings },
            ParseStatus::Complete {
                message,
                consumed,
                warnings,
            } => ParseStatus::Complete {
                message: f(message),
                consumed,
                warnings,
            },
            ParseStatus::Error { error, warnings } => ParseStatus::Error { error, warnings },
        }
    }
}

fn parse_head<L>(
    buffer: &[u8],
    limits: Limits,
    parse_line: impl FnOnce(&[u8], usize, &mut Vec<ParseWarning>) -> Result<L, ParseError>,
) -> ParseStatus<(L, Vec<Header>)> {
    let mut warnings = Vec::new();

    let headers_end = match find_headers_end(buffer, limits) {
        Ok(Some(index)) => index,
        Ok(None) => return ParseStatus::NeedMore { warnings },
        Err(error) => return ParseStatus::Error { error, warnings },
    };

    let line_end = find_line_end(buffer, 0).unwrap_or(headers_end);
    let line = match parse_line(&buffer[..line_end], 0, &mut warnings) {
        Ok(line) => line,
        Err(error) => return ParseStatus::Error { error, warnings },
    };

    let headers_start = (line_end + CRLF.len()).min(headers_end);
    let headers = match parse_headers(
        &buffer[headers_start..headers_end],
        headers_start,
        &mut warnings,
    ) {
        Ok(headers) => headers,
        Err(error) => return ParseStatus::Error { error, warnings },
    };

    ParseStatus::Complete {
        message: (line, headers),
        consumed: headers_end + HEADER_TERMINATOR.len(),
        warnings,
    }
}

fn find_headers_end(buffer: &[u8], limits: Limits) -> Result<Option<usize>, ParseError> {
    match twoway::find_bytes(buffer, HEADER_TERMINATOR) {
        Some(index) if index > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        Some(index) => Ok(Some(index)),
        None if buffer.len() > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        None => Ok(None),
    }
}

fn find_line_end(buffer: &[u8], start: usize) -> Option<usize> {
    twoway::find_bytes(&buffer[start..], CRLF).map(|offset| start + offset)
}

fn parse_request_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<RequestLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid.clone())?;
    let target = parts.next().ok_or_else(|| invalid.clone())?;
    let version_raw = parts.next().unwrap_or("HTTP/1.1");

    if parts.next().is_some() || !method.bytes().all(|byte| byte.is_ascii_alphabetic()) {
        return Err(invalid);
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: parse_http_version(version_raw, offset, warnings),
    })
}

fn parse_status_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<StatusLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    let status_raw = parts.next().ok_or_else(|| invalid.clone())?;
    let reason = parts.next().unwrap_or("");

    let status_code = status_raw.parse::<u16>().map_err(|_| invalid)?;

    Ok(StatusLine {
        version: parse_http_version(version_raw, offset, warnings),
        status_code,
        reason: reason.to_string(),
    })
}

fn parse_http_version(
    version_raw: &str,
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::UnknownVersion(other.to_string()),
                offset,
            });
            HttpVersion::Other(other.to_string())
        }
    }
}

fn parse_headers(
    bytes: &[u8],
    base_offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<Vec<Header>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeader,
        offset: base_offset,
    })?;

    let mut headers: Vec<Header> = Vec::new();
    let mut offset = base_offset;

    for line in text.split("\r\n") {
        if line.is_empty() {
            offset += CRLF.len();
            continue;
        }

        if line.starts_with([' ', '\t']) {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::ObsFoldDetected,
                offset,
            });
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            offset += line.len() + CRLF.len();
            continue;
        }

        let Some((raw_name, value)) = line.split_once(':') else {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidHeader,
                offset,
            });
        };

        if raw_name.trim().is_empty() {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderName,
                offset,
            });
        }

        headers.push(Header {
            name: raw_name.trim().to_string(),
            raw_name: raw_name.to_string(),
            value: value.trim().to_string(),
        });
        offset += line.len() + CRLF.len();
    }

    Ok(headers)
}
