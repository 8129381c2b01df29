use super::types::RequestHead;

impl RequestHead {
    /// Serializes the head back to wire form, preserving header name casing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.line.method,
                self.line.target,
                self.line.version.as_str()
            )
            .as_bytes(),
        );
        for header in &self.headers {
            bytes.extend_from_slice(header.raw_name.trim().as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(header.value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"\r\n");
        bytes
    }
}

/// A complete, self-delimiting response the proxy answers with itself.
pub fn synthetic_response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub fn error_response(status: u16, reason: &str, message: &str) -> Vec<u8> {
    synthetic_response(status, reason, "text/plain; charset=utf-8", message.as_bytes())
}
