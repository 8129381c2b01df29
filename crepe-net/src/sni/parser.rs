use super::types::{SniError, SniErrorKind, SniParseStatus};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;
const MAX_CLIENT_HELLO: usize = 64 * 1024;

/// True when `bytes` start like a TLS handshake record.
pub fn is_tls_handshake(bytes: &[u8]) -> bool {
    bytes.first() == Some(&CONTENT_TYPE_HANDSHAKE)
}

/// Accumulates the first bytes of a connection until the ClientHello is
/// complete, then reports the SNI host name it carries.
#[derive(Debug, Default)]
pub struct ClientHelloParser {
    buffer: Vec<u8>,
}

impl ClientHelloParser {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> SniParseStatus {
        self.buffer.extend_from_slice(bytes);
        match parse_client_hello(&self.buffer) {
            Ok(server_name) => SniParseStatus::Complete { server_name },
            Err(error) => match error.kind {
                SniErrorKind::UnexpectedEof => SniParseStatus::NeedMore,
                _ => SniParseStatus::Error { error },
            },
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Parses a ClientHello, possibly fragmented over several records.
pub fn parse_client_hello(buffer: &[u8]) -> Result<Option<String>, SniError> {
    let handshake = reassemble_handshake(buffer)?;
    let mut reader = Reader::new(&handshake, 0);

    if reader.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(error(SniErrorKind::NotClientHello, 0));
    }
    let length = reader.u24()?;
    let body = reader.take(length)?;
    parse_client_hello_body(body).map_err(|err| {
        // The message length was satisfied, so running short inside it is malformed input.
        if err.kind == SniErrorKind::UnexpectedEof {
            error(SniErrorKind::Malformed, err.offset)
        } else {
            err
        }
    })
}

fn reassemble_handshake(buffer: &[u8]) -> Result<Vec<u8>, SniError> {
    let mut handshake = Vec::new();
    let mut offset = 0;

    loop {
        let record = buffer.get(offset..).unwrap_or_default();
        if record.len() < RECORD_HEADER_LEN {
            if record.first().is_some_and(|byte| *byte != CONTENT_TYPE_HANDSHAKE) {
                return Err(error(SniErrorKind::NotHandshake, offset));
            }
            return Err(error(SniErrorKind::UnexpectedEof, buffer.len()));
        }
        if record[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(error(SniErrorKind::NotHandshake, offset));
        }
        if record[1] != 0x03 {
            return Err(error(SniErrorKind::Malformed, offset + 1));
        }
        let length = usize::from(u16::from_be_bytes([record[3], record[4]]));
        let fragment = record
            .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + length)
            .ok_or_else(|| error(SniErrorKind::UnexpectedEof, buffer.len()))?;
        handshake.extend_from_slice(fragment);
        offset += RECORD_HEADER_LEN + length;

        if handshake.len() >= 4 {
            let needed = 4 + ((usize::from(handshake[1]) << 16)
                | (usize::from(handshake[2]) << 8)
                | usize::from(handshake[3]));
            if needed > MAX_CLIENT_HELLO {
                return Err(error(SniErrorKind::TooLarge, 1));
            }
            if handshake.len() >= needed {
                return Ok(handshake);
            }
        }
    }
}

fn parse_client_hello_body(body: &[u8]) -> Result<Option<String>, SniError> {
    let mut reader = Reader::new(body, 4);

    reader.take(2)?; // legacy_version
    reader.take(32)?; // random
    let session_id = usize::from(reader.u8()?);
    reader.take(session_id)?;
    let cipher_suites = usize::from(reader.u16()?);
    reader.take(cipher_suites)?;
    let compression = usize::from(reader.u8()?);
    reader.take(compression)?;

    if reader.is_empty() {
        return Ok(None);
    }

    let extensions_len = usize::from(reader.u16()?);
    let extensions_offset = reader.offset();
    let mut extensions = Reader::new(reader.take(extensions_len)?, extensions_offset);

    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let length = usize::from(extensions.u16()?);
        let data_offset = extensions.offset();
        let data = extensions.take(length)?;
        if kind == EXTENSION_SERVER_NAME {
            return parse_server_name(data, data_offset);
        }
    }

    Ok(None)
}

fn parse_server_name(data: &[u8], base_offset: usize) -> Result<Option<String>, SniError> {
    let mut reader = Reader::new(data, base_offset);
    let list_len = usize::from(reader.u16()?);
    let list_offset = reader.offset();
    let mut list = Reader::new(reader.take(list_len)?, list_offset);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = usize::from(list.u16()?);
        let name_offset = list.offset();
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST {
            let name = std::str::from_utf8(name)
                .map_err(|_| error(SniErrorKind::Malformed, name_offset))?;
            if name.is_empty() || !name.is_ascii() {
                return Err(error(SniErrorKind::Malformed, name_offset));
            }
            return Ok(Some(name.to_ascii_lowercase()));
        }
    }

    Ok(None)
}

fn error(kind: SniErrorKind, offset: usize) -> SniError {
    SniError { kind, offset }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Self {
        Self {
            bytes,
            pos: 0,
            base,
        }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SniError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| error(SniErrorKind::UnexpectedEof, self.offset()))?;
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Result<usize, SniError> {
        let bytes = self.take(3)?;
        Ok((usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2]))
    }
}
