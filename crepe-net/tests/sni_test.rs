use std::io::{self, Read, Write};

use crepe_net::{ClientHelloParser, SniParseStatus};
use openssl::ssl::{SslConnector, SslMethod, SslStream};

/// Captures what the TLS client writes and never answers.
#[derive(Default)]
struct Capture {
    written: Vec<u8>,
}

impl Read for Capture {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn openssl_client_hello(host: &str) -> Vec<u8> {
    let connector = SslConnector::builder(SslMethod::tls()).unwrap().build();
    let ssl = connector.configure().unwrap().into_ssl(host).unwrap();
    let mut stream = SslStream::new(ssl, Capture::default()).unwrap();
    let _ = stream.connect();
    stream.get_ref().written.clone()
}

#[test]
fn parses_real_client_hello() {
    let hello = openssl_client_hello("sdk-static.mihoyo.com");
    let mut parser = ClientHelloParser::new();

    match parser.push(&hello) {
        SniParseStatus::Complete { server_name } => {
            assert_eq!(server_name.as_deref(), Some("sdk-static.mihoyo.com"));
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[test]
fn parses_real_client_hello_byte_by_byte() {
    let hello = openssl_client_hello("overseauspider.yuanshen.com");
    let mut parser = ClientHelloParser::new();

    let (last, rest) = hello.split_last().unwrap();
    for byte in rest {
        assert!(matches!(parser.push(&[*byte]), SniParseStatus::NeedMore));
    }
    match parser.push(&[*last]) {
        SniParseStatus::Complete { server_name } => {
            assert_eq!(server_name.as_deref(), Some("overseauspider.yuanshen.com"));
        }
        other => panic!("unexpected status {other:?}"),
    }
}
