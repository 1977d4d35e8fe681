//! Non-consuming ClientHello/ServerHello parser.
//!
//! Every read goes through [`BufferedStream::ensure_available`] and the
//! buffered slice, so the stream's read cursor never moves. An incomplete or
//! foreign byte sequence yields `Ok(None)`; only transport errors surface as
//! `Err`.

use std::collections::BTreeMap;
use std::io;

use tokio::io::AsyncRead;

use crate::io::BufferedStream;
use crate::models::tls::{
    ClientHelloInfo, ExtensionValue, HandshakeFraming, ServerHelloInfo, TlsExtension, TlsVersion,
    EXT_ALPN, EXT_EC_POINT_FORMATS, EXT_SERVER_NAME, EXT_SIGNATURE_ALGORITHMS,
    EXT_SUPPORTED_GROUPS, EXT_SUPPORTED_VERSIONS,
};

const SSL2_RECORD: u8 = 0x80;
const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;

/// Record header (5) + handshake header (4) + version (2) + random (32) +
/// session id length (1).
const TLS_HELLO_PREFIX: usize = 44;

/// Peek-only cursor over a [`BufferedStream`].
struct PeekCursor<'a, S> {
    stream: &'a mut BufferedStream<S>,
    pos: usize,
}

impl<'a, S: AsyncRead + Unpin> PeekCursor<'a, S> {
    fn new(stream: &'a mut BufferedStream<S>) -> Self {
        Self { stream, pos: 0 }
    }

    /// Make `count` more bytes past the cursor available. `false` when the
    /// stream ends first or the bytes cannot fit in the buffer.
    async fn need(&mut self, count: usize) -> io::Result<bool> {
        let end = self.pos + count;
        if end > self.stream.capacity() {
            return Ok(false);
        }
        self.stream.ensure_available(end).await
    }

    fn u8(&mut self) -> u8 {
        let b = self.stream.buffered()[self.pos];
        self.pos += 1;
        b
    }

    fn u16(&mut self) -> u16 {
        let hi = self.u8() as u16;
        let lo = self.u8() as u16;
        (hi << 8) | lo
    }

    fn u24(&mut self) -> u32 {
        let hi = self.u8() as u32;
        (hi << 16) | self.u16() as u32
    }

    fn bytes(&mut self, count: usize) -> Vec<u8> {
        let out = self.stream.buffered()[self.pos..self.pos + count].to_vec();
        self.pos += count;
        out
    }

    fn skip(&mut self, count: usize) {
        self.pos += count;
    }
}

/// Parse a ClientHello at the stream's read cursor without consuming it.
pub async fn peek_client_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
) -> io::Result<Option<ClientHelloInfo>> {
    let mut cur = PeekCursor::new(stream);
    if !cur.need(1).await? {
        return Ok(None);
    }
    match cur.u8() {
        SSL2_RECORD => parse_ssl2_client_hello(cur).await,
        TLS_HANDSHAKE_RECORD => parse_tls_client_hello(cur).await,
        _ => Ok(None),
    }
}

/// Parse a ServerHello at the stream's read cursor without consuming it.
pub async fn peek_server_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
) -> io::Result<Option<ServerHelloInfo>> {
    let mut cur = PeekCursor::new(stream);
    if !cur.need(1).await? {
        return Ok(None);
    }
    match cur.u8() {
        SSL2_RECORD => parse_ssl2_server_hello(cur).await,
        TLS_HANDSHAKE_RECORD => parse_tls_server_hello(cur).await,
        _ => Ok(None),
    }
}

async fn parse_ssl2_client_hello<S: AsyncRead + Unpin>(
    mut cur: PeekCursor<'_, S>,
) -> io::Result<Option<ClientHelloInfo>> {
    // length, type, version, cipher spec len, session id len, challenge len
    if !cur.need(10).await? {
        return Ok(None);
    }
    let record_length = cur.u8() as usize;
    if cur.u8() != CLIENT_HELLO {
        return Ok(None);
    }
    let version = TlsVersion::new(cur.u8(), cur.u8());
    let cipher_len = cur.u16() as usize;
    let session_len = cur.u16() as usize;
    let challenge_len = cur.u16() as usize;

    if cipher_len % 3 != 0 || !cur.need(cipher_len + session_len + challenge_len).await? {
        return Ok(None);
    }
    let ciphers = (0..cipher_len / 3)
        .map(|_| (cur.u8() as u32) << 16 | cur.u16() as u32)
        .collect();
    let session_id = cur.bytes(session_len);
    let random = cur.bytes(challenge_len);

    Ok(Some(ClientHelloInfo {
        framing: HandshakeFraming::Ssl2,
        version,
        random,
        session_id,
        ciphers,
        compression_data: Vec::new(),
        extensions: BTreeMap::new(),
        handshake_length: record_length + 2,
    }))
}

async fn parse_ssl2_server_hello<S: AsyncRead + Unpin>(
    mut cur: PeekCursor<'_, S>,
) -> io::Result<Option<ServerHelloInfo>> {
    // length, type, session id hit, cert type, version, cert len, cipher len,
    // connection id len
    if !cur.need(12).await? {
        return Ok(None);
    }
    let record_length = cur.u8() as usize;
    if cur.u8() != SERVER_HELLO {
        return Ok(None);
    }
    let _session_id_hit = cur.u8();
    let _certificate_type = cur.u8();
    let version = TlsVersion::new(cur.u8(), cur.u8());
    let certificate_len = cur.u16() as usize;
    let cipher_len = cur.u16() as usize;
    let connection_id_len = cur.u16() as usize;

    if cipher_len % 3 != 0
        || !cur
            .need(certificate_len + cipher_len + connection_id_len)
            .await?
    {
        return Ok(None);
    }
    cur.skip(certificate_len);
    let mut cipher = 0;
    for i in 0..cipher_len / 3 {
        let spec = (cur.u8() as u32) << 16 | cur.u16() as u32;
        if i == 0 {
            cipher = spec;
        }
    }
    let random = cur.bytes(connection_id_len);

    Ok(Some(ServerHelloInfo {
        framing: HandshakeFraming::Ssl2,
        version,
        random,
        session_id: Vec::new(),
        cipher,
        compression_method: 0,
        extensions: BTreeMap::new(),
        handshake_length: record_length + 2,
    }))
}

/// Common TLS hello prefix: returns (version, random, session id, end of the
/// hello body) with the cursor just past the session id and `extra` more
/// bytes available.
async fn parse_tls_hello_prefix<S: AsyncRead + Unpin>(
    cur: &mut PeekCursor<'_, S>,
    expected_type: u8,
    extra: usize,
) -> io::Result<Option<(TlsVersion, Vec<u8>, Vec<u8>, usize)>> {
    if !cur.need(TLS_HELLO_PREFIX - 1).await? {
        return Ok(None);
    }
    let _record_version = cur.u16();
    let _record_length = cur.u16();
    if cur.u8() != expected_type {
        return Ok(None);
    }
    let handshake_length = cur.u24() as usize;
    let hello_end = cur.pos + handshake_length;
    let version = TlsVersion::new(cur.u8(), cur.u8());
    let random = cur.bytes(32);
    let session_len = cur.u8() as usize;

    if !cur.need(session_len + extra).await? {
        return Ok(None);
    }
    let session_id = cur.bytes(session_len);
    Ok(Some((version, random, session_id, hello_end)))
}

async fn parse_tls_client_hello<S: AsyncRead + Unpin>(
    mut cur: PeekCursor<'_, S>,
) -> io::Result<Option<ClientHelloInfo>> {
    let Some((version, random, session_id, hello_end)) =
        parse_tls_hello_prefix(&mut cur, CLIENT_HELLO, 2).await?
    else {
        return Ok(None);
    };

    let cipher_len = cur.u16() as usize;
    if cipher_len % 2 != 0 || !cur.need(cipher_len + 1).await? {
        return Ok(None);
    }
    let ciphers = (0..cipher_len / 2).map(|_| cur.u16() as u32).collect();

    let compression_len = cur.u8() as usize;
    if !cur.need(compression_len).await? {
        return Ok(None);
    }
    let compression_data = cur.bytes(compression_len);

    let extensions = if version.has_extensions() && cur.pos < hello_end {
        match read_extensions(&mut cur, true).await? {
            Some(ext) => ext,
            None => return Ok(None),
        }
    } else {
        BTreeMap::new()
    };

    Ok(Some(ClientHelloInfo {
        framing: HandshakeFraming::TlsRecord,
        version,
        random,
        session_id,
        ciphers,
        compression_data,
        extensions,
        handshake_length: hello_end,
    }))
}

async fn parse_tls_server_hello<S: AsyncRead + Unpin>(
    mut cur: PeekCursor<'_, S>,
) -> io::Result<Option<ServerHelloInfo>> {
    let Some((version, random, session_id, hello_end)) =
        parse_tls_hello_prefix(&mut cur, SERVER_HELLO, 3).await?
    else {
        return Ok(None);
    };

    let cipher = cur.u16() as u32;
    let compression_method = cur.u8();

    let extensions = if version.has_extensions() && cur.pos < hello_end {
        match read_extensions(&mut cur, false).await? {
            Some(ext) => ext,
            None => return Ok(None),
        }
    } else {
        BTreeMap::new()
    };

    Ok(Some(ServerHelloInfo {
        framing: HandshakeFraming::TlsRecord,
        version,
        random,
        session_id,
        cipher,
        compression_method,
        extensions,
        handshake_length: hello_end,
    }))
}

async fn read_extensions<S: AsyncRead + Unpin>(
    cur: &mut PeekCursor<'_, S>,
    is_client: bool,
) -> io::Result<Option<BTreeMap<u16, TlsExtension>>> {
    if !cur.need(2).await? {
        return Ok(None);
    }
    let total = cur.u16() as usize;
    if !cur.need(total).await? {
        return Ok(None);
    }

    let end = cur.pos + total;
    let mut extensions = BTreeMap::new();
    let mut position = 0;
    while cur.pos + 4 <= end {
        let id = cur.u16();
        let len = cur.u16() as usize;
        if cur.pos + len > end {
            return Ok(None);
        }
        let data = cur.bytes(len);
        let value = decode_extension(id, &data, is_client);
        extensions
            .entry(id)
            .or_insert(TlsExtension {
                id,
                position,
                value,
            });
        position += 1;
    }
    Ok(Some(extensions))
}

/// Decode a known extension payload. Malformed payloads are kept raw.
pub fn decode_extension(id: u16, data: &[u8], is_client: bool) -> ExtensionValue {
    let decoded = match id {
        EXT_SERVER_NAME => decode_server_names(data).map(ExtensionValue::ServerName),
        EXT_ALPN => decode_alpn(data).map(ExtensionValue::Alpn),
        EXT_SUPPORTED_VERSIONS if is_client => {
            u8_prefixed(data).and_then(u16_list).map(ExtensionValue::SupportedVersions)
        }
        EXT_SUPPORTED_VERSIONS => u16_list(data).map(ExtensionValue::SupportedVersions),
        EXT_SUPPORTED_GROUPS => u16_prefixed(data)
            .and_then(u16_list)
            .map(ExtensionValue::SupportedGroups),
        EXT_EC_POINT_FORMATS => u8_prefixed(data)
            .map(|d| d.to_vec())
            .map(ExtensionValue::EcPointFormats),
        EXT_SIGNATURE_ALGORITHMS => u16_prefixed(data)
            .and_then(u16_list)
            .map(ExtensionValue::SignatureAlgorithms),
        _ => None,
    };
    decoded.unwrap_or_else(|| ExtensionValue::Raw(data.to_vec()))
}

fn u8_prefixed(data: &[u8]) -> Option<&[u8]> {
    let (&len, rest) = data.split_first()?;
    rest.get(..len as usize)
}

fn u16_prefixed(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    data[2..].get(..len)
}

fn u16_list(data: &[u8]) -> Option<Vec<u16>> {
    if data.len() % 2 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect(),
    )
}

fn decode_server_names(data: &[u8]) -> Option<Vec<String>> {
    let mut list = u16_prefixed(data)?;
    let mut names = Vec::new();
    while !list.is_empty() {
        if list.len() < 3 {
            return None;
        }
        let name_type = list[0];
        let len = u16::from_be_bytes([list[1], list[2]]) as usize;
        let name = list.get(3..3 + len)?;
        if name_type == 0 {
            names.push(String::from_utf8_lossy(name).into_owned());
        }
        list = &list[3 + len..];
    }
    Some(names)
}

fn decode_alpn(data: &[u8]) -> Option<Vec<String>> {
    let mut list = u16_prefixed(data)?;
    let mut protocols = Vec::new();
    while let Some((&len, rest)) = list.split_first() {
        let proto = rest.get(..len as usize)?;
        protocols.push(String::from_utf8_lossy(proto).into_owned());
        list = &rest[len as usize..];
    }
    Some(protocols)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::BufferPool;
    use tokio_test::io::Builder;

    fn ext(id: u16, body: &[u8]) -> Vec<u8> {
        let mut out = id.to_be_bytes().to_vec();
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    /// A TLS 1.2 ClientHello record offering SNI and ALPN.
    pub(crate) fn client_hello_record(sni: &str) -> Vec<u8> {
        let mut sni_entry = vec![0u8];
        sni_entry.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(sni.as_bytes());
        let mut sni_body = (sni_entry.len() as u16).to_be_bytes().to_vec();
        sni_body.extend_from_slice(&sni_entry);

        let alpn_body = [0u8, 12, 2, b'h', b'2', 8, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1'];

        let mut extensions = ext(0, &sni_body);
        extensions.extend(ext(16, &alpn_body));
        extensions.extend(ext(11, &[1, 0]));

        let mut body = vec![3, 3];
        body.extend_from_slice(&[7u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0, 4, 0xc0, 0x2f, 0x00, 0x9c]);
        body.extend_from_slice(&[1, 0]); // compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE_RECORD, 3, 1];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn server_hello_record() -> Vec<u8> {
        let mut extensions = ext(43, &[3, 4]);
        extensions.extend(ext(16, &[0, 9, 8, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1']));

        let mut body = vec![3, 3];
        body.extend_from_slice(&[9u8; 32]);
        body.push(4);
        body.extend_from_slice(&[1, 2, 3, 4]);
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![SERVER_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE_RECORD, 3, 3];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn parses_sni_from_client_hello() {
        let record = client_hello_record("example.com");
        let mock = Builder::new().read(&record).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(4096));

        let hello = peek_client_hello(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.sni().as_deref(), Some("example.com"));
        assert_eq!(hello.framing, HandshakeFraming::TlsRecord);
        assert_eq!(hello.version, TlsVersion::TLS12);
        assert_eq!(hello.ciphers, vec![0xc02f, 0x009c]);
        assert_eq!(
            hello.alpn().unwrap(),
            &["h2".to_string(), "http/1.1".to_string()]
        );
        assert_eq!(hello.handshake_length, record.len());
        assert_eq!(
            hello.extensions[&EXT_EC_POINT_FORMATS].value,
            ExtensionValue::EcPointFormats(vec![0])
        );
        // nothing consumed
        assert_eq!(stream.available(), record.len());
    }

    #[tokio::test]
    async fn client_hello_split_across_reads() {
        let record = client_hello_record("split.example.org");
        let mock = Builder::new()
            .read(&record[..3])
            .read(&record[3..50])
            .read(&record[50..])
            .build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(4096));
        let hello = peek_client_hello(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.sni().as_deref(), Some("split.example.org"));
    }

    #[tokio::test]
    async fn plain_http_is_not_tls_and_not_consumed() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\n").build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(4096));
        assert!(peek_client_hello(&mut stream).await.unwrap().is_none());
        assert_eq!(
            stream.read_line().await.unwrap().as_deref(),
            Some("GET / HTTP/1.1")
        );
    }

    #[tokio::test]
    async fn truncated_hello_yields_none() {
        let record = client_hello_record("example.com");
        let mock = Builder::new().read(&record[..60]).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(4096));
        assert!(peek_client_hello(&mut stream).await.unwrap().is_none());
        assert_eq!(stream.available(), 60);
    }

    #[tokio::test]
    async fn hello_larger_than_buffer_yields_none() {
        let record = client_hello_record("example.com");
        let mock = Builder::new().read(&record[..64]).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(64));
        assert!(peek_client_hello(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parses_server_hello() {
        let record = server_hello_record();
        let mock = Builder::new().read(&record).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(4096));
        let hello = peek_server_hello(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.session_id, vec![1, 2, 3, 4]);
        assert_eq!(hello.cipher, 0x1301);
        assert_eq!(hello.protocol(), TlsVersion::TLS13);
        assert_eq!(hello.alpn(), Some("http/1.1"));
        assert_eq!(hello.cipher_name(), "TLS_AES_128_GCM_SHA256");
    }

    #[tokio::test]
    async fn parses_ssl2_client_hello() {
        // type 1, version 3.1, one cipher spec, no session id, 16 byte challenge
        let mut msg = vec![CLIENT_HELLO, 3, 1, 0, 3, 0, 0, 0, 16];
        msg.extend_from_slice(&[0x00, 0x00, 0x2f]);
        msg.extend_from_slice(&[5u8; 16]);
        let mut record = vec![SSL2_RECORD, msg.len() as u8];
        record.extend_from_slice(&msg);

        let mock = Builder::new().read(&record).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(256));
        let hello = peek_client_hello(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.framing, HandshakeFraming::Ssl2);
        assert_eq!(hello.ciphers, vec![0x2f]);
        assert_eq!(hello.random.len(), 16);
        assert_eq!(hello.handshake_length, record.len());
        assert!(hello.sni().is_none());
    }

    #[tokio::test]
    async fn real_rustls_client_hello() {
        use rustls::pki_types::ServerName;
        use std::sync::Arc;

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let name = ServerName::try_from("www.example.com").unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut wire = Vec::new();
        conn.write_tls(&mut wire).unwrap();

        let mock = Builder::new().read(&wire).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(8192));
        let hello = peek_client_hello(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.sni().as_deref(), Some("www.example.com"));
        assert_eq!(hello.protocol(), TlsVersion::TLS13);
        assert_eq!(hello.alpn().unwrap(), &["http/1.1".to_string()]);
    }

    #[test]
    fn malformed_extension_stays_raw() {
        assert_eq!(
            decode_extension(EXT_SERVER_NAME, &[0, 9, 0], true),
            ExtensionValue::Raw(vec![0, 9, 0])
        );
    }
}
