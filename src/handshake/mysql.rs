//! MySQL handshake emulation
//!
//! MySQL servers speak first, so the proxy greets the client itself, reads
//! the HandshakeResponse41 to learn the username, and only then dials the
//! backend that owns it. The client's first auth answer was computed against
//! our scramble, which the backend would reject. The proxy therefore reads the
//! backend's real greeting, asks the client to re-authenticate with an
//! AuthSwitchRequest carrying the backend's scramble and plugin, and hands a
//! rewritten HandshakeResponse to the backend. The remaining auth round-trips
//! are relayed with sequence ids shifted by two (the client has seen two more
//! packets than the backend). After OK or ERR the session is spliced raw.

use super::{ClientHello, HandshakeError, HelloDetail, IdentitySource, Protocol};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_NO_SCHEMA: u32 = 0x0000_0010;
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_ODBC: u32 = 0x0000_0040;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_IGNORE_SPACE: u32 = 0x0000_0100;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x0000_1000;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_RESERVED: u32 = 0x0000_4000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 0x0040_0000;
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
pub const CLIENT_OPTIONAL_RESULTSET_METADATA: u32 = 0x0200_0000;
pub const CLIENT_ZSTD_COMPRESSION: u32 = 0x0400_0000;
pub const CLIENT_QUERY_ATTRIBUTES: u32 = 0x0800_0000;

/// Capabilities the proxy can never pass through
const STRIPPED_CAPABILITIES: u32 = CLIENT_SSL | CLIENT_COMPRESS | CLIENT_ZSTD_COMPRESSION;

/// Capabilities that change how packets after authentication are framed.
/// Client and backend must agree on every one of them.
const WIRE_FORMAT_CAPABILITIES: u32 = CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_SESSION_TRACK
    | CLIENT_DEPRECATE_EOF
    | CLIENT_OPTIONAL_RESULTSET_METADATA
    | CLIENT_QUERY_ATTRIBUTES;

/// Wire-format extensions never offered to clients, since a tenant's
/// backend may be too old to support them
const UNOFFERED_CAPABILITIES: u32 =
    CLIENT_SESSION_TRACK | CLIENT_DEPRECATE_EOF | CLIENT_OPTIONAL_RESULTSET_METADATA | CLIENT_QUERY_ATTRIBUTES;

/// Advertised before any real backend greeting has been seen
const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_NO_SCHEMA
    | CLIENT_ODBC
    | CLIENT_LOCAL_FILES
    | CLIENT_IGNORE_SPACE
    | CLIENT_PROTOCOL_41
    | CLIENT_INTERACTIVE
    | CLIENT_IGNORE_SIGPIPE
    | CLIENT_TRANSACTIONS
    | CLIENT_RESERVED
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS;

const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";
const UTF8MB4_GENERAL_CI: u8 = 45;
const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
const SCRAMBLE_LEN: usize = 20;

/// Bound on auth round-trips relayed after the switch
const MAX_AUTH_ROUNDS: usize = 16;

const OK_HEADER: u8 = 0x00;
const AUTH_MORE_DATA: u8 = 0x01;
const AUTH_SWITCH: u8 = 0xfe;
const ERR_HEADER: u8 = 0xff;
const FAST_AUTH_SUCCESS: [u8; 2] = [AUTH_MORE_DATA, 0x03];

const ER_HANDSHAKE_ERROR: u16 = 1043;
const ER_ACCESS_DENIED_ERROR: u16 = 1045;

fn malformed(reason: &str) -> HandshakeError {
    HandshakeError::malformed(Protocol::Mysql, reason)
}

/// Server greeting (Protocol::HandshakeV10)
#[derive(Debug, Clone, PartialEq)]
pub struct Greeting {
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: String,
}

impl Greeting {
    pub fn parse(payload: &[u8]) -> Result<Self, HandshakeError> {
        let mut r = Reader::new(payload);
        if r.u8()? != 10 {
            return Err(malformed("unsupported greeting version"));
        }
        let server_version = r.cstr()?;
        let connection_id = r.u32()?;
        let mut scramble = r.bytes(8)?.to_vec();
        r.skip(1)?;
        let cap_low = r.u16()? as u32;

        let mut greeting = Greeting {
            server_version: String::from_utf8_lossy(server_version).into_owned(),
            connection_id,
            scramble: Vec::new(),
            capabilities: cap_low,
            charset: UTF8MB4_GENERAL_CI,
            status: 0,
            auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
        };

        if r.is_empty() {
            greeting.scramble = scramble;
            return Ok(greeting);
        }

        greeting.charset = r.u8()?;
        greeting.status = r.u16()?;
        greeting.capabilities |= (r.u16()? as u32) << 16;
        let auth_len = r.u8()? as usize;
        r.skip(10)?;

        if greeting.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_len.saturating_sub(8).max(13);
            let part2 = r.bytes(part2_len.min(r.remaining()))?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            scramble.extend_from_slice(part2);
        }
        greeting.scramble = scramble;

        if greeting.capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            greeting.auth_plugin = String::from_utf8_lossy(r.cstr_or_rest()).into_owned();
        }

        Ok(greeting)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.push(10);
        out.extend_from_slice(self.server_version.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.connection_id.to_le_bytes());

        let (part1, part2) = self.scramble.split_at(self.scramble.len().min(8));
        out.extend_from_slice(part1);
        out.push(0);
        out.extend_from_slice(&(self.capabilities as u16).to_le_bytes());
        out.push(self.charset);
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&((self.capabilities >> 16) as u16).to_le_bytes());
        out.push((self.scramble.len() + 1) as u8);
        out.extend_from_slice(&[0u8; 10]);
        out.extend_from_slice(part2);
        out.push(0);
        out.extend_from_slice(self.auth_plugin.as_bytes());
        out.push(0);
        out
    }
}

/// Client's HandshakeResponse41
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
    /// Raw connect attributes (without their length prefix)
    pub connect_attrs: Option<Vec<u8>>,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, HandshakeError> {
        let mut r = Reader::new(payload);
        let capabilities = r.u32()?;

        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(HandshakeError::unsupported(Protocol::Mysql, "pre-4.1 protocol"));
        }
        if capabilities & CLIENT_SSL != 0 && payload.len() <= 32 {
            return Err(HandshakeError::unsupported(Protocol::Mysql, "TLS was requested but not offered"));
        }

        let max_packet_size = r.u32()?;
        let charset = r.u8()?;
        r.skip(23)?;
        let username = String::from_utf8_lossy(r.cstr()?).into_owned();

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let len = r.lenenc()? as usize;
            r.bytes(len)?.to_vec()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        } else {
            r.cstr()?.to_vec()
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            Some(String::from_utf8_lossy(r.cstr_or_rest()).into_owned())
        } else {
            None
        };

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            Some(String::from_utf8_lossy(r.cstr_or_rest()).into_owned())
        } else {
            None
        };

        let connect_attrs = if capabilities & CLIENT_CONNECT_ATTRS != 0 && !r.is_empty() {
            let len = r.lenenc()? as usize;
            Some(r.bytes(len)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            auth_response,
            database,
            auth_plugin,
            connect_attrs,
        })
    }

    /// Re-encode for a backend that negotiated `capabilities`
    pub fn encode(&self, capabilities: u32, auth_response: &[u8], auth_plugin: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.username.len() + auth_response.len());
        out.extend_from_slice(&capabilities.to_le_bytes());
        out.extend_from_slice(&self.max_packet_size.to_le_bytes());
        out.push(self.charset);
        out.extend_from_slice(&[0u8; 23]);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);

        if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc(&mut out, auth_response.len() as u64);
            out.extend_from_slice(auth_response);
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            out.push(auth_response.len().min(255) as u8);
            out.extend_from_slice(&auth_response[..auth_response.len().min(255)]);
        } else {
            out.extend_from_slice(auth_response);
            out.push(0);
        }

        if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            out.extend_from_slice(self.database.as_deref().unwrap_or("").as_bytes());
            out.push(0);
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            out.extend_from_slice(auth_plugin.as_bytes());
            out.push(0);
        }
        if capabilities & CLIENT_CONNECT_ATTRS != 0 {
            let attrs = self.connect_attrs.as_deref().unwrap_or(&[]);
            put_lenenc(&mut out, attrs.len() as u64);
            out.extend_from_slice(attrs);
        }
        out
    }
}

struct Template {
    server_version: String,
    capabilities: u32,
    charset: u8,
    learned: bool,
}

/// Shape of the synthetic greeting, refined by the first real backend greeting
pub struct GreetingTemplate {
    inner: RwLock<Template>,
    next_connection_id: AtomicU32,
}

impl GreetingTemplate {
    pub fn new(server_version: &str) -> Self {
        Self {
            inner: RwLock::new(Template {
                server_version: server_version.to_string(),
                capabilities: DEFAULT_CAPABILITIES,
                charset: UTF8MB4_GENERAL_CI,
                learned: false,
            }),
            next_connection_id: AtomicU32::new(1),
        }
    }

    /// Adopt a real backend's version and capabilities, once
    pub fn learn(&self, greeting: &Greeting) {
        if self.inner.read().learned {
            return;
        }
        let mut template = self.inner.write();
        if template.learned {
            return;
        }
        template.server_version = greeting.server_version.clone();
        template.capabilities =
            (greeting.capabilities & !(STRIPPED_CAPABILITIES | UNOFFERED_CAPABILITIES)) | CLIENT_PLUGIN_AUTH;
        template.charset = greeting.charset;
        template.learned = true;
        debug!(
            server_version = %template.server_version,
            capabilities = format_args!("{:#010x}", template.capabilities),
            "Learned MySQL greeting template"
        );
    }

    pub fn capabilities(&self) -> u32 {
        self.inner.read().capabilities
    }

    /// Fresh greeting with a random scramble
    pub fn synthesize(&self) -> Greeting {
        let template = self.inner.read();
        let mut rng = rand::thread_rng();
        // Scramble bytes must be non-zero and avoid '$' for old clients
        let scramble: Vec<u8> = (0..SCRAMBLE_LEN)
            .map(|_| {
                let b: u8 = rng.gen_range(1..=127);
                if b == b'$' { b'#' } else { b }
            })
            .collect();

        Greeting {
            server_version: template.server_version.clone(),
            connection_id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            scramble,
            capabilities: template.capabilities,
            charset: template.charset,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
        }
    }
}

pub(crate) async fn read_client_hello<S>(
    client: &mut S,
    template: &GreetingTemplate,
    max_bytes: usize,
) -> Result<ClientHello, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = template.synthesize();
    write_packet(client, 0, &greeting.encode()).await?;

    let (_, payload) = read_packet(client, max_bytes).await?;
    let response = HandshakeResponse::parse(&payload)?;

    if response.username.is_empty() {
        return Err(malformed("empty username"));
    }
    if response.capabilities & CLIENT_PLUGIN_AUTH == 0 {
        return Err(HandshakeError::unsupported(Protocol::Mysql, "client lacks plugin authentication"));
    }

    Ok(ClientHello {
        identity: response.username.clone(),
        source: IdentitySource::Handshake,
        preamble: Vec::new(),
        detail: HelloDetail::Mysql {
            response,
            offered: greeting.capabilities,
        },
    })
}

/// Complete authentication between the client and a freshly dialed backend.
///
/// `offered` is the capability set of the synthetic greeting the client
/// answered.
pub(crate) async fn bridge_authentication<C, B>(
    response: &HandshakeResponse,
    offered: u32,
    client: &mut C,
    backend: &mut B,
    template: &GreetingTemplate,
    max_bytes: usize,
) -> Result<(), HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (_, payload) = read_packet(backend, max_bytes).await?;
    if payload.first() == Some(&ERR_HEADER) {
        write_packet(client, 2, &payload).await?;
        return Err(HandshakeError::Backend(error_message(&payload)));
    }
    let greeting = Greeting::parse(&payload)?;
    template.learn(&greeting);

    let negotiated = response.capabilities & offered;
    let missing = negotiated & !greeting.capabilities & WIRE_FORMAT_CAPABILITIES;
    if missing != 0 {
        let message = format!("Backend does not support client capabilities {:#010x}", missing);
        write_packet(client, 2, &error_payload(ER_HANDSHAKE_ERROR, b"08S01", &message)).await?;
        return Err(HandshakeError::Backend(message));
    }

    // Ask the client to answer the backend's own challenge
    let mut switch = Vec::with_capacity(greeting.auth_plugin.len() + greeting.scramble.len() + 3);
    switch.push(AUTH_SWITCH);
    switch.extend_from_slice(greeting.auth_plugin.as_bytes());
    switch.push(0);
    switch.extend_from_slice(&greeting.scramble);
    switch.push(0);
    write_packet(client, 2, &switch).await?;

    let (_, auth_data) = read_packet(client, max_bytes).await?;

    let capabilities = negotiated & greeting.capabilities & !STRIPPED_CAPABILITIES;
    let rewritten = response.encode(capabilities, &auth_data, &greeting.auth_plugin);
    write_packet(backend, 1, &rewritten).await?;

    for _ in 0..MAX_AUTH_ROUNDS {
        let (seq, packet) = read_packet(backend, max_bytes).await?;
        write_packet(client, seq.wrapping_add(2), &packet).await?;

        match packet.first().copied() {
            Some(OK_HEADER) => return Ok(()),
            Some(ERR_HEADER) => return Err(HandshakeError::Backend(error_message(&packet))),
            Some(AUTH_MORE_DATA) if packet == FAST_AUTH_SUCCESS => continue,
            Some(AUTH_MORE_DATA) | Some(AUTH_SWITCH) => {
                let (seq, reply) = read_packet(client, max_bytes).await?;
                write_packet(backend, seq.wrapping_sub(2), &reply).await?;
            }
            _ => return Err(malformed("unexpected packet during authentication")),
        }
    }

    Err(malformed("too many authentication rounds"))
}

/// ERR packet answering the client's HandshakeResponse
pub(crate) fn rejection(user: &str) -> Vec<u8> {
    let message = format!("Access denied for user '{}'", user);
    frame(2, &error_payload(ER_ACCESS_DENIED_ERROR, b"28000", &message))
}

fn error_payload(code: u16, sql_state: &[u8; 5], message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(message.len() + 9);
    payload.push(ERR_HEADER);
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(sql_state);
    payload.extend_from_slice(message.as_bytes());
    payload
}

fn error_message(payload: &[u8]) -> String {
    if payload.len() < 3 {
        return "malformed error packet".to_string();
    }
    let code = u16::from_le_bytes([payload[1], payload[2]]);
    let text = match payload.get(3) {
        Some(b'#') if payload.len() >= 9 => &payload[9..],
        _ => &payload[3..],
    };
    format!("{} {}", code, String::from_utf8_lossy(text))
}

fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&len.to_le_bytes()[..3]);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

pub async fn write_packet<W>(w: &mut W, seq: u8, payload: &[u8]) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&frame(seq, payload)).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_packet<R>(r: &mut R, max_bytes: usize) -> Result<(u8, Vec<u8>), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await.map_err(eof_as_closed)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    if len > max_bytes {
        return Err(HandshakeError::TooLarge { limit: max_bytes });
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    Ok((header[3], payload))
}

fn eof_as_closed(e: std::io::Error) -> HandshakeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        HandshakeError::Closed
    } else {
        HandshakeError::Io(e)
    }
}

fn put_lenenc(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=250 => out.push(n as u8),
        251..=0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], HandshakeError> {
        if self.remaining() < n {
            return Err(malformed("truncated packet"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), HandshakeError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, HandshakeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, HandshakeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, HandshakeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn lenenc(&mut self) -> Result<u64, HandshakeError> {
        match self.u8()? {
            n @ 0..=250 => Ok(n as u64),
            0xfc => Ok(self.u16()? as u64),
            0xfd => {
                let b = self.bytes(3)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64)
            }
            0xfe => {
                let b = self.bytes(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                Ok(u64::from_le_bytes(arr))
            }
            _ => Err(malformed("invalid length-encoded integer")),
        }
    }

    /// NUL-terminated string; the terminator is consumed
    fn cstr(&mut self) -> Result<&'a [u8], HandshakeError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("unterminated string"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// NUL-terminated string, tolerating a missing terminator at end of packet
    fn cstr_or_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.buf.len();
                rest
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_CAPS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_CONNECT_ATTRS
        | CLIENT_DEPRECATE_EOF
        | CLIENT_TRANSACTIONS;

    fn client_response(user: &str) -> HandshakeResponse {
        HandshakeResponse {
            capabilities: CLIENT_CAPS,
            max_packet_size: 16 * 1024 * 1024,
            charset: UTF8MB4_GENERAL_CI,
            username: user.to_string(),
            auth_response: vec![0xaa; 20],
            database: Some("shop".to_string()),
            auth_plugin: Some(DEFAULT_AUTH_PLUGIN.to_string()),
            connect_attrs: Some(vec![3, b'_', b'o', b's', 5, b'l', b'i', b'n', b'u', b'x']),
        }
    }

    fn backend_greeting() -> Greeting {
        Greeting {
            server_version: "8.0.36".to_string(),
            connection_id: 42,
            scramble: (1..=20).collect(),
            capabilities: DEFAULT_CAPABILITIES
                | CLIENT_SSL
                | CLIENT_SESSION_TRACK
                | CLIENT_DEPRECATE_EOF
                | CLIENT_QUERY_ATTRIBUTES,
            charset: 255,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: "caching_sha2_password".to_string(),
        }
    }

    #[test]
    fn test_greeting_encode_parse() {
        let greeting = backend_greeting();
        let parsed = Greeting::parse(&greeting.encode()).unwrap();
        assert_eq!(parsed, greeting);
    }

    #[test]
    fn test_handshake_response_parse() {
        let response = client_response("app_owner");
        let encoded = response.encode(CLIENT_CAPS, &response.auth_response, DEFAULT_AUTH_PLUGIN);
        let parsed = HandshakeResponse::parse(&encoded).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_handshake_response_secure_connection_only() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        let mut response = client_response("legacy");
        response.capabilities = caps;
        response.database = None;
        response.connect_attrs = None;

        let parsed = HandshakeResponse::parse(&response.encode(caps, &[7u8; 20], "mysql_native_password")).unwrap();
        assert_eq!(parsed.username, "legacy");
        assert_eq!(parsed.auth_response, vec![7u8; 20]);
        assert!(parsed.database.is_none());
    }

    #[test]
    fn test_ssl_request_is_unsupported() {
        let mut payload = (CLIENT_PROTOCOL_41 | CLIENT_SSL).to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 28]);
        let err = HandshakeResponse::parse(&payload).unwrap_err();
        assert!(matches!(err, HandshakeError::Unsupported { .. }));
    }

    #[test]
    fn test_template_learns_once_and_strips_ssl() {
        let template = GreetingTemplate::new("8.0.36-deployra");
        assert_eq!(template.capabilities(), DEFAULT_CAPABILITIES);

        template.learn(&backend_greeting());
        assert_eq!(template.capabilities() & CLIENT_SSL, 0);
        assert_eq!(template.capabilities() & UNOFFERED_CAPABILITIES, 0);
        let synthetic = template.synthesize();
        assert_eq!(synthetic.server_version, "8.0.36");
        assert_eq!(synthetic.scramble.len(), SCRAMBLE_LEN);
        assert!(synthetic.scramble.iter().all(|&b| b != 0));

        let mut other = backend_greeting();
        other.server_version = "5.7.44".to_string();
        template.learn(&other);
        assert_eq!(template.synthesize().server_version, "8.0.36");
    }

    #[test]
    fn test_rejection_packet() {
        let packet = rejection("ghost");
        assert_eq!(packet[3], 2);
        assert_eq!(packet[4], ERR_HEADER);
        assert_eq!(u16::from_le_bytes([packet[5], packet[6]]), 1045);
        assert_eq!(&packet[7..13], b"#28000");
        let len = u32::from_le_bytes([packet[0], packet[1], packet[2], 0]) as usize;
        assert_eq!(len, packet.len() - 4);
    }

    #[tokio::test]
    async fn test_read_client_hello_extracts_username() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        let template = GreetingTemplate::new("8.0.36-deployra");

        let task = tokio::spawn(async move { read_client_hello(&mut proxy, &template, 16 * 1024).await });

        let (seq, greeting) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(seq, 0);
        let greeting = Greeting::parse(&greeting).unwrap();
        assert_eq!(greeting.server_version, "8.0.36-deployra");

        let response = client_response("app_owner");
        write_packet(&mut client, 1, &response.encode(CLIENT_CAPS, &[1; 20], DEFAULT_AUTH_PLUGIN))
            .await
            .unwrap();

        let hello = task.await.unwrap().unwrap();
        assert_eq!(hello.identity, "app_owner");
        assert!(hello.preamble.is_empty());
    }

    #[tokio::test]
    async fn test_bridge_authentication_relays_full_auth() {
        let (mut client, mut proxy_client) = tokio::io::duplex(8192);
        let (mut proxy_backend, mut backend) = tokio::io::duplex(8192);
        let template = GreetingTemplate::new("8.0.36-deployra");
        let response = client_response("app_owner");

        let bridge = tokio::spawn(async move {
            let offered = template.capabilities();
            bridge_authentication(&response, offered, &mut proxy_client, &mut proxy_backend, &template, 16 * 1024)
                .await
        });

        // Backend greets with its own scramble
        let greeting = backend_greeting();
        write_packet(&mut backend, 0, &greeting.encode()).await.unwrap();

        // Client is asked to switch to the backend's challenge
        let (seq, switch) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(seq, 2);
        assert_eq!(switch[0], AUTH_SWITCH);
        assert!(switch.starts_with(b"\xfecaching_sha2_password\0"));
        assert_eq!(&switch[switch.len() - 21..switch.len() - 1], greeting.scramble.as_slice());
        write_packet(&mut client, 3, &[0x55; 32]).await.unwrap();

        // Backend receives a rewritten response with the new auth data
        let (seq, rewritten) = read_packet(&mut backend, 4096).await.unwrap();
        assert_eq!(seq, 1);
        let rewritten = HandshakeResponse::parse(&rewritten).unwrap();
        assert_eq!(rewritten.username, "app_owner");
        assert_eq!(rewritten.auth_response, vec![0x55; 32]);
        assert_eq!(rewritten.auth_plugin.as_deref(), Some("caching_sha2_password"));
        assert_eq!(rewritten.database.as_deref(), Some("shop"));
        assert_eq!(rewritten.capabilities & CLIENT_SSL, 0);

        // Full authentication: more data, client answers, then OK
        write_packet(&mut backend, 2, &[AUTH_MORE_DATA, 0x04]).await.unwrap();
        let (seq, more) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(seq, 4);
        assert_eq!(more, vec![AUTH_MORE_DATA, 0x04]);

        write_packet(&mut client, 5, b"secret\0").await.unwrap();
        let (seq, password) = read_packet(&mut backend, 4096).await.unwrap();
        assert_eq!(seq, 3);
        assert_eq!(password, b"secret\0");

        write_packet(&mut backend, 4, &[OK_HEADER, 0, 0, 2, 0, 0, 0]).await.unwrap();
        let (seq, ok) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(seq, 6);
        assert_eq!(ok[0], OK_HEADER);

        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bridge_authentication_fast_auth_path() {
        let (mut client, mut proxy_client) = tokio::io::duplex(8192);
        let (mut proxy_backend, mut backend) = tokio::io::duplex(8192);
        let template = GreetingTemplate::new("8.0.36-deployra");
        let response = client_response("app_owner");

        let bridge = tokio::spawn(async move {
            let offered = template.capabilities();
            bridge_authentication(&response, offered, &mut proxy_client, &mut proxy_backend, &template, 16 * 1024)
                .await
        });

        write_packet(&mut backend, 0, &backend_greeting().encode()).await.unwrap();
        read_packet(&mut client, 4096).await.unwrap();
        write_packet(&mut client, 3, &[0x11; 32]).await.unwrap();
        read_packet(&mut backend, 4096).await.unwrap();

        write_packet(&mut backend, 2, &FAST_AUTH_SUCCESS).await.unwrap();
        write_packet(&mut backend, 3, &[OK_HEADER, 0, 0, 2, 0, 0, 0]).await.unwrap();

        let (seq, fast) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!((seq, fast.as_slice()), (4, &FAST_AUTH_SUCCESS[..]));
        let (seq, ok) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!((seq, ok[0]), (5, OK_HEADER));

        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bridge_authentication_backend_error_reaches_client() {
        let (mut client, mut proxy_client) = tokio::io::duplex(8192);
        let (mut proxy_backend, mut backend) = tokio::io::duplex(8192);
        let template = GreetingTemplate::new("8.0.36-deployra");
        let response = client_response("app_owner");

        let bridge = tokio::spawn(async move {
            let offered = template.capabilities();
            bridge_authentication(&response, offered, &mut proxy_client, &mut proxy_backend, &template, 16 * 1024)
                .await
        });

        write_packet(&mut backend, 0, &backend_greeting().encode()).await.unwrap();
        read_packet(&mut client, 4096).await.unwrap();
        write_packet(&mut client, 3, &[0x11; 20]).await.unwrap();
        read_packet(&mut backend, 4096).await.unwrap();

        let denied = rejection("app_owner");
        write_packet(&mut backend, 2, &denied[4..]).await.unwrap();

        let (seq, err) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(seq, 4);
        assert_eq!(err[0], ERR_HEADER);
        assert!(matches!(bridge.await.unwrap(), Err(HandshakeError::Backend(_))));
    }

    fn older_backend_greeting() -> Greeting {
        Greeting {
            server_version: "5.7.44".to_string(),
            capabilities: DEFAULT_CAPABILITIES,
            auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
            ..backend_greeting()
        }
    }

    #[tokio::test]
    async fn test_bridge_agrees_on_deprecate_eof_with_older_backend() {
        let (mut client, mut proxy_client) = tokio::io::duplex(8192);
        let (mut proxy_backend, mut backend) = tokio::io::duplex(8192);
        let template = GreetingTemplate::new("8.0.36-deployra");
        template.learn(&backend_greeting());

        // Client answers a greeting built after an 8.0 backend was seen
        let offered = template.synthesize().capabilities;
        let response = client_response("app_owner");
        let client_deprecate_eof = response.capabilities & offered & CLIENT_DEPRECATE_EOF != 0;

        let bridge = tokio::spawn(async move {
            bridge_authentication(&response, offered, &mut proxy_client, &mut proxy_backend, &template, 16 * 1024)
                .await
        });

        write_packet(&mut backend, 0, &older_backend_greeting().encode()).await.unwrap();
        let (_, switch) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(switch[0], AUTH_SWITCH);
        write_packet(&mut client, 3, &[0x22; 20]).await.unwrap();

        let (_, rewritten) = read_packet(&mut backend, 4096).await.unwrap();
        let rewritten = HandshakeResponse::parse(&rewritten).unwrap();
        let backend_deprecate_eof = rewritten.capabilities & CLIENT_DEPRECATE_EOF != 0;
        assert_eq!(client_deprecate_eof, backend_deprecate_eof);
        assert_eq!(rewritten.capabilities & WIRE_FORMAT_CAPABILITIES & !offered, 0);

        write_packet(&mut backend, 2, &[OK_HEADER, 0, 0, 2, 0, 0, 0]).await.unwrap();
        let (seq, ok) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!((seq, ok[0]), (4, OK_HEADER));
        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bridge_refuses_backend_missing_negotiated_capability() {
        let (mut client, mut proxy_client) = tokio::io::duplex(8192);
        let (mut proxy_backend, mut backend) = tokio::io::duplex(8192);
        let template = GreetingTemplate::new("8.0.36-deployra");
        let response = client_response("app_owner");

        // The client was offered DEPRECATE_EOF and took it
        let bridge = tokio::spawn(async move {
            bridge_authentication(&response, CLIENT_CAPS, &mut proxy_client, &mut proxy_backend, &template, 16 * 1024)
                .await
        });

        write_packet(&mut backend, 0, &older_backend_greeting().encode()).await.unwrap();

        let (seq, err) = read_packet(&mut client, 4096).await.unwrap();
        assert_eq!(seq, 2);
        assert_eq!(err[0], ERR_HEADER);
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), ER_HANDSHAKE_ERROR);
        assert_eq!(&err[3..9], b"#08S01");
        assert!(matches!(bridge.await.unwrap(), Err(HandshakeError::Backend(_))));

        // Nothing was sent to the backend
        drop(client);
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
