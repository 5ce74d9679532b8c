//! PostgreSQL startup-packet identity extraction

use super::{ClientHello, HandshakeError, HelloDetail, IdentitySource, Protocol};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION_3: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Encryption negotiations we answer before giving up
const MAX_NEGOTIATIONS: usize = 2;

/// Parse the key/value block of a StartupMessage body (after the version)
pub fn parse_parameters(block: &[u8]) -> Result<Vec<(String, String)>, HandshakeError> {
    let mut params = Vec::new();
    let mut fields = block.split(|&b| b == 0);

    loop {
        let key = match fields.next() {
            Some(k) if !k.is_empty() => k,
            _ => break,
        };
        let value = fields
            .next()
            .ok_or_else(|| HandshakeError::malformed(Protocol::Postgresql, "parameter without value"))?;
        let key = String::from_utf8_lossy(key).into_owned();
        let value = String::from_utf8_lossy(value).into_owned();
        params.push((key, value));
    }

    Ok(params)
}

pub(crate) async fn read_client_hello<S>(client: &mut S, max_bytes: usize) -> Result<ClientHello, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut negotiations = 0;

    loop {
        let mut header = [0u8; 8];
        match client.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(HandshakeError::Closed),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len < 8 {
            return Err(HandshakeError::malformed(Protocol::Postgresql, "length below minimum"));
        }
        if len > max_bytes {
            return Err(HandshakeError::TooLarge { limit: max_bytes });
        }

        let mut body = vec![0u8; len - 8];
        client.read_exact(&mut body).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => HandshakeError::Closed,
            _ => e.into(),
        })?;

        match code {
            SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
                negotiations += 1;
                if negotiations > MAX_NEGOTIATIONS {
                    return Err(HandshakeError::malformed(Protocol::Postgresql, "repeated encryption requests"));
                }
                // Encryption is terminated outside this proxy
                client.write_all(b"N").await?;
                client.flush().await?;
            }
            CANCEL_REQUEST_CODE => return Err(HandshakeError::CancelRequest),
            PROTOCOL_VERSION_3 => {
                let params = parse_parameters(&body)?;
                let user = params
                    .into_iter()
                    .find(|(k, _)| k == "user")
                    .map(|(_, v)| v)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| HandshakeError::malformed(Protocol::Postgresql, "startup message without user"))?;

                let mut preamble = Vec::with_capacity(len);
                preamble.extend_from_slice(&header);
                preamble.extend_from_slice(&body);

                return Ok(ClientHello {
                    identity: user,
                    source: IdentitySource::Handshake,
                    preamble,
                    detail: HelloDetail::Postgres,
                });
            }
            other => {
                return Err(HandshakeError::unsupported(
                    Protocol::Postgresql,
                    format!("protocol version {}.{}", other >> 16, other & 0xffff),
                ))
            }
        }
    }
}

/// FATAL ErrorResponse with SQLSTATE 28000 (invalid_authorization_specification)
pub(crate) fn rejection(user: &str) -> Vec<u8> {
    let message = format!("role \"{}\" does not exist", user);
    let mut fields = Vec::new();
    for (tag, value) in [(b'S', "FATAL"), (b'V', "FATAL"), (b'C', "28000"), (b'M', message.as_str())] {
        fields.push(tag);
        fields.extend_from_slice(value.as_bytes());
        fields.push(0);
    }
    fields.push(0);

    let mut msg = Vec::with_capacity(fields.len() + 5);
    msg.push(b'E');
    msg.extend_from_slice(&((fields.len() + 4) as u32).to_be_bytes());
    msg.extend_from_slice(&fields);
    msg
}

/// Encode a StartupMessage; used by tests and tooling
pub fn startup_message(params: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
    for (k, v) in params {
        body.extend_from_slice(k.as_bytes());
        body.push(0);
        body.extend_from_slice(v.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut msg = Vec::with_capacity(body.len() + 4);
    msg.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    msg.extend_from_slice(&body);
    msg
}
