//! RESP (Redis-compatible) identity extraction
//!
//! The client speaks first. The first complete command decides the identity:
//! `AUTH <password>` authenticates the `default` user, `AUTH <user> <password>`
//! names the user, and `HELLO <ver> AUTH <user> <password>` follows the same
//! rule from the `AUTH` token. Anything else routes by peer address.

use super::{ClientHello, HandshakeError, HelloDetail, IdentitySource, Protocol};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// User implied by a single-argument AUTH
pub const DEFAULT_USER: &str = "default";

const MAX_ARGS: usize = 64;

/// Parse one command from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the arguments and
/// the number of bytes the command occupied.
pub fn parse_command(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, HandshakeError> {
    match buf.first() {
        None => Ok(None),
        Some(b'*') => parse_array(buf),
        Some(_) => parse_inline(buf),
    }
}

fn malformed(reason: &str) -> HandshakeError {
    HandshakeError::malformed(Protocol::Memory, reason)
}

/// Find `\r\n` starting at `from`, returning the index of `\r`
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}

fn parse_int(bytes: &[u8]) -> Result<i64, HandshakeError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| malformed("invalid length"))
}

fn parse_array(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, HandshakeError> {
    let Some(end) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let count = parse_int(&buf[1..end])?;
    if count < 1 || count as usize > MAX_ARGS {
        return Err(malformed("bad argument count"));
    }

    let mut pos = end + 2;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match buf.get(pos) {
            None => return Ok(None),
            Some(b'$') => {}
            Some(_) => return Err(malformed("expected bulk string")),
        }
        let Some(end) = find_crlf(buf, pos + 1) else {
            return Ok(None);
        };
        let len = parse_int(&buf[pos + 1..end])?;
        if len < 0 {
            return Err(malformed("null argument"));
        }
        let start = end + 2;
        let stop = start + len as usize;
        if buf.len() < stop + 2 {
            return Ok(None);
        }
        if &buf[stop..stop + 2] != b"\r\n" {
            return Err(malformed("bulk string not terminated"));
        }
        args.push(buf[start..stop].to_vec());
        pos = stop + 2;
    }

    Ok(Some((args, pos)))
}

fn parse_inline(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, HandshakeError> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let line = buf[..newline].strip_suffix(b"\r").unwrap_or(&buf[..newline]);
    let args: Vec<Vec<u8>> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_vec())
        .collect();

    if args.is_empty() {
        return Err(malformed("empty inline command"));
    }
    if args.len() > MAX_ARGS {
        return Err(malformed("bad argument count"));
    }
    Ok(Some((args, newline + 1)))
}

/// Identity claimed by a parsed command, if any.
///
/// The boolean reports whether the command attempted authentication.
pub fn identity_from_command(args: &[Vec<u8>]) -> (Option<String>, bool) {
    let Some(command) = args.first() else {
        return (None, false);
    };

    if command.eq_ignore_ascii_case(b"AUTH") {
        return (identity_from_auth_args(&args[1..]), true);
    }

    if command.eq_ignore_ascii_case(b"HELLO") {
        let auth = args
            .iter()
            .skip(1)
            .position(|a| a.eq_ignore_ascii_case(b"AUTH"))
            .map(|p| p + 1);
        if let Some(pos) = auth {
            let rest = &args[pos + 1..];
            let until_option = rest
                .iter()
                .position(|a| a.eq_ignore_ascii_case(b"SETNAME"))
                .unwrap_or(rest.len());
            return (identity_from_auth_args(&rest[..until_option]), true);
        }
    }

    (None, false)
}

fn identity_from_auth_args(args: &[Vec<u8>]) -> Option<String> {
    match args.len() {
        1 => Some(DEFAULT_USER.to_string()),
        n if n >= 2 => String::from_utf8(args[0].clone()).ok().filter(|u| !u.is_empty()),
        _ => None,
    }
}

pub(crate) async fn read_client_hello<S>(
    client: &mut S,
    peer: SocketAddr,
    max_bytes: usize,
) -> Result<ClientHello, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 4096];

    let args = loop {
        if let Some((args, _consumed)) = parse_command(&buf)? {
            break args;
        }
        if buf.len() >= max_bytes {
            return Err(HandshakeError::TooLarge { limit: max_bytes });
        }

        let want = chunk.len().min(max_bytes - buf.len());
        let n = client.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let (identity, auth_attempted) = identity_from_command(&args);
    let (identity, source) = match identity {
        Some(identity) => (identity, IdentitySource::Handshake),
        None => (peer.ip().to_string(), IdentitySource::PeerAddress),
    };

    Ok(ClientHello {
        identity,
        source,
        preamble: buf,
        detail: HelloDetail::Resp { auth_attempted },
    })
}

pub(crate) fn rejection(auth_attempted: bool) -> Vec<u8> {
    if auth_attempted {
        b"-WRONGPASS invalid username-password pair or user is disabled.\r\n".to_vec()
    } else {
        b"-ERR no backend is available for this client\r\n".to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn args(buf: &[u8]) -> Vec<Vec<u8>> {
        parse_command(buf).unwrap().unwrap().0
    }

    #[test]
    fn test_auth_with_password_only_is_default_user() {
        let cmd = b"*2\r\n$4\r\nAUTH\r\n$8\r\npassword\r\n";
        let (identity, auth) = identity_from_command(&args(cmd));
        assert_eq!(identity.as_deref(), Some("default"));
        assert!(auth);
    }

    #[test]
    fn test_auth_with_username() {
        let cmd = b"*3\r\n$4\r\nAUTH\r\n$5\r\nadmin\r\n$8\r\npassword\r\n";
        let (identity, _) = identity_from_command(&args(cmd));
        assert_eq!(identity.as_deref(), Some("admin"));
    }

    #[test]
    fn test_hello_with_auth() {
        let cmd = b"*5\r\n$5\r\nHELLO\r\n$1\r\n3\r\n$4\r\nAUTH\r\n$5\r\nalice\r\n$6\r\nsecret\r\n";
        let (identity, auth) = identity_from_command(&args(cmd));
        assert_eq!(identity.as_deref(), Some("alice"));
        assert!(auth);
    }

    #[test]
    fn test_hello_auth_followed_by_setname() {
        let parsed = args(b"HELLO 3 AUTH bob pw SETNAME conn1\r\n");
        assert_eq!(identity_from_command(&parsed).0.as_deref(), Some("bob"));
    }

    #[test]
    fn test_hello_without_auth_has_no_identity() {
        let (identity, auth) = identity_from_command(&args(b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n"));
        assert!(identity.is_none());
        assert!(!auth);
    }

    #[test]
    fn test_inline_auth() {
        let parsed = args(b"auth carol s3cret\r\n");
        assert_eq!(identity_from_command(&parsed).0.as_deref(), Some("carol"));
    }

    #[test]
    fn test_partial_array_needs_more() {
        assert!(parse_command(b"*2\r\n$4\r\nAUTH\r\n$8\r\npass").unwrap().is_none());
        assert!(parse_command(b"*2\r\n").unwrap().is_none());
        assert!(parse_command(b"").unwrap().is_none());
    }

    #[test]
    fn test_consumed_length_excludes_pipelined_bytes() {
        let buf = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let (_, consumed) = parse_command(buf).unwrap().unwrap();
        assert_eq!(consumed, 14);
    }

    #[test]
    fn test_malformed_array() {
        assert!(parse_command(b"*x\r\n").is_err());
        assert!(parse_command(b"*1\r\n:4\r\n").is_err());
        assert!(parse_command(b"*1\r\n$4\r\nPINGXX").is_err());
    }

    #[tokio::test]
    async fn test_read_client_hello_falls_back_to_peer_address() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

        let peer: SocketAddr = "10.1.2.3:50000".parse().unwrap();
        let hello = read_client_hello(&mut server, peer, 1024).await.unwrap();

        assert_eq!(hello.identity, "10.1.2.3");
        assert_eq!(hello.source, IdentitySource::PeerAddress);
        assert_eq!(hello.preamble, b"*1\r\n$4\r\nPING\r\n");
    }

    #[tokio::test]
    async fn test_read_client_hello_across_partial_writes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let writer = tokio::spawn(async move {
            client.write_all(b"*3\r\n$4\r\nAU").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.write_all(b"TH\r\n$5\r\nadmin\r\n$2\r\npw\r\n").await.unwrap();
            client
        });

        let hello = read_client_hello(&mut server, peer, 1024).await.unwrap();
        assert_eq!(hello.identity, "admin");
        assert_eq!(hello.preamble, b"*3\r\n$4\r\nAUTH\r\n$5\r\nadmin\r\n$2\r\npw\r\n");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_handshake_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        client.write_all(b"*1\r\n$2000\r\n").await.unwrap();
        client.write_all(&[b'a'; 1000]).await.unwrap();

        let err = read_client_hello(&mut server, peer, 512).await.unwrap_err();
        assert!(matches!(err, HandshakeError::TooLarge { limit: 512 }));
    }

    #[test]
    fn test_rejection_messages() {
        assert!(rejection(true).starts_with(b"-WRONGPASS"));
        assert!(rejection(false).starts_with(b"-ERR"));
    }
}
