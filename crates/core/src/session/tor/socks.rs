/// SOCKS5 client for dialing through Tor's SOCKS port

use crate::session::SessionError;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH_REQUIRED: u8 = 0x00;
const CONNECT_COMMAND: u8 = 0x01;
const RESERVED: u8 = 0x00;
const IPV4_ADDRESS: u8 = 0x01;
const DOMAIN_NAME: u8 = 0x03;
const IPV6_ADDRESS: u8 = 0x04;
const SUCCESS: u8 = 0x00;

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Open a stream to `host:port` through the SOCKS5 proxy at `proxy`.
/// The host is always sent as a domain name so Tor resolves it.
pub(crate) async fn connect(
    proxy: SocketAddr,
    host: &str,
    port: u16,
) -> Result<TcpStream, SessionError> {
    if host.is_empty() || host.len() > u8::MAX as usize {
        return Err(SessionError::InvalidTarget(host.to_string()));
    }

    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| SessionError::Socks(format!("connect to proxy {}: {}", proxy, e)))?;

    // 1. Method negotiation
    stream
        .write_all(&[SOCKS_VERSION, 1, NO_AUTH_REQUIRED])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SessionError::Socks(format!("unexpected version {}", choice[0])));
    }
    if choice[1] != NO_AUTH_REQUIRED {
        return Err(SessionError::Socks("proxy requires authentication".to_string()));
    }

    // 2. CONNECT request
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CONNECT_COMMAND, RESERVED, DOMAIN_NAME]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // 3. Reply, then skip the bound address
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != SUCCESS {
        return Err(SessionError::Socks(format!(
            "connect to {}:{} failed: {}",
            host,
            port,
            reply_message(header[1])
        )));
    }
    let bound_len = match header[3] {
        IPV4_ADDRESS => 4,
        IPV6_ADDRESS => 16,
        DOMAIN_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(SessionError::Socks(format!("unknown address type {}", other)));
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A proxy that checks the CONNECT target and answers with `reply_code`
    async fn fake_proxy(reply_code: u8) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS_VERSION, 1, NO_AUTH_REQUIRED]);
            stream.write_all(&[SOCKS_VERSION, NO_AUTH_REQUIRED]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[3], DOMAIN_NAME);
            let mut host = vec![0u8; head[4] as usize];
            stream.read_exact(&mut host).await.unwrap();
            assert_eq!(host, b"abc.onion");
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 4001);

            stream
                .write_all(&[SOCKS_VERSION, reply_code, RESERVED, IPV4_ADDRESS, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            if reply_code == SUCCESS {
                stream.write_all(b"pong").await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let proxy = fake_proxy(SUCCESS).await;
        let mut stream = connect(proxy, "abc.onion", 4001).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let proxy = fake_proxy(0x04).await;
        let err = connect(proxy, "abc.onion", 4001).await.unwrap_err();
        assert!(err.to_string().contains("host unreachable"));
    }

    #[tokio::test]
    async fn test_host_too_long() {
        let proxy: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let host = "a".repeat(300);
        assert!(matches!(
            connect(proxy, &host, 80).await,
            Err(SessionError::InvalidTarget(_))
        ));
    }
}
