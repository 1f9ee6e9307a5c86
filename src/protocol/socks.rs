//! SOCKS5 handshakes (RFC 1928, RFC 1929)
//!
//! The server side accepts CONNECT with no-auth or username/password; the
//! client side is used by the `socks` outbound.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Credentials;
use crate::common::Address;
use crate::error::{Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Reply with an all-zero IPv4 bound address
fn reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Read `ATYP ADDR PORT`
pub async fn read_address<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    let atyp = stream.read_u8().await?;
    read_address_body(stream, atyp).await
}

async fn read_address_body<S>(stream: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Ok(Address::Socket(SocketAddr::new(Ipv4Addr::from(addr).into(), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::Protocol("SOCKS5 domain is not valid UTF-8".into()))?;
            Ok(Address::Domain(domain, port))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Ok(Address::Socket(SocketAddr::new(Ipv6Addr::from(addr).into(), port)))
        }
        _ => Err(Error::Protocol(format!("Unsupported address type: {}", atyp))),
    }
}

/// Encode `ATYP ADDR PORT`
pub fn write_address(buf: &mut Vec<u8>, address: &Address) -> Result<()> {
    match address {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
        Address::Domain(domain, port) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| Error::Protocol(format!("Domain too long: {}", domain)))?;
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

/// Server side: negotiate auth, read a CONNECT request and acknowledge it.
///
/// `users` empty means no authentication.
pub async fn server_handshake<S>(stream: &mut S, users: &[Credentials]) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(Error::Protocol(format!("Unsupported SOCKS version: {}", version)));
    }

    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let wanted = if users.is_empty() { AUTH_NONE } else { AUTH_PASSWORD };
    let selected = if methods.contains(&wanted) {
        wanted
    } else {
        AUTH_NO_ACCEPTABLE
    };
    stream.write_all(&[SOCKS5_VERSION, selected]).await?;

    if selected == AUTH_NO_ACCEPTABLE {
        return Err(Error::Protocol("No acceptable auth method".into()));
    }

    if selected == AUTH_PASSWORD {
        let ver = stream.read_u8().await?;
        if ver != AUTH_VERSION {
            return Err(Error::Protocol("Invalid auth version".into()));
        }

        let ulen = stream.read_u8().await? as usize;
        let mut username = vec![0u8; ulen];
        stream.read_exact(&mut username).await?;
        let plen = stream.read_u8().await? as usize;
        let mut password = vec![0u8; plen];
        stream.read_exact(&mut password).await?;

        let auth_ok = users
            .iter()
            .any(|u| u.username.as_bytes() == username && u.password.as_bytes() == password);
        if !auth_ok {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(Error::Protocol("Authentication failed".into()));
        }
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
    }

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version in request".into()));
    }

    let cmd = header[1];
    let atyp = header[3];

    let address = match read_address_body(stream, atyp).await {
        Ok(address) => address,
        Err(e) => {
            stream.write_all(&reply(REP_ATYP_NOT_SUPPORTED)).await?;
            return Err(e);
        }
    };

    if cmd != CMD_CONNECT {
        stream.write_all(&reply(REP_CMD_NOT_SUPPORTED)).await?;
        return Err(Error::Protocol(format!("Unsupported command: {}", cmd)));
    }

    stream.write_all(&reply(REP_SUCCESS)).await?;
    stream.flush().await?;
    Ok(address)
}

/// Client side: negotiate auth and CONNECT to `destination` through the server
pub async fn client_handshake<S>(
    stream: &mut S,
    destination: &Address,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if credentials.is_some() { AUTH_PASSWORD } else { AUTH_NONE };
    stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version from server".into()));
    }

    match (response[1], credentials) {
        (AUTH_NONE, _) => {}
        (AUTH_PASSWORD, Some(creds)) => {
            let ulen = u8::try_from(creds.username.len())
                .map_err(|_| Error::Protocol("Username too long".into()))?;
            let plen = u8::try_from(creds.password.len())
                .map_err(|_| Error::Protocol("Password too long".into()))?;

            let mut auth_request = vec![AUTH_VERSION, ulen];
            auth_request.extend_from_slice(creds.username.as_bytes());
            auth_request.push(plen);
            auth_request.extend_from_slice(creds.password.as_bytes());
            stream.write_all(&auth_request).await?;

            let mut auth_response = [0u8; 2];
            stream.read_exact(&mut auth_response).await?;
            if auth_response[1] != 0x00 {
                return Err(Error::Protocol("Authentication failed".into()));
            }
        }
        _ => return Err(Error::Protocol("Server rejected auth methods".into())),
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    write_address(&mut request, destination)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version in response".into()));
    }

    if header[1] != REP_SUCCESS {
        let err_msg = match header[1] {
            REP_GENERAL_FAILURE => "General failure",
            REP_NOT_ALLOWED => "Connection not allowed",
            REP_NETWORK_UNREACHABLE => "Network unreachable",
            REP_HOST_UNREACHABLE => "Host unreachable",
            REP_CONNECTION_REFUSED => "Connection refused",
            REP_CMD_NOT_SUPPORTED => "Command not supported",
            REP_ATYP_NOT_SUPPORTED => "Address type not supported",
            _ => "Unknown error",
        };
        return Err(Error::Protocol(format!("SOCKS5 error: {}", err_msg)));
    }

    // Bound address is not used
    read_address(stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_no_auth() {
        let (mut client, mut server) = duplex(1024);
        let destination = Address::domain("example.com", 443);

        let server_task = tokio::spawn(async move { server_handshake(&mut server, &[]).await });

        client_handshake(&mut client, &destination, None).await.unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), destination);
    }

    #[tokio::test]
    async fn test_handshake_with_password() {
        let (mut client, mut server) = duplex(1024);
        let destination = Address::Socket("[2001:db8::1]:8443".parse().unwrap());
        let creds = Credentials::new("alice", "secret");
        let users = vec![creds.clone()];

        let server_task = tokio::spawn(async move { server_handshake(&mut server, &users).await });

        client_handshake(&mut client, &destination, Some(&creds)).await.unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), destination);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (mut client, mut server) = duplex(1024);
        let users = vec![Credentials::new("alice", "secret")];

        let server_task = tokio::spawn(async move { server_handshake(&mut server, &users).await });

        let wrong = Credentials::new("alice", "guess");
        let result = client_handshake(&mut client, &Address::domain("example.com", 80), Some(&wrong)).await;
        assert!(result.is_err());
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_address_codec() {
        let mut buf = Vec::new();
        write_address(&mut buf, &Address::Socket("1.2.3.4:80".parse().unwrap())).unwrap();
        assert_eq!(buf, vec![ATYP_IPV4, 1, 2, 3, 4, 0, 80]);

        let mut reader = &buf[..];
        let address = read_address(&mut reader).await.unwrap();
        assert_eq!(address.to_string(), "1.2.3.4:80");

        let long = Address::domain("a".repeat(300), 80);
        assert!(write_address(&mut Vec::new(), &long).is_err());
    }
}
