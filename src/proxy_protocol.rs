//! PROXY protocol header parsing
//!
//! When the proxy runs behind a TCP load balancer the peer address of each
//! connection is the balancer's, and the real client address arrives in a
//! PROXY protocol header ahead of any TLS or HTTP bytes. Both the v1 text
//! form and the v2 binary form are accepted.
//!
//! Exactly the header bytes are consumed so the stream can be handed on to
//! the TLS acceptor or HTTP server untouched.

use std::net::SocketAddr;

use anyhow::{bail, Context};
use ppp::{v1, v2, HeaderResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// v1 headers are at most 107 bytes including the trailing CRLF
const PROXY_V1_MAX_LEN: usize = 107;

const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Signature, version/command, family, and the two length bytes
const PROXY_V2_MIN_HEADER: usize = 16;

/// Upper bound on v2 address + TLV data
const PROXY_V2_MAX_ADDR_LEN: usize = 2048;

/// Read a PROXY header from `stream` and return the client address it names.
///
/// `peer` is returned for headers that carry no address (`UNKNOWN` in v1,
/// `LOCAL` or an unspecified family in v2), as sent by health-checking
/// balancers.
pub async fn read_header<S: AsyncRead + Unpin>(
    stream: &mut S,
    peer: SocketAddr,
) -> anyhow::Result<SocketAddr> {
    let mut first = [0u8; 1];
    stream
        .read_exact(&mut first)
        .await
        .context("connection closed before PROXY header")?;

    let source = match first[0] {
        b'P' => read_v1(stream).await?,
        0x0D => read_v2(stream).await?,
        other => bail!("connection did not start with a PROXY header (first byte {other:#04x})"),
    };

    let client = source.unwrap_or(peer);
    trace!(peer = %peer, client = %client, "Parsed PROXY header");
    Ok(client)
}

async fn read_v1<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Option<SocketAddr>> {
    let mut header = Vec::with_capacity(PROXY_V1_MAX_LEN);
    header.push(b'P');

    loop {
        let byte = stream
            .read_u8()
            .await
            .context("connection closed inside PROXY v1 header")?;
        header.push(byte);
        if header.ends_with(b"\r\n") {
            break;
        }
        if header.len() >= PROXY_V1_MAX_LEN {
            bail!("PROXY v1 header exceeds {PROXY_V1_MAX_LEN} bytes");
        }
    }

    let header = match HeaderResult::parse(&header) {
        HeaderResult::V1(Ok(h)) => h,
        HeaderResult::V1(Err(e)) => bail!("invalid PROXY v1 header: {e:?}"),
        HeaderResult::V2(_) => bail!("expected PROXY v1 header"),
    };

    Ok(match header.addresses {
        v1::Addresses::Tcp4(a) => Some(SocketAddr::new(a.source_address.into(), a.source_port)),
        v1::Addresses::Tcp6(a) => Some(SocketAddr::new(a.source_address.into(), a.source_port)),
        v1::Addresses::Unknown => None,
    })
}

async fn read_v2<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Option<SocketAddr>> {
    let mut prefix = [0u8; PROXY_V2_MIN_HEADER];
    prefix[0] = 0x0D;
    stream
        .read_exact(&mut prefix[1..])
        .await
        .context("connection closed inside PROXY v2 header")?;

    if prefix[..12] != PROXY_V2_SIGNATURE {
        bail!("invalid PROXY v2 signature");
    }

    let addr_len = u16::from_be_bytes([prefix[14], prefix[15]]) as usize;
    if addr_len > PROXY_V2_MAX_ADDR_LEN {
        bail!("PROXY v2 address/TLV length {addr_len} exceeds maximum {PROXY_V2_MAX_ADDR_LEN}");
    }

    let mut full = vec![0u8; PROXY_V2_MIN_HEADER + addr_len];
    full[..PROXY_V2_MIN_HEADER].copy_from_slice(&prefix);
    if addr_len > 0 {
        stream
            .read_exact(&mut full[PROXY_V2_MIN_HEADER..])
            .await
            .context("connection closed inside PROXY v2 addresses")?;
    }

    let header = match HeaderResult::parse(&full) {
        HeaderResult::V2(Ok(h)) => h,
        HeaderResult::V2(Err(e)) => bail!("invalid PROXY v2 header: {e:?}"),
        HeaderResult::V1(_) => bail!("expected PROXY v2 header"),
    };

    if header.command == v2::Command::Local {
        return Ok(None);
    }

    Ok(match header.addresses {
        v2::Addresses::IPv4(a) => Some(SocketAddr::new(a.source_address.into(), a.source_port)),
        v2::Addresses::IPv6(a) => Some(SocketAddr::new(a.source_address.into(), a.source_port)),
        _ => None,
    })
}
