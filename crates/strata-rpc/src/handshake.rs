//! Connection-time fingerprint exchange.
//!
//! On accept, the provider writes its command fingerprint: a u32 count of
//! names followed by, per name, a u32 byte length and the UTF-8 bytes. The
//! client checks that its own name list is a prefix of the provider's.
//! Providers may expose supersets; reordering is a mismatch.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Hard cap on fingerprint entries; anything above is a malformed peer.
const MAX_NAMES: u32 = 1024;
/// Hard cap on a single name's byte length.
const MAX_NAME_LEN: u32 = 256;

/// Provider side: advertise the command names in order.
pub async fn send_fingerprint<W>(stream: &mut W, names: &[&str]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&(names.len() as u32).to_le_bytes()).await?;
    for name in names {
        stream.write_all(&(name.len() as u32).to_le_bytes()).await?;
        stream.write_all(name.as_bytes()).await?;
    }
    stream.flush().await
}

/// Client side: read the provider's advertised names.
pub async fn receive_fingerprint<R>(stream: &mut R) -> io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut count_bytes = [0u8; 4];
    stream.read_exact(&mut count_bytes).await?;
    let count = u32::from_le_bytes(count_bytes);
    if count > MAX_NAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("fingerprint claims {count} names"),
        ));
    }

    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("fingerprint name length {len}"),
            ));
        }
        let mut bytes = vec![0u8; len as usize];
        stream.read_exact(&mut bytes).await?;
        let name = String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        names.push(name);
    }
    Ok(names)
}

/// Prefix check: every client name must match the provider name at the same
/// position. The provider offering more commands than the client knows is
/// fine; fewer, or any reordering, is not.
pub fn verify_prefix(client: &[&str], provider: &[String]) -> Result<(), RpcError> {
    if client.len() > provider.len() {
        return Err(RpcError::HandshakeFailed);
    }
    for (ours, theirs) in client.iter().zip(provider) {
        if ours != theirs {
            return Err(RpcError::HandshakeFailed);
        }
    }
    Ok(())
}
