//! Frame I/O over a reliable, ordered byte stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use strata_core::wire::{CallId, CommandId, FrameHeader, MAX_FRAME_PAYLOAD};

/// One decoded frame: header fields plus the owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub call_id: CallId,
    pub command_id: CommandId,
    pub payload: Vec<u8>,
}

/// Write a frame: header then payload, single flush.
pub async fn write_frame<W>(stream: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader {
        length: frame.payload.len() as u32,
        call_id: frame.call_id,
        command_id: frame.command_id,
    };
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&frame.payload).await?;
    stream.flush().await
}

/// Read one frame. A payload length above [`MAX_FRAME_PAYLOAD`] is a
/// protocol violation and surfaces as `InvalidData`.
pub async fn read_frame<R>(stream: &mut R) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; std::mem::size_of::<FrameHeader>()];
    stream.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::read_from(header_bytes.as_slice()).expect("header size is fixed");
    // Packed fields are copied to locals to avoid unaligned references.
    let length = header.length;
    let call_id = header.call_id;
    let command_id = header.command_id;

    if length > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload length {length} exceeds maximum {MAX_FRAME_PAYLOAD}"),
        ));
    }

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Frame {
        call_id,
        command_id,
        payload,
    })
}
