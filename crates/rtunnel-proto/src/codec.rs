//! Codec for the control stream and data-stream tags

use crate::messages::ControlMessage;
use crate::{MAX_CONTROL_MESSAGE_SIZE, MAX_STREAM_TAG_SIZE};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Control message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Newline-delimited JSON codec for [`ControlMessage`]
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a message as one JSON line, trailing `\n` included
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(msg)?;

        if payload.len() > MAX_CONTROL_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(b"\n");

        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns Ok(Some(message)) when a full line was consumed,
    /// Ok(None) if more data is needed,
    /// Err when the line is malformed or exceeds the size cap.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        let newline = match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_CONTROL_MESSAGE_SIZE {
                    return Err(CodecError::MessageTooLarge(buf.len()));
                }
                return Ok(None);
            }
        };

        if newline > MAX_CONTROL_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(newline));
        }

        let line = buf.split_to(newline + 1);
        let mut line = &line[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        let msg = serde_json::from_slice(line)?;
        Ok(Some(msg))
    }
}

/// Write the `stream_id` tag line that precedes bridged bytes on a data stream
pub async fn write_stream_tag<W>(writer: &mut W, stream_id: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if stream_id.is_empty() || stream_id.len() > MAX_STREAM_TAG_SIZE || stream_id.contains('\n')
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid stream tag {:?}", stream_id),
        ));
    }

    let mut line = Vec::with_capacity(stream_id.len() + 1);
    line.extend_from_slice(stream_id.as_bytes());
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read the tag line from a freshly accepted data stream.
///
/// Reads one byte at a time so that no application bytes following the tag
/// are consumed.
pub async fn read_stream_tag<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut tag = Vec::with_capacity(40);

    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if tag.len() >= MAX_STREAM_TAG_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream tag too long",
            ));
        }
        tag.push(byte);
    }

    let tag = String::from_utf8(tag)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if tag.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty stream tag",
        ));
    }
    Ok(tag)
}
