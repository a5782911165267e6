//! Length-prefixed postcard framing.
//!
//! Every frame is a `u32` big-endian length followed by a postcard body.
//! [`PostcardCodec`] plugs into [`asynchronous_codec::Framed`] for streams that
//! are owned by one protocol for their whole life. [`read_frame`] and
//! [`write_frame`] never read past the end of a frame, which matters when a
//! stream is handed to another protocol after a negotiation step.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Serialize, de::DeserializeOwned};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] postcard::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct PostcardCodec<T, E = CodecError> {
    max_frame_size: usize,
    _marker: PhantomData<(T, E)>,
}

impl<T, E> PostcardCodec<T, E> {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _marker: PhantomData,
        }
    }
}

impl<T, E> asynchronous_codec::Encoder for PostcardCodec<T, E>
where
    T: Serialize,
    E: From<CodecError> + From<io::Error>,
{
    type Item<'a> = T;
    type Error = E;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode(&item, self.max_frame_size)?;
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl<T, E> asynchronous_codec::Decoder for PostcardCodec<T, E>
where
    T: DeserializeOwned,
    E: From<CodecError> + From<io::Error>,
{
    type Item = T;
    type Error = E;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(prefix) = src
            .get(..LENGTH_PREFIX)
            .and_then(|p| <[u8; LENGTH_PREFIX]>::try_from(p).ok())
        else {
            return Ok(None);
        };
        let size = u32::from_be_bytes(prefix) as usize;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }
        if src.len() < LENGTH_PREFIX + size {
            src.reserve(LENGTH_PREFIX + size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(size);
        Ok(Some(decode(&body)?))
    }
}

/// Serializes a message body, enforcing the frame limit.
pub fn encode<T: Serialize>(item: &T, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(item)?;
    if body.len() > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }
    Ok(body)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(body)?)
}

/// Writes one frame and flushes.
pub async fn write_frame<W, T>(io: &mut W, item: &T, max_frame_size: usize) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(item, max_frame_size)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

/// Reads exactly one frame.
pub async fn read_frame<R, T>(io: &mut R, max_frame_size: usize) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    io.read_exact(&mut prefix).await?;
    let size = u32::from_be_bytes(prefix) as usize;
    if size > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }
    let mut body = vec![0u8; size];
    io.read_exact(&mut body).await?;
    decode(&body)
}

#[cfg(test)]
mod tests {
    use asynchronous_codec::{Decoder, Encoder};
    use futures::io::Cursor;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Message {
        Hello(String),
        Bye,
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = PostcardCodec::<Message>::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Hello("plexus".into()), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Hello("plexus".into()))
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut codec = PostcardCodec::<Message>::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { size: 9, max: 8 })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let mut codec = PostcardCodec::<Message>::new(4);
        let mut buf = BytesMut::new();
        let result = codec.encode(Message::Hello("too long".into()), &mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_stops_at_frame_boundary() {
        let mut wire = Cursor::new(Vec::new());
        write_frame(&mut wire, &Message::Bye, 64).await.unwrap();
        wire.get_mut().extend_from_slice(b"trailing");
        wire.set_position(0);

        let msg: Message = read_frame(&mut wire, 64).await.unwrap();
        assert_eq!(msg, Message::Bye);

        let mut rest = Vec::new();
        wire.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"trailing");
    }

    #[tokio::test]
    async fn test_read_frame_eof() {
        let mut wire = Cursor::new(vec![0u8, 0]);
        let result: Result<Message, _> = read_frame(&mut wire, 64).await;
        assert!(matches!(result, Err(CodecError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
