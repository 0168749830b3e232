//! Size-prefixed framing of 9P messages over async transports.
//!
//! Every 9P message on the wire is `size[4] type[1] tag[2] body`, where
//! `size` counts the whole frame including itself. The size field is read
//! first and checked against the negotiated msize before anything else is
//! consumed, so an oversized frame is rejected with only its four size
//! bytes taken from the transport.

use crate::error::Error;
use crate::fcall::Msg;
use crate::serialize;
use crate::utils::Result;
use crate::{io_err, res};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Envelope overhead: size[4] type[1] tag[2].
const HDRSZ: u32 = 7;

/// Read one framed message from `r`.
///
/// An `msize` of zero means "not negotiated yet" and accepts any declared
/// size; otherwise frames larger than `msize` fail with
/// [`Error::MessageTooLarge`]. The body is decoded from a buffer of exactly
/// the declared size, so a frame whose contents run past its size field
/// fails without desynchronizing the stream.
pub async fn receive<R>(r: &mut R, msize: u32) -> Result<Msg>
where
    R: AsyncRead + Unpin,
{
    let size = r.read_u32_le().await?;
    if size < HDRSZ {
        return res!(io_err!(InvalidData, "frame shorter than its header"));
    }
    if msize > 0 && size > msize {
        return Err(Error::MessageTooLarge);
    }

    let mut buf = vec![0u8; (size - 4) as usize];
    r.read_exact(&mut buf).await?;

    serialize::read_msg(&mut Cursor::new(&buf))
}

/// Write one framed message to `w`.
///
/// The body size is counted first so the size prefix can lead the frame.
pub async fn send<W>(w: &mut W, msg: &Msg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let size = 4 + serialize::size_of(msg)?;

    let mut buf = BytesMut::with_capacity(size as usize).writer();
    serialize::Encodable::encode(&size, &mut buf)?;
    serialize::write_msg(&mut buf, msg)?;

    w.write_all(&buf.into_inner().freeze()).await?;
    w.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::*;

    fn version_msg() -> Msg {
        Msg {
            tag: NOTAG,
            body: Fcall::TVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn size_prefix_counts_whole_frame() {
        let msg = version_msg();

        let mut wire = Vec::new();
        send(&mut wire, &msg).await.unwrap();

        let declared = u32::from_le_bytes(wire[..4].try_into().unwrap());
        assert_eq!(declared as usize, wire.len());
        // size[4] type[1] tag[2] msize[4] version[2 + 6]
        assert_eq!(wire.len(), 19);

        let mut cursor = Cursor::new(wire);
        let decoded = receive(&mut cursor, 0).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn oversized_frame_consumes_only_the_prefix() {
        let mut wire = Vec::new();
        send(&mut wire, &version_msg()).await.unwrap();

        let mut cursor = Cursor::new(wire);
        match receive(&mut cursor, 8).await {
            Err(Error::MessageTooLarge) => {}
            other => panic!("expected MessageTooLarge, got {:?}", other),
        }
        assert_eq!(cursor.position(), 4);
    }

    #[tokio::test]
    async fn eof_surfaces_as_io_error() {
        let mut cursor = Cursor::new(Vec::new());
        let err = receive(&mut cursor, 0).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn short_frame_is_rejected() {
        let mut cursor = Cursor::new(3u32.to_le_bytes().to_vec());
        assert!(receive(&mut cursor, 0).await.is_err());
        let mut cursor = Cursor::new(vec![0u8; 4]);
        assert!(receive(&mut cursor, 0).await.is_err());
    }
}
