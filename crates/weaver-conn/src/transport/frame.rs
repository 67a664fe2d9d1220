//! frame - length prefix 付きのフレーム読み書き
//!
//! 1 フレームは 4 byte little-endian の body 長と、それに続く body。

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

pub(crate) const HEADER_LEN: usize = 4;

/// 1 フレームを書いて flush する
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    body: &[u8],
    max: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = checked_len(body.len(), max)?;
    // header と body は一度にまとめて書く
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// 1 フレーム読み、body を返す
///
/// `max` を超える長さは body を読む前に拒否する。
pub(crate) async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let size = u32::from_le_bytes(header) as usize;
    if size > max {
        return Err(TransportError::FrameTooLarge { size, max });
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

fn checked_len(size: usize, max: usize) -> Result<u32, TransportError> {
    if size > max {
        return Err(TransportError::FrameTooLarge { size, max });
    }
    u32::try_from(size).map_err(|_| TransportError::FrameTooLarge {
        size,
        max: u32::MAX as usize,
    })
}
