//! Opaque byte tunnel for CONNECT traffic the proxy cannot decrypt.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conn::{BoxIo, Conn};
use crate::error::BoxError;

const TUNNEL_BUF: usize = 4096;

/// Relay bytes between both peers until either direction reports an error
/// or end-of-stream. Dropping the halves afterwards closes both sockets,
/// which unblocks the peer direction.
pub(crate) async fn relay(mut client: Conn<BoxIo>, mut origin: Conn<BoxIo>) -> Result<(), BoxError> {
    // Bytes already buffered during head parsing belong to the peer.
    let pending = client.take_buffer();
    if !pending.is_empty() {
        origin.write_all(&pending).await?;
        origin.flush().await?;
    }
    let pending = origin.take_buffer();
    if !pending.is_empty() {
        client.write_all(&pending).await?;
        client.flush().await?;
    }

    let (mut client_rd, mut client_wr) = tokio::io::split(client.into_io());
    let (mut origin_rd, mut origin_wr) = tokio::io::split(origin.into_io());

    tokio::select! {
        res = copy_half(&mut client_rd, &mut origin_wr) => res?,
        res = copy_half(&mut origin_rd, &mut client_wr) => res?,
    }
    Ok(())
}

async fn copy_half<R, W>(rd: &mut R, wr: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; TUNNEL_BUF];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
    }
}
