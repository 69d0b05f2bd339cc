//! Framed TCP helpers: length-prefixed MessagePack objects over a stream,
//! plus a listener bind wrapper with retrying.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::ShardsetError;

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::{self, Duration};

/// Sends an object of type `T` through a writable connection: a `u64`
/// big-endian length header followed by the MessagePack-encoded body.
pub(crate) async fn send_msg<T, Conn>(
    conn_write: &mut Conn,
    msg: &T,
) -> Result<(), ShardsetError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let msg_bytes = encode_to_vec(msg)?;
    conn_write.write_u64(msg_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&msg_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Receives an object of type `T` from a readable connection, expecting the
/// same framing that `send_msg` produces.
pub(crate) async fn recv_msg<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, ShardsetError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let msg_len = conn_read.read_u64().await?; // receive length first
    let mut msg_buf: Vec<u8> = vec![0; msg_len as usize];
    conn_read.read_exact(&mut msg_buf[..]).await?;
    let msg = decode_from_slice(&msg_buf)?;
    Ok(msg)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ShardsetError> {
    loop {
        let bound = (|| -> Result<TcpListener, std::io::Error> {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.set_nodelay(true)?;
            socket.bind(bind_addr)?;
            socket.listen(1024)
        })();
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
