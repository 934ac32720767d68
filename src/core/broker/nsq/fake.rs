//! Scripted nsqd peer for protocol tests.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::protocol::{FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, OK};

pub fn frame(frame_type: i32, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32((4 + data.len()) as u32);
    buf.put_i32(frame_type);
    buf.put_slice(data);
    buf
}

pub fn message_frame(id: &[u8; 16], attempts: u16, body: &[u8]) -> BytesMut {
    let mut data = BytesMut::new();
    data.put_i64(1_700_000_000_000_000_000);
    data.put_u16(attempts);
    data.put_slice(id);
    data.put_slice(body);
    frame(FRAME_TYPE_MESSAGE, &data)
}

pub async fn read_line(sock: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let b = sock.read_u8().await.unwrap();
        if b == b'\n' {
            return String::from_utf8(line).unwrap();
        }
        line.push(b);
    }
}

pub async fn read_sized(sock: &mut TcpStream) -> Vec<u8> {
    let len = sock.read_u32().await.unwrap() as usize;
    let mut body = vec![0u8; len];
    sock.read_exact(&mut body).await.unwrap();
    body
}

pub async fn respond_ok(sock: &mut TcpStream) {
    sock.write_all(&frame(FRAME_TYPE_RESPONSE, OK)).await.unwrap();
}

/// Consumes the magic and `IDENTIFY`, then answers `OK`.
pub async fn accept_handshake(sock: &mut TcpStream) {
    let mut magic = [0u8; 4];
    sock.read_exact(&mut magic).await.unwrap();
    assert_eq!(&magic, b"  V2");
    assert_eq!(read_line(sock).await, "IDENTIFY");
    read_sized(sock).await;
    respond_ok(sock).await;
}
