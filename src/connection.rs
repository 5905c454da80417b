//! 유니캐스트(TCP) 연결 관리와 프레임 송수신

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::auth::FrameAuth;
use crate::error::Result;
use crate::frame::{Frame, FrameHeader};
use crate::HEADER_LEN;

/// 연결 식별자 (송신자 프로세스 내에서 유일)
pub type ConnectionId = u64;

/// 스트림에서 프레임 하나 읽기
///
/// 프레임 경계에서 EOF면 `Ok(None)`
pub async fn read_frame<R>(reader: &mut R, auth: &dyn FrameAuth) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; HEADER_LEN];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::decode(&buf)?;
    let rest = header.body_len() + auth.mac_len();
    buf.resize(HEADER_LEN + rest, 0);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;

    Frame::decode(&buf, auth).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame, auth: &dyn FrameAuth) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode(auth)).await?;
    Ok(())
}

/// 수신자 하나와의 연결 (쓰기 측)
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
}

impl Connection {
    /// 프레임 전송. 워커와 타임아웃 태스크가 동시에 쓸 수 있어 잠금으로 직렬화
    pub async fn send(&self, frame: &Frame, auth: &dyn FrameAuth) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame, auth).await
    }
}

/// 현재 연결된 수신자 집합
#[derive(Debug)]
pub struct ConnectionSet {
    conns: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, peer: SocketAddr, writer: OwnedWriteHalf) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection {
            id,
            peer,
            writer: Mutex::new(writer),
        });
        self.conns.insert(id, conn.clone());
        conn
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|c| c.value().clone())
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.conns.iter().map(|c| *c.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn clear(&self) {
        self.conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Crc32Check, NoAuth};
    use crate::error::Error;
    use crate::frame::MessageKind;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_stream_framing() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let auth = Crc32Check;

        let data = Frame::new(MessageKind::RetxData, 2, 1024, Bytes::from_static(b"abc"));
        write_frame(&mut client, &data, &auth).await.unwrap();
        write_frame(&mut client, &Frame::retx_request(2, 0, 1024), &auth)
            .await
            .unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, &auth).await.unwrap().unwrap(), data);
        let req = read_frame(&mut server, &auth).await.unwrap().unwrap();
        assert_eq!(req.kind(), MessageKind::RetxReq);
        assert_eq!(req.header.payload_len, 1024);
        assert!(read_frame(&mut server, &auth).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_flags_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server, &NoAuth).await,
            Err(Error::InvalidFlags(0))
        ));
    }

    #[tokio::test]
    async fn test_connection_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let (_read, write) = stream.into_split();

        let set = ConnectionSet::new();
        let conn = set.add(peer, write);
        assert!(set.is_live(conn.id));
        assert_eq!(set.ids(), vec![conn.id]);
        assert!(set.remove(conn.id).is_some());
        assert!(set.is_empty());
    }
}
