//! 멀티캐스트 전송 계층
//!
//! - `UdpMulticastSender` / `UdpMulticastReceiver`: 실제 UDP 멀티캐스트 그룹
//! - `MemoryGroup`: 프로세스 내 브로드캐스트 채널 (손실 주입 가능, 테스트용)

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::Config;

/// 멀티캐스트 송신 측
#[async_trait]
pub trait MulticastSend: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> Result<()>;
}

/// 멀티캐스트 수신 측
#[async_trait]
pub trait MulticastRecv: Send {
    /// 데이터그램 하나를 `buf`에 받고 길이 반환
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// UDP 멀티캐스트 송신 소켓
pub struct UdpMulticastSender {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl UdpMulticastSender {
    pub fn new(group: SocketAddrV4, config: &Config) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_multicast_ttl_v4(config.mcast_ttl)?;
        socket.set_multicast_if_v4(&config.interface)?;
        socket.set_send_buffer_size(config.socket_buffer_size)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(config.interface, 0)))?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("멀티캐스트 송신 소켓: group={}, ttl={}", group, config.mcast_ttl);
        Ok(Self { socket, group })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }
}

#[async_trait]
impl MulticastSend for UdpMulticastSender {
    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket
            .send_to(datagram, SocketAddr::V4(self.group))
            .await?;
        Ok(())
    }
}

/// UDP 멀티캐스트 수신 소켓 (그룹 가입)
pub struct UdpMulticastReceiver {
    socket: UdpSocket,
}

impl UdpMulticastReceiver {
    pub fn new(group: SocketAddrV4, config: &Config) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_recv_buffer_size(config.socket_buffer_size)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            group.port(),
        )))?;
        socket.join_multicast_v4(group.ip(), &config.interface)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("멀티캐스트 그룹 가입: {} (interface {})", group, config.interface);
        Ok(Self { socket })
    }
}

#[async_trait]
impl MulticastRecv for UdpMulticastReceiver {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (len, _addr) = self.socket.recv_from(buf).await?;
        Ok(len)
    }
}

type DropFilter = dyn Fn(&[u8]) -> bool + Send + Sync;

/// 프로세스 내 멀티캐스트 그룹
///
/// 송신된 데이터그램은 모든 구독자에게 복제됨.
/// 드롭 필터가 true를 반환하거나 무작위 손실에 걸리면 아무에게도 전달되지 않음
#[derive(Clone)]
pub struct MemoryGroup {
    tx: broadcast::Sender<Bytes>,
    drop_filter: Option<Arc<DropFilter>>,
    loss_rate: f64,
}

impl MemoryGroup {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            drop_filter: None,
            loss_rate: 0.0,
        }
    }

    /// 결정적 손실 주입
    pub fn with_drop_filter(mut self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.drop_filter = Some(Arc::new(filter));
        self
    }

    /// 무작위 손실률 (0.0 ~ 1.0)
    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate.clamp(0.0, 1.0);
        self
    }

    pub fn subscribe(&self) -> MemoryReceiver {
        MemoryReceiver {
            rx: self.tx.subscribe(),
        }
    }

    fn should_drop(&self, datagram: &[u8]) -> bool {
        if let Some(filter) = &self.drop_filter {
            if filter(datagram) {
                return true;
            }
        }
        self.loss_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.loss_rate
    }
}

#[async_trait]
impl MulticastSend for MemoryGroup {
    async fn send(&self, datagram: &[u8]) -> Result<()> {
        if self.should_drop(datagram) {
            debug!("데이터그램 드롭 ({} bytes)", datagram.len());
            return Ok(());
        }
        // 구독자가 없어도 UDP처럼 성공
        let _ = self.tx.send(Bytes::copy_from_slice(datagram));
        Ok(())
    }
}

/// `MemoryGroup` 구독자
pub struct MemoryReceiver {
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl MulticastRecv for MemoryReceiver {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.rx.recv().await {
                Ok(datagram) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    return Ok(len);
                }
                // 밀린 데이터그램은 손실로 취급
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("구독자 지연으로 {}개 손실", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelError),
            }
        }
    }
}
