//! # PMTP (Product Multicast Transfer Protocol)
//!
//! UDP 멀티캐스트 + TCP 유니캐스트 재전송 기반 신뢰성 대량 전송 프로토콜
//!
//! ## 핵심 특징
//! - **단일 송신자 멀티캐스트**: 하나의 송신자가 다수 수신자에게 "프로덕트" 전송
//! - **BOP / DATA / EOP**: 프로덕트 단위로 시작/데이터/종료 프레임 전송
//! - **갭 추적**: 수신측은 누락 바이트 구간만 관리하고 TCP로 재전송 요청
//! - **재전송 저장소**: 송신측은 프로덕트를 복사하지 않고 참조만 보관
//! - **지연 큐 타이머**: 폴링 없이 프로덕트별 타임아웃 처리
//! - **고정 속도 셰이퍼**: 멀티캐스트 송신 속도 제한

pub mod auth;
pub mod config;
pub mod connection;
pub mod delay_queue;
pub mod error;
pub mod frame;
pub mod rate;
pub mod receiver;
pub mod request_queue;
pub mod retx_store;
pub mod segment;
pub mod sender;
pub mod stats;
pub mod transport;

pub use auth::{Crc32Check, FrameAuth, NoAuth};
pub use config::Config;
pub use connection::{read_frame, write_frame, ConnectionId};
pub use delay_queue::DelayQueue;
pub use error::{Error, Result};
pub use frame::{BopMessage, Frame, FrameHeader, MessageKind, ProdIndex, StartTime};
pub use rate::RateShaper;
pub use receiver::{ProductBegin, Receiver, ReceiverHooks};
pub use request_queue::{Request, RequestQueue};
pub use retx_store::{Release, Removal, RetxProduct, RetxStore};
pub use segment::{MarkOutcome, SegmentTracker};
pub use sender::{Sender, SenderHooks};
pub use stats::{ReceiverStats, SenderStats};
pub use transport::{
    MemoryGroup, MemoryReceiver, MulticastRecv, MulticastSend, UdpMulticastReceiver,
    UdpMulticastSender,
};

/// 프레임 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 12;

/// BOP 고정부 크기: start_time(12) + prodsize(4) + metasize(2)
pub const BOP_FIXED_LEN: usize = 18;

/// 기본 최대 패킷 크기 (이더넷 MTU 1500 - IP 20 - TCP 20)
pub const DEFAULT_MAX_PACKET: usize = 1460;
