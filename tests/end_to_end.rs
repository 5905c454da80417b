//! 송신자 + 수신자 통합 테스트 (메모리 멀티캐스트 + 루프백 TCP)

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use pmtp::{
    Config, Crc32Check, Error, Frame, FrameAuth, FrameHeader, MemoryGroup, MessageKind,
    MulticastSend, NoAuth, ProdIndex, ProductBegin, Receiver, ReceiverHooks, Sender, SenderHooks,
    HEADER_LEN,
};

#[derive(Debug, PartialEq)]
enum RecvEvent {
    End(ProdIndex, Bytes, u32),
    Missed(ProdIndex),
}

struct RecvRecorder {
    tx: mpsc::UnboundedSender<RecvEvent>,
}

impl ReceiverHooks for RecvRecorder {
    fn on_begin(&self, begin: &ProductBegin) -> Option<BytesMut> {
        Some(BytesMut::zeroed(begin.size as usize))
    }

    fn on_end(&self, index: ProdIndex, data: Option<Bytes>, retx_count: u32) {
        let _ = self
            .tx
            .send(RecvEvent::End(index, data.unwrap_or_default(), retx_count));
    }

    fn on_missed(&self, index: ProdIndex) {
        let _ = self.tx.send(RecvEvent::Missed(index));
    }
}

struct DoneRecorder {
    tx: mpsc::UnboundedSender<ProdIndex>,
}

impl SenderHooks for DoneRecorder {
    fn on_product_done(&self, index: ProdIndex) {
        let _ = self.tx.send(index);
    }
}

struct Session {
    group: MemoryGroup,
    sender: Sender,
    done: mpsc::UnboundedReceiver<ProdIndex>,
    receivers: Vec<(Receiver, mpsc::UnboundedReceiver<RecvEvent>)>,
}

/// max_payload = 1024, 3000바이트 EOP 타임아웃 480ms
fn test_config() -> Config {
    Config {
        max_packet: 1024 + HEADER_LEN,
        link_speed_bps: 1_000_000,
        ..Config::default()
    }
}

async fn session(
    config: Config,
    group: MemoryGroup,
    auth: Arc<dyn FrameAuth>,
    receiver_count: usize,
) -> Session {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (done_tx, done) = mpsc::unbounded_channel();
    let sender = Sender::start(
        config.clone(),
        Arc::new(group.clone()),
        listener,
        auth.clone(),
        Arc::new(DoneRecorder { tx: done_tx }),
    )
    .unwrap();

    let mut receivers = Vec::new();
    for _ in 0..receiver_count {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = Receiver::start(
            config.clone(),
            Box::new(group.subscribe()),
            sender.local_addr(),
            auth.clone(),
            Arc::new(RecvRecorder { tx }),
        )
        .await
        .unwrap();
        receivers.push((receiver, rx));
    }

    for _ in 0..400 {
        if sender.receiver_count() == receiver_count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sender.receiver_count(), receiver_count);

    Session {
        group,
        sender,
        done,
        receivers,
    }
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timeout")
        .expect("channel closed")
}

fn pattern(size: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..size)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect::<Vec<_>>(),
    )
}

fn header_of(datagram: &[u8]) -> Option<FrameHeader> {
    FrameHeader::decode(datagram.get(..HEADER_LEN)?).ok()
}

#[tokio::test]
async fn test_lossless_product() {
    let mut s = session(test_config(), MemoryGroup::new(256), Arc::new(NoAuth), 1).await;
    s.sender.set_send_rate(100_000_000);
    s.receivers[0].0.set_link_speed(500_000);
    let data = pattern(3000, 1);

    let index = s.sender.send_product(data.clone(), b"report.bin").await.unwrap();
    let (receiver, events) = &mut s.receivers[0];

    assert_eq!(next(events).await, RecvEvent::End(index, data, 0));
    assert_eq!(next(&mut s.done).await, index);
    assert_eq!(receiver.stats().requests_sent, 0);
    assert_eq!(s.sender.stats().retx_requests, 0);
    assert_eq!(s.sender.last_completed(), Some(index));
}

#[tokio::test]
async fn test_single_lost_block_is_recovered() {
    let group = MemoryGroup::new(256).with_drop_filter(|d| {
        header_of(d).map_or(false, |h| h.kind == MessageKind::Data && h.seqnum == 1024)
    });
    let mut s = session(test_config(), group, Arc::new(NoAuth), 1).await;
    let data = pattern(3000, 2);

    let index = s.sender.send_product(data.clone(), b"").await.unwrap();
    let (receiver, events) = &mut s.receivers[0];

    assert_eq!(next(events).await, RecvEvent::End(index, data, 1));
    assert_eq!(next(&mut s.done).await, index);
    assert_eq!(receiver.stats().requests_sent, 1);

    let stats = s.sender.stats();
    assert_eq!(stats.retx_requests, 1);
    assert_eq!(stats.retx_bytes, 1024);
}

#[tokio::test]
async fn test_lost_bop_eop_and_tail_with_two_receivers() {
    // 1번 BOP, 2번 EOP, 3번 마지막 블록 유실
    let group = MemoryGroup::new(1024).with_drop_filter(|d| {
        header_of(d).map_or(false, |h| {
            matches!(
                (h.prod_index, h.kind, h.seqnum),
                (1, MessageKind::Bop, _) | (2, MessageKind::Eop, _) | (3, MessageKind::Data, 2048)
            )
        })
    });
    let mut s = session(test_config(), group, Arc::new(Crc32Check), 2).await;

    let products: Vec<Bytes> = (0..4).map(|i| pattern(3000, i as u8)).collect();
    for data in &products {
        s.sender.send_product(data.clone(), b"").await.unwrap();
    }

    for (_, events) in s.receivers.iter_mut() {
        let mut seen = Vec::new();
        for _ in 0..products.len() {
            match next(events).await {
                RecvEvent::End(index, data, _) => {
                    assert_eq!(data, products[index as usize]);
                    seen.push(index);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    let mut done = Vec::new();
    for _ in 0..products.len() {
        done.push(next(&mut s.done).await);
    }
    done.sort_unstable();
    assert_eq!(done, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_expired_product_is_missed() {
    // 1번 프로덕트 전체 유실
    let group = MemoryGroup::new(256)
        .with_drop_filter(|d| header_of(d).map_or(false, |h| h.prod_index == 1));
    let config = Config {
        retx_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let mut s = session(config, group, Arc::new(NoAuth), 1).await;

    let first = pattern(100, 0);
    s.sender.send_product(first.clone(), b"").await.unwrap();
    s.sender.send_product(pattern(100, 1), b"").await.unwrap();
    {
        let (_, events) = &mut s.receivers[0];
        assert_eq!(next(events).await, RecvEvent::End(0, first, 0));
    }

    // 송신자가 1번을 타임아웃으로 해제할 때까지 대기
    let mut done = vec![next(&mut s.done).await, next(&mut s.done).await];
    done.sort_unstable();
    assert_eq!(done, vec![0, 1]);

    let third = pattern(100, 2);
    s.sender.send_product(third.clone(), b"").await.unwrap();

    let (receiver, events) = &mut s.receivers[0];
    let mut outcomes = vec![next(events).await, next(events).await];
    outcomes.sort_by_key(|e| match e {
        RecvEvent::End(i, _, _) | RecvEvent::Missed(i) => *i,
    });
    assert_eq!(outcomes, vec![RecvEvent::Missed(1), RecvEvent::End(2, third, 0)]);
    assert_eq!(receiver.stats().products_missed, 1);
}

#[tokio::test]
async fn test_decreasing_multicast_seqnum_stops_receiver() {
    let s = session(test_config(), MemoryGroup::new(256), Arc::new(NoAuth), 1).await;
    let (receiver, _) = &s.receivers[0];

    let bop = pmtp::BopMessage {
        start_time: pmtp::StartTime::now(),
        prodsize: 3000,
        metadata: Bytes::new(),
    };
    for frame in [
        Frame::bop(MessageKind::Bop, 9, &bop),
        Frame::new(MessageKind::Data, 9, 500, Bytes::from_static(&[0u8; 8])),
        Frame::new(MessageKind::Data, 9, 200, Bytes::from_static(&[0u8; 8])),
    ] {
        s.group.send(&frame.encode(&NoAuth)).await.unwrap();
    }

    let result = tokio::time::timeout(Duration::from_secs(5), receiver.wait())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(Error::SeqnumDecreased {
            index: 9,
            previous: 500,
            got: 200
        })
    ));
    assert!(receiver.is_broken());
}
