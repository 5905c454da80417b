//! 수신자 엔진
//!
//! 태스크 구성:
//! - 멀티캐스트 수신: BOP/DATA/EOP 처리, 갭 검출
//! - 재전송 수신: TCP로 오는 RETX_BOP/RETX_DATA/RETX_EOP/RETX_REJ 처리
//! - 요청 송신: 내부 요청 큐를 비우며 TCP로 요청 전송 (유일한 TCP 쓰기 지점)
//! - 타이머: EOP 누락 타임아웃

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::FrameAuth;
use crate::connection::{read_frame, write_frame};
use crate::delay_queue::DelayQueue;
use crate::frame::{is_ahead, BopMessage, Frame, MessageKind, ProdIndex, StartTime};
use crate::request_queue::{Request, RequestQueue};
use crate::segment::{MarkOutcome, SegmentTracker};
use crate::stats::ReceiverStats;
use crate::transport::MulticastRecv;
use crate::{Config, Error, Result};

/// 새 프로덕트 알림 정보
#[derive(Debug, Clone)]
pub struct ProductBegin {
    pub index: ProdIndex,
    pub start_time: StartTime,
    pub size: u32,
    pub metadata: Bytes,
}

/// 수신측 호스트 콜백
pub trait ReceiverHooks: Send + Sync {
    /// 새 프로덕트 시작. 데이터를 받을 버퍼를 반환하고, None이면 데이터는 버림
    fn on_begin(&self, begin: &ProductBegin) -> Option<BytesMut> {
        Some(BytesMut::zeroed(begin.size as usize))
    }

    /// 프로덕트 완료. `data`는 `on_begin`이 준 버퍼
    fn on_end(&self, _index: ProdIndex, _data: Option<Bytes>, _retx_count: u32) {}

    /// 송신자가 이미 해제해서 받을 수 없게 된 프로덕트
    fn on_missed(&self, _index: ProdIndex) {}
}

/// 콜백 없음
impl ReceiverHooks for () {}

/// 프로덕트별 수신 상태
#[derive(Debug)]
struct ProdTracker {
    size: u32,
    buffer: Option<BytesMut>,
    /// 마지막 멀티캐스트 블록 오프셋
    last_mcast_offset: Option<u32>,
    /// 이 지점까지는 받았거나 이미 요청함
    requested_through: u32,
    /// 재전송으로 채운 블록 수
    retx_count: u32,
}

struct Shared {
    config: RwLock<Config>,
    auth: Arc<dyn FrameAuth>,
    hooks: Arc<dyn ReceiverHooks>,
    max_payload: usize,

    segments: SegmentTracker,
    trackers: Mutex<HashMap<ProdIndex, ProdTracker>>,
    /// EOP 타이머가 대기 중인 프로덕트와 EOP 도착 여부. 타이머만 지움
    eop_status: Mutex<HashMap<ProdIndex, bool>>,
    /// BOP를 요청했지만 아직 못 받은 프로덕트
    missing_bops: Mutex<HashSet<ProdIndex>>,
    /// 마지막으로 본 멀티캐스트 프로덕트 인덱스
    last_mcast: Mutex<Option<ProdIndex>>,

    timers: DelayQueue,
    requests: RequestQueue,
    stats: RwLock<ReceiverStats>,

    completed: watch::Sender<Option<ProdIndex>>,
    halted: watch::Sender<bool>,
    broken: Mutex<Option<Error>>,
}

impl Shared {
    fn fail(&self, err: Error) {
        error!("수신자 정지: {}", err);
        {
            let mut broken = self.broken.lock();
            if broken.is_none() {
                *broken = Some(err);
            }
        }
        self.halt();
    }

    /// 정지 순서: 지연 큐 비활성화 → 요청 큐 종료 신호 → I/O 태스크 취소
    fn halt(&self) {
        if self.halted.send_replace(true) {
            return;
        }
        self.timers.disable();
        let _ = self.requests.push(Request::Shutdown);
    }

    fn request(&self, request: Request) {
        debug!("요청 큐: {:?}", request);
        if let Err(e) = self.requests.push(request) {
            warn!("요청 큐 닫힘: {}", e);
        }
    }

    /// BOP 요청 (프로덕트당 한 번)
    fn request_bop(&self, index: ProdIndex) {
        if self.segments.contains(index) {
            return;
        }
        if self.missing_bops.lock().insert(index) {
            self.request(Request::MissingBop(index));
        }
    }

    /// `[from, to)`를 MTU 크기 요청으로 분할
    fn request_range(&self, index: ProdIndex, from: u32, to: u32) {
        let mut start = from as usize;
        let to = to as usize;
        while start < to {
            let len = (to - start).min(self.max_payload);
            self.request(Request::MissingData {
                index,
                offset: start as u32,
                len: len as u16,
            });
            start += len;
        }
    }

    /// `prev`와 `index` 사이에 빠진 프로덕트들의 BOP 요청
    ///
    /// 간격이 `max_bop_gap`보다 크면 잘못된 프레임으로 보고 요청하지 않음
    fn request_skipped_bops(&self, prev: ProdIndex, index: ProdIndex) {
        let skipped = index.wrapping_sub(prev).wrapping_sub(1);
        let max_gap = self.config.read().max_bop_gap;
        if skipped > max_gap {
            warn!(
                "프로덕트 {} → {} 간격 {}개가 한도 {}를 넘어 BOP 요청 생략",
                prev, index, skipped, max_gap
            );
            return;
        }
        let mut i = prev.wrapping_add(1);
        while i != index {
            self.request_bop(i);
            i = i.wrapping_add(1);
        }
    }

    /// 추적하지 않는 프로덕트의 멀티캐스트 DATA/EOP
    ///
    /// 마지막 멀티캐스트 인덱스 다음부터 이 인덱스까지 BOP를 요청함
    fn note_unknown(&self, index: ProdIndex) {
        let mut last = self.last_mcast.lock();
        match *last {
            Some(prev) if is_ahead(index, prev) => {
                self.request_skipped_bops(prev, index);
                self.request_bop(index);
                *last = Some(index);
            }
            Some(prev) if prev == index => self.request_bop(index),
            Some(_) => debug!("지난 프로덕트 {} 프레임 무시", index),
            None => {
                self.request_bop(index);
                *last = Some(index);
            }
        }
    }

    fn eop_delay(&self, size: u32) -> f64 {
        self.config.read().eop_timeout(size).as_secs_f64()
    }

    fn handle_multicast(&self, frame: Frame) -> Result<()> {
        let index = frame.prod_index();
        match frame.kind() {
            MessageKind::Bop => self.handle_bop(index, &frame.payload, true),
            MessageKind::Data => self.handle_block(index, frame.seqnum(), &frame.payload, true),
            MessageKind::Eop => {
                self.handle_eop(index, true);
                Ok(())
            }
            other => {
                warn!("멀티캐스트로 온 {:?} 무시 (prod_index={})", other, index);
                Ok(())
            }
        }
    }

    fn handle_unicast(&self, frame: Frame) -> Result<()> {
        let index = frame.prod_index();
        match frame.kind() {
            MessageKind::RetxBop => self.handle_bop(index, &frame.payload, false),
            MessageKind::RetxData => self.handle_block(index, frame.seqnum(), &frame.payload, false),
            MessageKind::RetxEop => {
                self.handle_eop(index, false);
                Ok(())
            }
            MessageKind::RetxRej => {
                self.handle_reject(index);
                Ok(())
            }
            other => Err(Error::UnexpectedMessage(format!(
                "유니캐스트로 온 {:?} (prod_index={})",
                other, index
            ))),
        }
    }

    fn handle_bop(&self, index: ProdIndex, payload: &[u8], from_mcast: bool) -> Result<()> {
        let bop = BopMessage::decode(payload)?;

        if from_mcast {
            let mut last = self.last_mcast.lock();
            if let Some(prev) = *last {
                if is_ahead(index, prev) {
                    // 사이에 BOP가 통째로 빠진 프로덕트
                    self.request_skipped_bops(prev, index);
                }
            }
            if last.map_or(true, |prev| is_ahead(index, prev)) {
                *last = Some(index);
            }
        }
        let requested = self.missing_bops.lock().remove(&index);
        if !from_mcast && !requested {
            // 멀티캐스트 BOP가 먼저 와서 이미 처리한 프로덕트
            debug!("요청하지 않은 RETX_BOP 무시: 프로덕트 {}", index);
            return Ok(());
        }

        if self.segments.register(index, bop.prodsize).is_err() {
            debug!("중복 BOP: 프로덕트 {}", index);
            return Ok(());
        }
        self.eop_status.lock().insert(index, false);

        let begin = ProductBegin {
            index,
            start_time: bop.start_time,
            size: bop.prodsize,
            metadata: bop.metadata,
        };
        let size = bop.prodsize as usize;
        let buffer = self.hooks.on_begin(&begin).map(|mut buf| {
            if buf.len() < size {
                buf.resize(size, 0);
            }
            buf
        });

        let mut tracker = ProdTracker {
            size: bop.prodsize,
            buffer,
            last_mcast_offset: None,
            requested_through: 0,
            retx_count: 0,
        };

        if !from_mcast {
            // 멀티캐스트가 이미 지나간 프로덕트면 데이터 전체를 요청
            let current = *self.last_mcast.lock() == Some(index);
            if !current {
                self.request_range(index, 0, bop.prodsize);
                tracker.requested_through = bop.prodsize;
            }
            self.request(Request::MissingEop(index));
        }

        self.trackers.lock().insert(index, tracker);
        self.stats.write().products_begun += 1;
        debug!(
            "프로덕트 {} 시작: {} bytes ({})",
            index,
            size,
            if from_mcast { "mcast" } else { "retx" }
        );

        if let Err(e) = self.timers.push(index, self.eop_delay(bop.prodsize)) {
            debug!("EOP 타이머 예약 실패: {}", e);
            self.eop_status.lock().remove(&index);
        }
        Ok(())
    }

    fn handle_block(
        &self,
        index: ProdIndex,
        offset: u32,
        payload: &[u8],
        from_mcast: bool,
    ) -> Result<()> {
        let len = payload.len() as u32;
        let mut trackers = self.trackers.lock();
        let Some(tracker) = trackers.get_mut(&index) else {
            drop(trackers);
            if from_mcast {
                self.note_unknown(index);
            }
            return Ok(());
        };

        if from_mcast {
            if let Some(previous) = tracker.last_mcast_offset {
                if offset < previous {
                    return Err(Error::SeqnumDecreased {
                        index,
                        previous,
                        got: offset,
                    });
                }
            }
            tracker.last_mcast_offset = Some(offset);
        }

        if offset as u64 + len as u64 > tracker.size as u64 {
            return Err(Error::OutOfBounds {
                index,
                offset,
                len,
                size: tracker.size,
            });
        }

        match self.segments.mark_received(index, offset, len)? {
            MarkOutcome::Updated => {
                if let Some(buf) = tracker.buffer.as_mut() {
                    let start = offset as usize;
                    buf[start..start + payload.len()].copy_from_slice(payload);
                }
                let mut stats = self.stats.write();
                if from_mcast {
                    stats.mcast_bytes += len as u64;
                } else {
                    tracker.retx_count += 1;
                    stats.retx_bytes += len as u64;
                }
            }
            MarkOutcome::Duplicate => self.stats.write().duplicates += 1,
            MarkOutcome::Unknown => {}
        }

        let mut gap = None;
        if from_mcast {
            if offset > tracker.requested_through {
                gap = Some((tracker.requested_through, offset));
            }
            tracker.requested_through = tracker.requested_through.max(offset + len);
        }
        drop(trackers);

        if let Some((from, to)) = gap {
            debug!("프로덕트 {} 갭 검출: [{}, {})", index, from, to);
            self.request_range(index, from, to);
        }
        if !from_mcast {
            self.try_complete(index);
        }
        Ok(())
    }

    fn handle_eop(&self, index: ProdIndex, from_mcast: bool) {
        if !self.segments.contains(index) {
            if from_mcast {
                self.note_unknown(index);
            } else {
                debug!("추적하지 않는 프로덕트 {}의 RETX_EOP 무시", index);
            }
            return;
        }

        if let Some(arrived) = self.eop_status.lock().get_mut(&index) {
            *arrived = true;
        }
        if self.try_complete(index) {
            return;
        }

        if self.segments.has_last_block(index) == Some(false) {
            let tail = {
                let mut trackers = self.trackers.lock();
                trackers.get_mut(&index).and_then(|t| {
                    let from = t.requested_through;
                    t.requested_through = t.size;
                    (from < t.size).then_some((from, t.size))
                })
            };
            if let Some((from, to)) = tail {
                debug!("프로덕트 {} 꼬리 누락: [{}, {})", index, from, to);
                self.request_range(index, from, to);
            }
        }
    }

    /// 완료됐으면 호스트 통지 + RETX_END
    fn try_complete(&self, index: ProdIndex) -> bool {
        if !self.segments.take_if_complete(index) {
            return false;
        }
        let Some(tracker) = self.trackers.lock().remove(&index) else {
            return false;
        };

        self.request(Request::RetxEnd(index));
        self.stats.write().products_completed += 1;
        info!(
            "프로덕트 {} 완료: {} bytes, 재전송 {} 블록",
            index, tracker.size, tracker.retx_count
        );
        self.hooks
            .on_end(index, tracker.buffer.map(BytesMut::freeze), tracker.retx_count);
        self.completed.send_replace(Some(index));
        true
    }

    fn handle_reject(&self, index: ProdIndex) {
        let had_bop_request = self.missing_bops.lock().remove(&index);
        let tracked = self.segments.remove(index);
        self.trackers.lock().remove(&index);

        if tracked || had_bop_request {
            warn!("프로덕트 {} 수신 실패 (송신자가 해제함)", index);
            self.stats.write().products_missed += 1;
            self.hooks.on_missed(index);
        }
    }

    fn expire(&self, index: ProdIndex) {
        let arrived = self.eop_status.lock().remove(&index).unwrap_or(false);
        if !arrived && self.segments.contains(index) {
            debug!("프로덕트 {} EOP 타임아웃", index);
            self.stats.write().eop_timeouts += 1;
            self.request(Request::MissingEop(index));
        }
    }
}

async fn run_multicast(shared: Arc<Shared>, mut mcast: Box<dyn MulticastRecv>) {
    let mut buf = vec![0u8; 65536];
    let mut halted = shared.halted.subscribe();

    loop {
        let received = tokio::select! {
            r = mcast.recv(&mut buf) => r,
            _ = halted.wait_for(|h| *h) => break,
        };
        let n = match received {
            Ok(n) => n,
            Err(e) => {
                shared.fail(e);
                break;
            }
        };

        let frame = match Frame::decode(&buf[..n], &*shared.auth) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("멀티캐스트 프레임 거부: {}", e);
                shared.stats.write().bad_frames += 1;
                continue;
            }
        };

        if let Err(e) = shared.handle_multicast(frame) {
            if e.is_framing() {
                warn!("멀티캐스트 프레임 거부: {}", e);
                shared.stats.write().bad_frames += 1;
            } else {
                shared.fail(e);
                break;
            }
        }
    }
    debug!("멀티캐스트 수신 태스크 종료");
}

async fn run_retx_receiver(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let mut halted = shared.halted.subscribe();

    loop {
        let read = tokio::select! {
            r = read_frame(&mut reader, &*shared.auth) => r,
            _ = halted.wait_for(|h| *h) => break,
        };
        match read {
            Ok(Some(frame)) => {
                if let Err(e) = shared.handle_unicast(frame) {
                    shared.fail(e);
                    break;
                }
            }
            Ok(None) => {
                shared.fail(Error::ConnectionBroken("송신자가 연결을 닫음".into()));
                break;
            }
            Err(e) => {
                // TCP 스트림은 프레이밍이 깨지면 복구 불가
                shared.fail(e);
                break;
            }
        }
    }
    debug!("재전송 수신 태스크 종료");
}

async fn run_requester(shared: Arc<Shared>, mut writer: OwnedWriteHalf) {
    loop {
        let request = match shared.requests.pop().await {
            Ok(Request::Shutdown) | Err(_) => break,
            Ok(request) => request,
        };
        let Some(frame) = request.to_frame() else {
            continue;
        };
        if let Err(e) = write_frame(&mut writer, &frame, &*shared.auth).await {
            shared.fail(Error::ConnectionBroken(format!("요청 전송 실패: {}", e)));
            break;
        }
        if !matches!(request, Request::RetxEnd(_)) {
            shared.stats.write().requests_sent += 1;
        }
    }
    debug!("요청 송신 태스크 종료");
}

async fn run_timeouts(shared: Arc<Shared>) {
    while let Ok(index) = shared.timers.pop().await {
        shared.expire(index);
    }
    debug!("EOP 타이머 태스크 종료");
}

/// 수신자 핸들
pub struct Receiver {
    shared: Arc<Shared>,
    /// 멀티캐스트 수신, 재전송 수신 (취소 대상)
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// 요청 송신, 타이머 (큐 종료로 스스로 끝남)
    queue_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Receiver {
    /// 송신자에 TCP 연결 후 수신 시작
    pub async fn start(
        config: Config,
        mcast: Box<dyn MulticastRecv>,
        sender_addr: SocketAddr,
        auth: Arc<dyn FrameAuth>,
        hooks: Arc<dyn ReceiverHooks>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(sender_addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let max_payload = config.max_payload(auth.mac_len());
        let (completed, _) = watch::channel(None);
        let (halted, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config: RwLock::new(config),
            auth,
            hooks,
            max_payload,
            segments: SegmentTracker::new(),
            trackers: Mutex::new(HashMap::new()),
            eop_status: Mutex::new(HashMap::new()),
            missing_bops: Mutex::new(HashSet::new()),
            last_mcast: Mutex::new(None),
            timers: DelayQueue::new(),
            requests: RequestQueue::new(),
            stats: RwLock::new(ReceiverStats::new()),
            completed,
            halted,
            broken: Mutex::new(None),
        });

        let io_tasks = vec![
            tokio::spawn(run_multicast(shared.clone(), mcast)),
            tokio::spawn(run_retx_receiver(shared.clone(), reader)),
        ];
        let queue_tasks = vec![
            tokio::spawn(run_requester(shared.clone(), writer)),
            tokio::spawn(run_timeouts(shared.clone())),
        ];

        info!("PMTP 수신자 시작: sender={}", sender_addr);

        Ok(Self {
            shared,
            io_tasks: Mutex::new(io_tasks),
            queue_tasks: Mutex::new(queue_tasks),
        })
    }

    /// 정지 후 모든 태스크 종료 대기
    pub async fn stop(&self) {
        self.shared.halt();
        let io_tasks: Vec<_> = self.io_tasks.lock().drain(..).collect();
        for task in &io_tasks {
            task.abort();
        }
        let queue_tasks: Vec<_> = self.queue_tasks.lock().drain(..).collect();
        for task in io_tasks.into_iter().chain(queue_tasks) {
            let _ = task.await;
        }
        info!("PMTP 수신자 정지: {}", self.shared.stats.read().summary());
    }

    /// 엔진이 멈출 때까지 대기. 치명적 에러로 멈췄으면 그 에러 반환
    pub async fn wait(&self) -> Result<()> {
        let mut halted = self.shared.halted.subscribe();
        let _ = halted.wait_for(|h| *h).await;
        match self.shared.broken.lock().as_ref() {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    pub fn last_completed(&self) -> Option<ProdIndex> {
        *self.shared.completed.borrow()
    }

    /// 마지막 완료 인덱스가 `index`에 도달할 때까지 대기
    pub async fn wait_completed(&self, index: ProdIndex) -> Result<()> {
        let mut completed = self.shared.completed.subscribe();
        let mut halted = self.shared.halted.subscribe();
        let reached = |last: &Option<ProdIndex>| last.map_or(false, |c| !is_ahead(index, c));

        tokio::select! {
            result = completed.wait_for(reached) => {
                result.map(|_| ()).map_err(|_| Error::Stopped)
            }
            _ = halted.wait_for(|h| *h) => {
                match self.shared.broken.lock().as_ref() {
                    Some(e) => Err(e.duplicate()),
                    None => Err(Error::Stopped),
                }
            }
        }
    }

    /// 링크 속도 추정치 변경 (이후 BOP부터 적용)
    pub fn set_link_speed(&self, bps: u64) {
        self.shared.config.write().link_speed_bps = bps;
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.stats.read().clone()
    }

    pub fn is_broken(&self) -> bool {
        self.shared.broken.lock().is_some()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shared.halt();
        for task in self.io_tasks.get_mut().drain(..) {
            task.abort();
        }
        for task in self.queue_tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
