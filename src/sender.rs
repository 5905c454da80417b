//! 송신자 엔진
//!
//! - 프로덕트마다 BOP → DATA(MTU 단위) → EOP 멀티캐스트
//! - 재전송 저장소에 참조를 남기고 지연 큐로 재전송 타임아웃 예약
//! - 코디네이터가 TCP 접속을 받아 수신자마다 워커 하나를 띄움
//! - 타임아웃 태스크가 만료된 프로덕트에 강제 RETX_EOP를 보내고 해제

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::auth::FrameAuth;
use crate::connection::{read_frame, Connection, ConnectionId, ConnectionSet};
use crate::delay_queue::DelayQueue;
use crate::frame::{is_ahead, BopMessage, Frame, MessageKind, ProdIndex, StartTime};
use crate::rate::RateShaper;
use crate::retx_store::{Release, Removal, RetxProduct, RetxStore};
use crate::stats::SenderStats;
use crate::transport::MulticastSend;
use crate::{Config, Error, Result};

/// 송신측 호스트 콜백
pub trait SenderHooks: Send + Sync {
    /// 새 수신자 접속 허가 여부
    fn vet_receiver(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// 프로덕트가 모든 수신자에게 끝났거나 타임아웃으로 해제됨 (프로덕트당 한 번)
    fn on_product_done(&self, _index: ProdIndex) {}
}

/// 콜백 없음
impl SenderHooks for () {}

/// 태스크 간 공유 상태
struct Shared {
    config: Config,
    auth: Arc<dyn FrameAuth>,
    mcast: Arc<dyn MulticastSend>,
    hooks: Arc<dyn SenderHooks>,
    max_payload: usize,

    store: RetxStore,
    timers: DelayQueue,
    conns: ConnectionSet,
    shaper: RateShaper,
    stats: RwLock<SenderStats>,

    /// 마지막으로 완료된 프로덕트
    completed: watch::Sender<Option<ProdIndex>>,

    /// 엔진 정지 신호
    halted: watch::Sender<bool>,

    /// 첫 치명적 에러
    broken: Mutex<Option<Error>>,

    /// 다음 프로덕트 인덱스 (send_product 직렬화 겸용)
    next_index: tokio::sync::Mutex<ProdIndex>,
}

impl Shared {
    fn check_broken(&self) -> Result<()> {
        if let Some(e) = self.broken.lock().as_ref() {
            return Err(e.duplicate());
        }
        if *self.halted.borrow() {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    /// 치명적 에러 기록 후 엔진 정지
    fn fail(&self, err: Error) {
        error!("송신자 정지: {}", err);
        {
            let mut broken = self.broken.lock();
            if broken.is_none() {
                *broken = Some(err);
            }
        }
        self.halt();
    }

    fn halt(&self) {
        self.timers.disable();
        self.halted.send_replace(true);
    }

    async fn multicast(&self, frame: &Frame) -> Result<()> {
        let wire = frame.encode(&*self.auth);
        self.shaper.pace(wire.len()).await;
        self.mcast.send(&wire).await
    }

    /// 프로덕트 해제 통지 (해제 경로당 정확히 한 번 호출됨)
    fn finish_product(&self, index: ProdIndex) {
        debug!("프로덕트 {} 해제", index);
        self.stats.write().products_done += 1;
        self.completed.send_replace(Some(index));
        self.hooks.on_product_done(index);
    }

    /// BOP, DATA 블록들, EOP를 차례로 멀티캐스트하고 재전송 타이머 예약
    async fn multicast_product(
        &self,
        index: ProdIndex,
        bop: &BopMessage,
        data: &Bytes,
    ) -> Result<()> {
        self.multicast(&Frame::bop(MessageKind::Bop, index, bop))
            .await?;

        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + self.max_payload).min(data.len());
            let frame = Frame::new(MessageKind::Data, index, offset as u32, data.slice(offset..end));
            self.multicast(&frame).await?;
            offset = end;
        }

        self.multicast(&Frame::control(MessageKind::Eop, index))
            .await?;
        self.timers
            .push(index, self.config.retx_timeout.as_secs_f64())
    }

    async fn send_product(&self, data: Bytes, metadata: &[u8]) -> Result<ProdIndex> {
        self.check_broken()?;

        let max_meta = self.config.max_bop_metadata(self.auth.mac_len());
        if metadata.len() > max_meta {
            return Err(Error::MetadataTooLarge {
                size: metadata.len(),
                max: max_meta,
            });
        }
        let prodsize =
            u32::try_from(data.len()).map_err(|_| Error::ProductTooLarge { size: data.len() })?;

        let mut next_index = self.next_index.lock().await;
        let index = *next_index;
        let start_time = StartTime::now();
        let metadata = Bytes::copy_from_slice(metadata);

        self.store.insert(
            RetxProduct {
                index,
                data: data.clone(),
                metadata: metadata.clone(),
                start_time,
                timeout: self.config.retx_timeout,
            },
            self.conns.ids(),
        )?;
        *next_index = index.wrapping_add(1);

        let bop = BopMessage {
            start_time,
            prodsize,
            metadata,
        };
        if let Err(e) = self.multicast_product(index, &bop, &data).await {
            // 타이머가 없으므로 여기서 바로 해제
            warn!("프로덕트 {} 멀티캐스트 실패: {}", index, e);
            if self.store.request_removal(index) == Removal::Removed {
                self.finish_product(index);
            }
            return Err(e);
        }

        {
            let mut stats = self.stats.write();
            stats.products_sent += 1;
            stats.bytes_sent += data.len() as u64;
        }
        debug!("프로덕트 {} 멀티캐스트 완료: {} bytes", index, data.len());
        Ok(index)
    }

    /// 요청 하나 처리
    async fn handle_request(&self, conn: &Connection, frame: Frame) -> Result<()> {
        let index = frame.prod_index();
        match frame.kind() {
            kind @ (MessageKind::RetxReq | MessageKind::BopReq | MessageKind::EopReq) => {
                self.stats.write().retx_requests += 1;
                let Some(entry) = self.store.acquire(index) else {
                    debug!("프로덕트 {} 없음, RETX_REJ → {}", index, conn.peer);
                    self.stats.write().rejections += 1;
                    return conn
                        .send(&Frame::control(MessageKind::RetxRej, index), &*self.auth)
                        .await;
                };

                let result = match kind {
                    MessageKind::RetxReq => {
                        self.retransmit_data(conn, &entry, frame.seqnum(), frame.header.payload_len)
                            .await
                    }
                    MessageKind::BopReq => {
                        let bop = BopMessage {
                            start_time: entry.start_time,
                            prodsize: entry.len(),
                            metadata: entry.metadata.clone(),
                        };
                        conn.send(&Frame::bop(MessageKind::RetxBop, index, &bop), &*self.auth)
                            .await
                    }
                    _ => {
                        conn.send(&Frame::control(MessageKind::RetxEop, index), &*self.auth)
                            .await
                    }
                };

                if self.store.release(index) == Release::Removed {
                    self.finish_product(index);
                }
                result
            }
            MessageKind::RetxEnd => {
                debug!("RETX_END: 프로덕트 {} ← {}", index, conn.peer);
                let conns = &self.conns;
                if self
                    .store
                    .clear_receiver(index, conn.id, |c| conns.is_live(c))
                    && self.store.request_removal(index) == Removal::Removed
                {
                    self.finish_product(index);
                }
                Ok(())
            }
            other => Err(Error::UnexpectedMessage(format!(
                "{:?} from {} (prod_index={})",
                other, conn.peer, index
            ))),
        }
    }

    /// 요청 구간을 MTU 단위로 재전송
    ///
    /// 시작은 청크 경계로 내리고 끝은 프로덕트 길이로 자름
    async fn retransmit_data(
        &self,
        conn: &Connection,
        entry: &RetxProduct,
        seqnum: u32,
        len: u16,
    ) -> Result<()> {
        let prod_len = entry.data.len();
        let chunk = self.max_payload;
        let mut start = (seqnum as usize / chunk) * chunk;
        let end = (seqnum as usize + len as usize).min(prod_len);
        if start >= end {
            warn!(
                "범위 밖 재전송 요청: 프로덕트 {}, [{}, +{}), size={}",
                entry.index, seqnum, len, prod_len
            );
            return Ok(());
        }

        let mut sent = 0u64;
        while start < end {
            let stop = (start + chunk).min(prod_len);
            let frame = Frame::new(
                MessageKind::RetxData,
                entry.index,
                start as u32,
                entry.data.slice(start..stop),
            );
            conn.send(&frame, &*self.auth).await?;
            sent += (stop - start) as u64;
            start = stop;
        }
        self.stats.write().retx_bytes += sent;
        Ok(())
    }

    /// 끊긴 연결 정리
    fn drop_connection(&self, id: ConnectionId, peer: SocketAddr) {
        if self.conns.remove(id).is_none() {
            return;
        }
        self.stats.write().receivers_lost += 1;
        for index in self.store.remove_receiver(id) {
            self.finish_product(index);
        }

        if self.conns.is_empty() && !*self.halted.borrow() {
            self.fail(Error::ConnectionBroken(format!(
                "마지막 수신자 {} 연결 끊김",
                peer
            )));
        }
    }

    /// 재전송 타임아웃 처리
    async fn expire(&self, index: ProdIndex) {
        let conns = &self.conns;
        let targets = self.store.unfinished_live(index, |c| conns.is_live(c));
        if !targets.is_empty() {
            info!(
                "프로덕트 {} 재전송 타임아웃, 미완료 수신자 {}명에게 강제 EOP",
                index,
                targets.len()
            );
        }
        let eop = Frame::control(MessageKind::RetxEop, index);
        for id in targets {
            if let Some(conn) = self.conns.get(id) {
                if let Err(e) = conn.send(&eop, &*self.auth).await {
                    warn!("강제 EOP 전송 실패 ({}): {}", conn.peer, e);
                }
            }
        }

        self.stats.write().timeouts += 1;
        if self.store.request_removal(index) == Removal::Removed {
            self.finish_product(index);
        }
    }
}

/// 수신자 하나를 담당하는 워커
async fn run_worker(shared: Arc<Shared>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    info!("수신자 접속: {} (id={})", conn.peer, conn.id);

    loop {
        match read_frame(&mut reader, &*shared.auth).await {
            Ok(Some(frame)) => {
                if let Err(e) = shared.handle_request(&conn, frame).await {
                    if e.is_protocol_violation() {
                        shared.fail(e);
                        return;
                    }
                    warn!("수신자 {} 처리 에러: {}", conn.peer, e);
                    break;
                }
            }
            Ok(None) => {
                info!("수신자 연결 종료: {}", conn.peer);
                break;
            }
            Err(e) => {
                warn!("수신자 {} 읽기 에러: {}", conn.peer, e);
                break;
            }
        }
    }

    shared.drop_connection(conn.id, conn.peer);
}

/// 접속 수락 루프
async fn run_coordinator(shared: Arc<Shared>, listener: TcpListener) {
    let mut workers = JoinSet::new();
    let mut halted = shared.halted.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("접속 수락 에러: {}", e);
                        continue;
                    }
                };

                if shared.conns.len() >= shared.config.max_receivers {
                    warn!(
                        "수신자 {} 거부: {}",
                        peer,
                        Error::TooManyConnections { max: shared.config.max_receivers }
                    );
                    continue;
                }
                if !shared.hooks.vet_receiver(peer) {
                    info!("수신자 {} 인가 거부", peer);
                    continue;
                }

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY 설정 실패: {}", e);
                }
                let (reader, writer) = stream.into_split();
                let conn = shared.conns.add(peer, writer);
                shared.stats.write().receivers_accepted += 1;
                workers.spawn(run_worker(shared.clone(), conn, reader));
            }
            Some(_) = workers.join_next(), if !workers.is_empty() => {}
            _ = halted.wait_for(|h| *h) => break,
        }
    }
    workers.shutdown().await;
    debug!("코디네이터 종료");
}

/// 재전송 타임아웃 루프
async fn run_timeouts(shared: Arc<Shared>) {
    while let Ok(index) = shared.timers.pop().await {
        shared.expire(index).await;
    }
    debug!("타임아웃 태스크 종료");
}

/// 송신자 핸들
pub struct Sender {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    /// 코디네이터 (정지 신호로 스스로 끝남)
    coordinator: Mutex<Option<JoinHandle<()>>>,
    /// 타임아웃 태스크 (강제 EOP 전송 중일 수 있어 취소 대상)
    timeouts: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    /// 송신자 시작
    ///
    /// `listener`로 수신자의 재전송 연결을 받고 `mcast`로 프로덕트를 멀티캐스트함
    pub fn start(
        config: Config,
        mcast: Arc<dyn MulticastSend>,
        listener: TcpListener,
        auth: Arc<dyn FrameAuth>,
        hooks: Arc<dyn SenderHooks>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let max_payload = config.max_payload(auth.mac_len());
        let (completed, _) = watch::channel(None);
        let (halted, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            max_payload,
            shaper: RateShaper::new(config.send_rate_bps),
            next_index: tokio::sync::Mutex::new(config.initial_prod_index),
            config,
            auth,
            mcast,
            hooks,
            store: RetxStore::new(),
            timers: DelayQueue::new(),
            conns: ConnectionSet::new(),
            stats: RwLock::new(SenderStats::new()),
            completed,
            halted,
            broken: Mutex::new(None),
        });

        let coordinator = tokio::spawn(run_coordinator(shared.clone(), listener));
        let timeouts = tokio::spawn(run_timeouts(shared.clone()));

        info!(
            "PMTP 송신자 시작: {} (max payload {} bytes)",
            local_addr, max_payload
        );

        Ok(Self {
            shared,
            local_addr,
            coordinator: Mutex::new(Some(coordinator)),
            timeouts: Mutex::new(Some(timeouts)),
        })
    }

    /// 재전송 연결을 받는 주소
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 프로덕트 전송. 할당된 인덱스 반환
    ///
    /// `data`는 참조만 보관되며 재전송 타임아웃까지 유지됨
    pub async fn send_product(&self, data: Bytes, metadata: &[u8]) -> Result<ProdIndex> {
        self.shared.send_product(data, metadata).await
    }

    pub fn receiver_count(&self) -> usize {
        self.shared.conns.len()
    }

    /// 멀티캐스트 속도 제한 변경 (bits/s, 0 = 제한 없음)
    pub fn set_send_rate(&self, rate_bps: u64) {
        self.shared.shaper.set_rate(rate_bps);
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
                self.shared.check_broken()
            }
        }
    }

    pub fn stats(&self) -> SenderStats {
        self.shared.stats.read().clone()
    }

    /// 치명적 에러로 정지했는지
    pub fn is_broken(&self) -> bool {
        self.shared.broken.lock().is_some()
    }

    /// 정지 후 모든 태스크 종료 대기
    ///
    /// 코디네이터는 정지 신호를 받으면 워커들을 취소하고 기다린 뒤 끝남
    pub async fn stop(&self) {
        self.shared.halt();
        let timeouts = self.timeouts.lock().take();
        if let Some(task) = timeouts {
            task.abort();
            let _ = task.await;
        }
        let coordinator = self.coordinator.lock().take();
        if let Some(task) = coordinator {
            let _ = task.await;
        }
        self.shared.conns.clear();
        info!("PMTP 송신자 정지: {}", self.shared.stats.read().summary());
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.shared.halt();
        for task in [self.coordinator.get_mut().take(), self.timeouts.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}
