//! 송신측 재전송 저장소
//!
//! 프로덕트 인덱스 → 재전송 엔트리. 프로덕트 바이트는 복사하지 않고
//! `Bytes` 참조만 보관함 (메타데이터는 복사).
//!
//! 워커가 엔트리를 사용 중(`acquire` ~ `release`)일 때 타임아웃/RETX_END가
//! 삭제를 요청하면 삭제는 지연되고, 마지막 사용자가 `release`할 때 완료됨.
//! 모든 삭제 경로를 통틀어 정확히 한 호출자만 `Removed`를 받음

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::ConnectionId;
use crate::error::{Error, Result};
use crate::frame::{ProdIndex, StartTime};

/// 재전송 엔트리 (불변 부분)
#[derive(Debug)]
pub struct RetxProduct {
    pub index: ProdIndex,
    pub data: Bytes,
    pub metadata: Bytes,
    pub start_time: StartTime,
    pub timeout: Duration,
}

impl RetxProduct {
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `release` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// 사용 해제만 함
    Released,

    /// 지연된 삭제를 이 호출이 완료함 (호출자가 완료 통지)
    Removed,

    NotFound,
}

/// `request_removal` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// 즉시 삭제됨 (호출자가 완료 통지)
    Removed,

    /// 사용 중이라 삭제가 지연됨 (마지막 release가 통지)
    Deferred,

    /// 없거나 이미 삭제 대기 중
    NotFound,
}

#[derive(Debug)]
struct Slot {
    entry: Arc<RetxProduct>,
    unfinished: HashSet<ConnectionId>,
    users: usize,
    pending_removal: bool,
}

impl Slot {
    /// 삭제 요청 처리. true면 즉시 삭제 가능
    fn mark_removal(&mut self) -> Removal {
        if self.pending_removal {
            Removal::NotFound
        } else if self.users > 0 {
            self.pending_removal = true;
            Removal::Deferred
        } else {
            Removal::Removed
        }
    }
}

/// 재전송 저장소
#[derive(Debug, Default)]
pub struct RetxStore {
    slots: Mutex<HashMap<ProdIndex, Slot>>,
}

impl RetxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 엔트리 추가. 같은 인덱스가 있으면 에러
    pub fn insert(
        &self,
        entry: RetxProduct,
        unfinished: impl IntoIterator<Item = ConnectionId>,
    ) -> Result<Arc<RetxProduct>> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&entry.index) {
            return Err(Error::AlreadyExists(entry.index));
        }
        let entry = Arc::new(entry);
        slots.insert(
            entry.index,
            Slot {
                entry: entry.clone(),
                unfinished: unfinished.into_iter().collect(),
                users: 0,
                pending_removal: false,
            },
        );
        Ok(entry)
    }

    /// 사용 시작. 반드시 `release`와 짝을 이뤄야 함
    pub fn acquire(&self, index: ProdIndex) -> Option<Arc<RetxProduct>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&index)?;
        slot.users += 1;
        Some(slot.entry.clone())
    }

    pub fn release(&self, index: ProdIndex) -> Release {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&index) else {
            return Release::NotFound;
        };
        slot.users = slot.users.saturating_sub(1);
        if slot.users == 0 && slot.pending_removal {
            slots.remove(&index);
            Release::Removed
        } else {
            Release::Released
        }
    }

    pub fn request_removal(&self, index: ProdIndex) -> Removal {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&index) else {
            return Removal::NotFound;
        };
        let outcome = slot.mark_removal();
        if outcome == Removal::Removed {
            slots.remove(&index);
        }
        outcome
    }

    /// 수신자 하나를 미완료 집합에서 제거하고, 집합이 비었는지 반환
    ///
    /// 끊긴 연결은 `is_live`로 함께 걸러냄
    pub fn clear_receiver(
        &self,
        index: ProdIndex,
        conn: ConnectionId,
        is_live: impl Fn(ConnectionId) -> bool,
    ) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&index) else {
            return false;
        };
        slot.unfinished.remove(&conn);
        slot.unfinished.retain(|c| is_live(*c));
        slot.unfinished.is_empty()
    }

    /// 끊긴 수신자를 모든 미완료 집합에서 제거
    ///
    /// 이 호출로 삭제가 완료된 프로덕트 인덱스를 반환함 (호출자가 통지).
    /// 사용 중인 엔트리는 지연 삭제로 넘어감
    pub fn remove_receiver(&self, conn: ConnectionId) -> Vec<ProdIndex> {
        let mut slots = self.slots.lock();
        let mut finished = Vec::new();
        for (index, slot) in slots.iter_mut() {
            if slot.unfinished.remove(&conn)
                && slot.unfinished.is_empty()
                && slot.mark_removal() == Removal::Removed
            {
                finished.push(*index);
            }
        }
        for index in &finished {
            slots.remove(index);
        }
        finished
    }

    /// 아직 연결된 미완료 수신자 목록
    pub fn unfinished_live(
        &self,
        index: ProdIndex,
        is_live: impl Fn(ConnectionId) -> bool,
    ) -> Vec<ConnectionId> {
        self.slots
            .lock()
            .get(&index)
            .map(|slot| slot.unfinished.iter().copied().filter(|c| is_live(*c)).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, index: ProdIndex) -> bool {
        self.slots.lock().contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
