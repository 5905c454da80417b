//! 수신측 세그먼트 추적기
//!
//! 프로덕트마다 "아직 받지 못한 바이트 구간"만 정렬된 맵(시작 → 길이)으로 관리함.
//! 처음엔 `{0 → size}` 하나이고, 블록이 도착할 때마다 구간을 자르거나 분할함.
//! 맵이 비면 프로덕트 완료

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::frame::ProdIndex;

/// 블록 반영 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// 누락 구간이 줄어듦
    Updated,

    /// 이미 받은 블록
    Duplicate,

    /// 추적하지 않는 프로덕트
    Unknown,
}

/// 프로덕트 하나의 누락 구간 맵
#[derive(Debug)]
struct SegmentMap {
    size: u32,
    missing: BTreeMap<u32, u32>,
}

impl SegmentMap {
    fn new(size: u32) -> Self {
        let mut missing = BTreeMap::new();
        if size > 0 {
            missing.insert(0, size);
        }
        Self { size, missing }
    }

    fn mark(&mut self, index: ProdIndex, offset: u32, len: u32) -> Result<MarkOutcome> {
        let end = offset as u64 + len as u64;
        if end > self.size as u64 {
            return Err(Error::OutOfBounds {
                index,
                offset,
                len,
                size: self.size,
            });
        }
        if len == 0 {
            return Ok(MarkOutcome::Duplicate);
        }
        let end = end as u32;

        // 누락 구간의 시작과 정확히 일치
        if let Some(&gap_len) = self.missing.get(&offset) {
            if len > gap_len {
                return Err(Error::Misaligned { index, offset, len });
            }
            self.missing.remove(&offset);
            if len < gap_len {
                self.missing.insert(end, gap_len - len);
            }
            return Ok(MarkOutcome::Updated);
        }

        // 앞쪽 누락 구간 안에 포함되는지
        let pred = self
            .missing
            .range((Bound::Unbounded, Bound::Excluded(offset)))
            .next_back()
            .map(|(&start, &gap_len)| (start, gap_len));

        let Some((start, gap_len)) = pred else {
            return Ok(MarkOutcome::Duplicate);
        };
        let gap_end = start as u64 + gap_len as u64;

        if gap_end <= offset as u64 {
            Ok(MarkOutcome::Duplicate)
        } else if gap_end > end as u64 {
            // 구간 중간: 둘로 분할
            self.missing.insert(start, offset - start);
            self.missing.insert(end, (gap_end - end as u64) as u32);
            Ok(MarkOutcome::Updated)
        } else if gap_end == end as u64 {
            // 구간 끝부분
            self.missing.insert(start, offset - start);
            Ok(MarkOutcome::Updated)
        } else {
            // 누락 구간 경계를 걸침
            Err(Error::Misaligned { index, offset, len })
        }
    }

    fn has_last_block(&self) -> bool {
        match self.missing.iter().next_back() {
            None => true,
            Some((&start, &len)) => (start as u64 + len as u64) < self.size as u64,
        }
    }
}

/// 프로덕트별 누락 구간 추적기
#[derive(Debug, Default)]
pub struct SegmentTracker {
    maps: Mutex<HashMap<ProdIndex, SegmentMap>>,
}

impl SegmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 프로덕트 등록. 크기 0이면 처음부터 완료 상태
    pub fn register(&self, index: ProdIndex, size: u32) -> Result<()> {
        let mut maps = self.maps.lock();
        if maps.contains_key(&index) {
            return Err(Error::AlreadyExists(index));
        }
        maps.insert(index, SegmentMap::new(size));
        Ok(())
    }

    /// 수신 블록 반영
    pub fn mark_received(&self, index: ProdIndex, offset: u32, len: u32) -> Result<MarkOutcome> {
        match self.maps.lock().get_mut(&index) {
            Some(map) => map.mark(index, offset, len),
            None => Ok(MarkOutcome::Unknown),
        }
    }

    /// 완료 여부 (추적하지 않는 프로덕트는 None)
    pub fn is_complete(&self, index: ProdIndex) -> Option<bool> {
        self.maps.lock().get(&index).map(|m| m.missing.is_empty())
    }

    /// 마지막 블록 수신 여부
    pub fn has_last_block(&self, index: ProdIndex) -> Option<bool> {
        self.maps.lock().get(&index).map(SegmentMap::has_last_block)
    }

    pub fn contains(&self, index: ProdIndex) -> bool {
        self.maps.lock().contains_key(&index)
    }

    pub fn remove(&self, index: ProdIndex) -> bool {
        self.maps.lock().remove(&index).is_some()
    }

    /// 완료됐으면 삭제하고 true (원자적)
    pub fn take_if_complete(&self, index: ProdIndex) -> bool {
        let mut maps = self.maps.lock();
        match maps.get(&index) {
            Some(map) if map.missing.is_empty() => {
                maps.remove(&index);
                true
            }
            _ => false,
        }
    }

    /// 누락 구간 목록 (시작, 길이)
    pub fn missing_ranges(&self, index: ProdIndex) -> Option<Vec<(u32, u32)>> {
        self.maps
            .lock()
            .get(&index)
            .map(|m| m.missing.iter().map(|(&s, &l)| (s, l)).collect())
    }

    pub fn len(&self) -> usize {
        self.maps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.lock().is_empty()
    }
}
