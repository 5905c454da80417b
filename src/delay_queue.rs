//! 지연 큐
//!
//! (프로덕트 인덱스, 공개 시각) 원소를 공개 시각 오름차순으로 꺼내는 우선순위 큐.
//! 송신자는 재전송 타임아웃, 수신자는 EOP 누락 타임아웃에 사용함.
//! 폴링 없이 가장 이른 원소의 시각까지 잠들었다가, 더 이른 원소가 들어오면 깨어남

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::frame::ProdIndex;

/// 지연 상한 (1년). 이보다 긴 지연은 이 값으로 자름
pub const MAX_DELAY_SECS: f64 = 365.0 * 24.0 * 3600.0;

#[derive(Debug, Default)]
struct Inner {
    /// (공개 시각, 삽입 순번, 인덱스)
    heap: BinaryHeap<Reverse<(Instant, u64, ProdIndex)>>,
    next_seq: u64,
    disabled: bool,
}

/// 프로덕트 타이머용 지연 큐
#[derive(Debug, Default)]
pub struct DelayQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// `delay_secs` 초 뒤에 공개될 원소 추가 (음수/0이면 즉시 공개)
    pub fn push(&self, index: ProdIndex, delay_secs: f64) -> Result<()> {
        let now = Instant::now();
        // NaN은 즉시 공개
        let delay = if delay_secs.is_nan() {
            0.0
        } else {
            delay_secs.clamp(-MAX_DELAY_SECS, MAX_DELAY_SECS)
        };
        let reveal = if delay >= 0.0 {
            now.checked_add(Duration::from_secs_f64(delay))
                .unwrap_or(now)
        } else {
            now.checked_sub(Duration::from_secs_f64(-delay))
                .unwrap_or(now)
        };

        {
            let mut inner = self.inner.lock();
            if inner.disabled {
                return Err(Error::Disabled);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse((reveal, seq, index)));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// 가장 이른 원소가 공개될 때까지 대기 후 반환
    ///
    /// 대기 중에 비활성화되면 `Error::Disabled`
    pub async fn pop(&self) -> Result<ProdIndex> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 상태 확인 전에 등록해야 그 사이의 알림을 놓치지 않음
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock();
                if inner.disabled {
                    return Err(Error::Disabled);
                }
                match inner.heap.peek().map(|Reverse((reveal, _, _))| *reveal) {
                    Some(reveal) if reveal <= Instant::now() => {
                        if let Some(Reverse((_, _, index))) = inner.heap.pop() {
                            return Ok(index);
                        }
                        None
                    }
                    other => other,
                }
            };

            match deadline {
                Some(reveal) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(reveal) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// 비활성화 (멱등). 대기 중인 모든 pop을 깨움
    pub fn disable(&self) {
        self.inner.lock().disabled = true;
        self.notify.notify_waiters();
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pops_in_reveal_order() {
        let queue = DelayQueue::new();
        queue.push(1, 0.5).unwrap();
        queue.push(2, 0.1).unwrap();

        let start = Instant::now();
        assert_eq!(queue.pop().await.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(queue.pop().await.unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_negative_delay_is_due() {
        let queue = DelayQueue::new();
        queue.push(7, -3.0).unwrap();
        let popped = tokio::time::timeout(Duration::from_millis(50), queue.pop()).await;
        assert_eq!(popped.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_non_finite_delays() {
        let queue = DelayQueue::new();
        queue.push(1, f64::NAN).unwrap();
        queue.push(2, f64::INFINITY).unwrap();
        queue.push(3, f64::NEG_INFINITY).unwrap();

        let mut due = Vec::new();
        for _ in 0..2 {
            let popped = tokio::time::timeout(Duration::from_millis(50), queue.pop()).await;
            due.push(popped.unwrap().unwrap());
        }
        due.sort_unstable();
        assert_eq!(due, vec![1, 3]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_earlier_push_wakes_waiter() {
        let queue = Arc::new(DelayQueue::new());
        queue.push(1, 10.0).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(2, 0.0).unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert_eq!(popped.unwrap().unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disable_wakes_waiter() {
        let queue = Arc::new(DelayQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queue.is_disabled());
        queue.disable();
        queue.disable();
        assert!(queue.is_disabled());

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(result.unwrap().unwrap(), Err(Error::Disabled)));
        assert!(matches!(queue.push(1, 0.0), Err(Error::Disabled)));
    }
}
