//! 고정 속도 셰이퍼
//!
//! 멀티캐스트 송신 속도를 설정한 bits/s 이하로 맞춤.
//! 혼잡 제어는 하지 않으며 패킷마다 다음 송신 가능 시각을 예약하는 방식

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// 버스트 허용량. 이보다 오래 쉬었으면 밀린 시간을 버림
const MAX_BURST: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct ShaperState {
    /// bits/s (0 = 제한 없음)
    rate_bps: u64,
    next_slot: Instant,
}

#[derive(Debug)]
pub struct RateShaper {
    state: Mutex<ShaperState>,
}

impl RateShaper {
    pub fn new(rate_bps: u64) -> Self {
        Self {
            state: Mutex::new(ShaperState {
                rate_bps,
                next_slot: Instant::now(),
            }),
        }
    }

    pub fn set_rate(&self, rate_bps: u64) {
        let mut state = self.state.lock();
        state.rate_bps = rate_bps;
        state.next_slot = Instant::now();
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate_bps
    }

    /// 패킷 하나 전송 시간
    fn packet_delay(rate_bps: u64, bytes: usize) -> Duration {
        let sec = (bytes as f64 * 8.0 / rate_bps as f64).max(0.000_001);
        Duration::from_secs_f64(sec)
    }

    /// `bytes` 크기 패킷을 보내기 전에 호출
    pub async fn pace(&self, bytes: usize) {
        let wait_until = {
            let mut state = self.state.lock();
            if state.rate_bps == 0 {
                return;
            }
            let now = Instant::now();
            if state.next_slot + MAX_BURST < now {
                state.next_slot = now;
            }
            let slot = state.next_slot;
            state.next_slot = slot + Self::packet_delay(state.rate_bps, bytes);
            slot
        };
        if wait_until > Instant::now() {
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_does_not_wait() {
        let shaper = RateShaper::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            shaper.pace(1460).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_limits_throughput() {
        // 800 kbit/s = 100 KB/s, 20KB → 약 200ms
        let shaper = RateShaper::new(800_000);
        let start = Instant::now();
        for _ in 0..20 {
            shaper.pace(1000).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(180));
        assert_eq!(shaper.rate(), 800_000);
    }
}
