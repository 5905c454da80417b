//! 전송 통계

use std::time::{Duration, Instant};

/// 송신자 통계
#[derive(Debug, Clone)]
pub struct SenderStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 멀티캐스트한 프로덕트 수
    pub products_sent: u64,

    /// 완료(해제)된 프로덕트 수
    pub products_done: u64,

    /// 멀티캐스트 데이터 바이트
    pub bytes_sent: u64,

    /// 수신한 재전송 요청 수 (RETX_REQ/BOP_REQ/EOP_REQ)
    pub retx_requests: u64,

    /// 재전송한 데이터 바이트
    pub retx_bytes: u64,

    /// RETX_REJ 응답 수
    pub rejections: u64,

    /// 재전송 타임아웃으로 해제된 프로덕트 수
    pub timeouts: u64,

    /// 누적 접속 수신자 수
    pub receivers_accepted: u64,

    /// 끊긴 수신자 수
    pub receivers_lost: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            products_sent: 0,
            products_done: 0,
            bytes_sent: 0,
            retx_requests: 0,
            retx_bytes: 0,
            rejections: 0,
            timeouts: 0,
            receivers_accepted: 0,
            receivers_lost: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 멀티캐스트 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 멀티캐스트 대비 재전송 비율
    pub fn retx_ratio(&self) -> f64 {
        if self.bytes_sent == 0 {
            return 0.0;
        }
        self.retx_bytes as f64 / self.bytes_sent as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Products: {}/{} | Bytes: {} | Throughput: {:.2} MB/s | Retx: {} req, {:.2}% | Rejected: {} | Timeouts: {}",
            self.elapsed().as_secs_f64(),
            self.products_done,
            self.products_sent,
            self.bytes_sent,
            self.throughput() / 1_000_000.0,
            self.retx_requests,
            self.retx_ratio() * 100.0,
            self.rejections,
            self.timeouts,
        )
    }
}

impl Default for SenderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 수신자 통계
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    pub start_time: Instant,

    /// BOP를 받은 프로덕트 수
    pub products_begun: u64,

    /// 완료된 프로덕트 수
    pub products_completed: u64,

    /// 놓친 프로덕트 수 (RETX_REJ)
    pub products_missed: u64,

    /// 멀티캐스트로 받은 데이터 바이트
    pub mcast_bytes: u64,

    /// 재전송으로 받은 데이터 바이트
    pub retx_bytes: u64,

    /// 보낸 재전송 요청 수
    pub requests_sent: u64,

    /// 중복 블록 수
    pub duplicates: u64,

    /// EOP 타임아웃 수
    pub eop_timeouts: u64,

    /// 거부된 프레임 수 (프레이밍/MAC 에러)
    pub bad_frames: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            products_begun: 0,
            products_completed: 0,
            products_missed: 0,
            mcast_bytes: 0,
            retx_bytes: 0,
            requests_sent: 0,
            duplicates: 0,
            eop_timeouts: 0,
            bad_frames: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 멀티캐스트 손실 추정치 (재전송 바이트 비율)
    pub fn loss_rate(&self) -> f64 {
        let total = self.mcast_bytes + self.retx_bytes;
        if total == 0 {
            return 0.0;
        }
        self.retx_bytes as f64 / total as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Products: {}/{} (missed {}) | Bytes: {} mcast + {} retx | Loss: {:.2}% | Requests: {} | Dups: {} | EOP timeouts: {}",
            self.elapsed().as_secs_f64(),
            self.products_completed,
            self.products_begun,
            self.products_missed,
            self.mcast_bytes,
            self.retx_bytes,
            self.loss_rate() * 100.0,
            self.requests_sent,
            self.duplicates,
            self.eop_timeouts,
        )
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios() {
        let mut stats = SenderStats::new();
        assert_eq!(stats.retx_ratio(), 0.0);
        stats.bytes_sent = 1000;
        stats.retx_bytes = 250;
        assert!((stats.retx_ratio() - 0.25).abs() < f64::EPSILON);

        let mut rstats = ReceiverStats::new();
        rstats.mcast_bytes = 1976;
        rstats.retx_bytes = 1024;
        assert!(rstats.loss_rate() > 0.34 && rstats.loss_rate() < 0.35);
        assert!(rstats.summary().contains("Requests: 0"));
    }
}
