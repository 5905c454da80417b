//! 프로토콜 설정

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::delay_queue::MAX_DELAY_SECS;
use crate::{BOP_FIXED_LEN, DEFAULT_MAX_PACKET, HEADER_LEN};

/// PMTP 프로토콜 설정 (송신자/수신자 공용)
#[derive(Debug, Clone)]
pub struct Config {
    /// 최대 패킷 크기 (헤더 + 페이로드 + MAC, 바이트)
    pub max_packet: usize,

    /// 재전송 정보 보관 기간
    /// 이 시간이 지나면 송신자는 강제 EOP를 보내고 프로덕트를 해제함
    pub retx_timeout: Duration,

    /// 수신측 링크 속도 추정치 (bits/s)
    pub link_speed_bps: u64,

    /// EOP 대기 시간 배수 (예상 수신 시간 × factor)
    pub eop_timeout_factor: f64,

    /// 멀티캐스트 송신 속도 제한 (bits/s)
    /// 0이면 제한 없음
    pub send_rate_bps: u64,

    /// 멀티캐스트 TTL
    pub mcast_ttl: u32,

    /// 멀티캐스트 송수신 인터페이스 주소
    pub interface: Ipv4Addr,

    /// 첫 프로덕트 인덱스
    pub initial_prod_index: u32,

    /// 최대 동시 수신자 수
    pub max_receivers: usize,

    /// 소켓 버퍼 크기
    pub socket_buffer_size: usize,

    /// 한 번에 BOP를 요청할 수 있는 빠진 프로덕트 수 (수신측)
    pub max_bop_gap: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet: DEFAULT_MAX_PACKET,
            retx_timeout: Duration::from_secs(600), // 10분
            link_speed_bps: 20_000_000,             // 20Mbps
            eop_timeout_factor: 20.0,
            send_rate_bps: 0, // 최대 속도
            mcast_ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
            initial_prod_index: 0,
            max_receivers: 256,
            socket_buffer_size: 2 * 1024 * 1024, // 2MB
            max_bop_gap: 4096,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// MAC을 제외한 데이터 프레임 최대 페이로드
    pub fn max_payload(&self, mac_len: usize) -> usize {
        self.max_packet
            .saturating_sub(HEADER_LEN + mac_len)
            .min(u16::MAX as usize)
    }

    /// BOP에 실을 수 있는 최대 메타데이터 크기
    pub fn max_bop_metadata(&self, mac_len: usize) -> usize {
        self.max_payload(mac_len).saturating_sub(BOP_FIXED_LEN)
    }

    /// 프로덕트 크기 기반 EOP 대기 시간
    ///
    /// BOP 수신 후 타이머가 시작되므로 RTT는 고려하지 않음.
    /// 전송 지연(크기 / 링크 속도)에 여유 배수를 곱함
    pub fn eop_timeout(&self, prodsize: u32) -> Duration {
        let speed = self.link_speed_bps.max(1) as f64;
        let secs = self.eop_timeout_factor * (prodsize as f64 * 8.0) / speed;
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs.min(MAX_DELAY_SECS))
    }

    /// 같은 LAN 세그먼트용 설정
    pub fn lan() -> Self {
        Self {
            max_packet: 1460,
            retx_timeout: Duration::from_secs(60),
            link_speed_bps: 1_000_000_000, // 1Gbps
            eop_timeout_factor: 20.0,
            send_rate_bps: 0,
            mcast_ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
            initial_prod_index: 0,
            max_receivers: 256,
            socket_buffer_size: 8 * 1024 * 1024, // 8MB
            max_bop_gap: 4096,
        }
    }

    /// 라우터를 넘는 광역망용 설정
    pub fn wan() -> Self {
        Self {
            max_packet: 1400,                       // 터널 오버헤드 여유
            retx_timeout: Duration::from_secs(900), // 15분
            link_speed_bps: 100_000_000,
            eop_timeout_factor: 30.0,
            send_rate_bps: 80_000_000, // 80Mbps 셰이핑
            mcast_ttl: 32,
            interface: Ipv4Addr::UNSPECIFIED,
            initial_prod_index: 0,
            max_receivers: 1024,
            socket_buffer_size: 4 * 1024 * 1024,
            max_bop_gap: 4096,
        }
    }

    /// 저속 회선용 설정
    pub fn low_rate() -> Self {
        Self {
            max_packet: 1200,
            retx_timeout: Duration::from_secs(1800),
            link_speed_bps: 10_000_000,
            eop_timeout_factor: 40.0,
            send_rate_bps: 8_000_000,
            mcast_ttl: 16,
            interface: Ipv4Addr::UNSPECIFIED,
            initial_prod_index: 0,
            max_receivers: 64,
            socket_buffer_size: 512 * 1024, // 512KB
            max_bop_gap: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_budget() {
        let config = Config::default();
        assert_eq!(config.max_payload(0), 1448);
        assert_eq!(config.max_payload(4), 1444);
        assert_eq!(config.max_bop_metadata(0), 1430);
    }

    #[test]
    fn test_eop_timeout_scales_with_size() {
        let config = Config {
            link_speed_bps: 8_000_000,
            eop_timeout_factor: 2.0,
            ..Config::default()
        };
        // 1MB @ 1MB/s = 1s, × 2
        assert_eq!(config.eop_timeout(1_000_000), Duration::from_secs(2));
        assert_eq!(config.eop_timeout(0), Duration::ZERO);
    }

    #[test]
    fn test_eop_timeout_non_finite_factor() {
        let mut config = Config {
            eop_timeout_factor: f64::NAN,
            ..Config::default()
        };
        assert_eq!(config.eop_timeout(1000), Duration::ZERO);

        config.eop_timeout_factor = f64::INFINITY;
        assert_eq!(
            config.eop_timeout(1000),
            Duration::from_secs_f64(MAX_DELAY_SECS)
        );
    }
}
