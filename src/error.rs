//! 에러 타입 정의

use thiserror::Error;

use crate::frame::ProdIndex;

/// PMTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    // ── 프레이밍 ──
    #[error("프레임 헤더 길이 오류: expected {expected}, got {got}")]
    HeaderLength { expected: usize, got: usize },

    #[error("페이로드 길이 불일치: declared {declared}, available {available}")]
    PayloadLength { declared: usize, available: usize },

    #[error("유효하지 않은 플래그: {0:#06x}")]
    InvalidFlags(u16),

    #[error("BOP 메타데이터 오버플로우: metasize {metasize}, payload {payload}")]
    MetadataOverflow { metasize: usize, payload: usize },

    #[error("MAC 검증 실패: prod_index={0}")]
    MacMismatch(ProdIndex),

    // ── 프로토콜 위반 (세션 치명적) ──
    #[error("메타데이터 크기 초과: {size} > 최대 {max}")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("프로덕트 크기 초과: {size} bytes")]
    ProductTooLarge { size: usize },

    #[error("seqnum 역행: prod_index={index}, previous={previous}, got={got}")]
    SeqnumDecreased {
        index: ProdIndex,
        previous: u32,
        got: u32,
    },

    #[error("세그먼트 정렬 불일치: prod_index={index}, offset={offset}, len={len}")]
    Misaligned { index: ProdIndex, offset: u32, len: u32 },

    #[error("블록 범위 초과: prod_index={index}, offset={offset}, len={len}, size={size}")]
    OutOfBounds {
        index: ProdIndex,
        offset: u32,
        len: u32,
        size: u32,
    },

    #[error("예상하지 못한 메시지: {0}")]
    UnexpectedMessage(String),

    // ── 정상 경쟁 상태 중 에러로 보고되는 것 ──
    #[error("이미 등록된 프로덕트: prod_index={0}")]
    AlreadyExists(ProdIndex),

    // ── 네트워크 ──
    #[error("연결 끊김: {0}")]
    ConnectionBroken(String),

    // ── 자원 부족 / 비활성 ──
    #[error("큐 비활성화됨")]
    Disabled,

    #[error("수신자 수 초과: 최대 {max}")]
    TooManyConnections { max: usize },

    #[error("채널 에러")]
    ChannelError,

    #[error("엔진 정지됨")]
    Stopped,
}

impl Error {
    /// 세션을 종료시켜야 하는 프로토콜 위반 여부
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::MetadataTooLarge { .. }
                | Error::ProductTooLarge { .. }
                | Error::SeqnumDecreased { .. }
                | Error::Misaligned { .. }
                | Error::OutOfBounds { .. }
                | Error::UnexpectedMessage(_)
        )
    }

    /// 프레임 단위로 거부하면 되는 에러 여부
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::HeaderLength { .. }
                | Error::PayloadLength { .. }
                | Error::InvalidFlags(_)
                | Error::MetadataOverflow { .. }
                | Error::MacMismatch(_)
        )
    }

    /// 호출자가 작업 추가를 멈춰야 하는 "사용 불가" 상태 여부
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Disabled | Error::TooManyConnections { .. } | Error::ChannelError | Error::Stopped
        )
    }

    /// 엔진 간 전달용 복제본. io::Error는 Clone이 아니므로 메시지만 보존
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::HeaderLength { expected, got } => Error::HeaderLength {
                expected: *expected,
                got: *got,
            },
            Error::PayloadLength {
                declared,
                available,
            } => Error::PayloadLength {
                declared: *declared,
                available: *available,
            },
            Error::InvalidFlags(f) => Error::InvalidFlags(*f),
            Error::MetadataOverflow { metasize, payload } => Error::MetadataOverflow {
                metasize: *metasize,
                payload: *payload,
            },
            Error::MacMismatch(i) => Error::MacMismatch(*i),
            Error::MetadataTooLarge { size, max } => Error::MetadataTooLarge {
                size: *size,
                max: *max,
            },
            Error::ProductTooLarge { size } => Error::ProductTooLarge { size: *size },
            Error::SeqnumDecreased {
                index,
                previous,
                got,
            } => Error::SeqnumDecreased {
                index: *index,
                previous: *previous,
                got: *got,
            },
            Error::Misaligned { index, offset, len } => Error::Misaligned {
                index: *index,
                offset: *offset,
                len: *len,
            },
            Error::OutOfBounds {
                index,
                offset,
                len,
                size,
            } => Error::OutOfBounds {
                index: *index,
                offset: *offset,
                len: *len,
                size: *size,
            },
            Error::UnexpectedMessage(m) => Error::UnexpectedMessage(m.clone()),
            Error::AlreadyExists(i) => Error::AlreadyExists(*i),
            Error::ConnectionBroken(m) => Error::ConnectionBroken(m.clone()),
            Error::Disabled => Error::Disabled,
            Error::TooManyConnections { max } => Error::TooManyConnections { max: *max },
            Error::ChannelError => Error::ChannelError,
            Error::Stopped => Error::Stopped,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(Error::SeqnumDecreased {
            index: 1,
            previous: 500,
            got: 200
        }
        .is_protocol_violation());
        assert!(Error::InvalidFlags(0).is_framing());
        assert!(Error::Disabled.is_unavailable());
        assert!(!Error::AlreadyExists(3).is_protocol_violation());
    }

    #[test]
    fn test_duplicate_keeps_io_kind() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        match err.duplicate() {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected: {other}"),
        }
    }
}
