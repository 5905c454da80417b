//! 프레임 인증 훅
//!
//! 프레임 경계에서 MAC 트레일러를 붙이고 검증함.
//! 서명 정책 자체는 호스트가 정하며, 여기서는 인터페이스와 기본 구현만 제공

/// 프레임 MAC 코덱
///
/// `sign`은 헤더 + 본문 바이트를 받아 정확히 `mac_len()` 바이트를 반환해야 함
pub trait FrameAuth: Send + Sync {
    /// MAC 트레일러 길이 (0이면 트레일러 없음)
    fn mac_len(&self) -> usize;

    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, data: &[u8], mac: &[u8]) -> bool;
}

/// 인증 없음
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl FrameAuth for NoAuth {
    fn mac_len(&self) -> usize {
        0
    }

    fn sign(&self, _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn verify(&self, _data: &[u8], mac: &[u8]) -> bool {
        mac.is_empty()
    }
}

/// CRC32 무결성 트레일러 (4바이트, big-endian)
///
/// 위조 방지는 못 하지만 손상된 데이터그램을 걸러냄
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Check;

impl FrameAuth for Crc32Check {
    fn mac_len(&self) -> usize {
        4
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        crc32fast::hash(data).to_be_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], mac: &[u8]) -> bool {
        mac.len() == 4 && crc32fast::hash(data).to_be_bytes() == mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_detects_corruption() {
        let auth = Crc32Check;
        let mac = auth.sign(b"product block");
        assert_eq!(mac.len(), auth.mac_len());
        assert!(auth.verify(b"product block", &mac));
        assert!(!auth.verify(b"product blocc", &mac));
        assert!(!auth.verify(b"product block", &mac[..3]));
    }

    #[test]
    fn test_no_auth() {
        assert!(NoAuth.verify(b"anything", &[]));
        assert!(!NoAuth.verify(b"anything", &[0]));
    }
}
