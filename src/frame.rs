//! 와이어 프레임 정의
//!
//! 모든 프레임은 12바이트 고정 헤더 + 본문 + (선택) MAC 트레일러로 구성됨
//!
//! ```text
//! +------------+----------+-------------+---------+
//! | prod_index | seqnum   | payload_len | flags   |
//! | u32 (BE)   | u32 (BE) | u16 (BE)    | u16(BE) |
//! +------------+----------+-------------+---------+
//! ```
//!
//! 외부 프레이밍(serde/bincode)을 쓰지 않고 네트워크 바이트 순서로 직접 인코딩함.
//! 순수 함수만 있으며 I/O는 없음

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::auth::FrameAuth;
use crate::error::{Error, Result};
use crate::{BOP_FIXED_LEN, HEADER_LEN};

/// 프로덕트 인덱스 (32비트, 순환)
pub type ProdIndex = u32;

/// 순환 공간에서 유효한 최대 간격 (2^31 미만)
const RING_HALF: u32 = 0x8000_0000;

/// `index`가 `reference`보다 앞서 있는지 (순환 비교)
///
/// 간격이 2^31 이상이면 유효하지 않은 것으로 보고 false
pub fn is_ahead(index: ProdIndex, reference: ProdIndex) -> bool {
    let d = index.wrapping_sub(reference);
    d != 0 && d < RING_HALF
}

/// `from`에서 `to`까지의 순방향 간격. 유효하지 않으면 None
pub fn index_gap(from: ProdIndex, to: ProdIndex) -> Option<u32> {
    let d = to.wrapping_sub(from);
    (d < RING_HALF).then_some(d)
}

/// 메시지 종류 (프레임당 정확히 하나의 플래그 비트)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// 프로덕트 시작 (멀티캐스트)
    Bop = 0x0001,

    /// 프로덕트 종료 (멀티캐스트)
    Eop = 0x0002,

    /// 데이터 블록 (멀티캐스트)
    Data = 0x0004,

    /// 데이터 재전송 요청 (seqnum/payload_len이 요청 구간)
    RetxReq = 0x0008,

    /// 재전송 거절 (프로덕트가 이미 해제됨)
    RetxRej = 0x0010,

    /// 재전송 종료 (해당 프로덕트 수신 완료)
    RetxEnd = 0x0020,

    /// 재전송 데이터
    RetxData = 0x0040,

    /// BOP 재전송 요청
    BopReq = 0x0080,

    /// 재전송 BOP
    RetxBop = 0x0100,

    /// EOP 재전송 요청
    EopReq = 0x0200,

    /// 재전송 EOP (타임아웃 시 송신자가 강제로 보내기도 함)
    RetxEop = 0x0400,
}

impl MessageKind {
    const ALL: [MessageKind; 11] = [
        MessageKind::Bop,
        MessageKind::Eop,
        MessageKind::Data,
        MessageKind::RetxReq,
        MessageKind::RetxRej,
        MessageKind::RetxEnd,
        MessageKind::RetxData,
        MessageKind::BopReq,
        MessageKind::RetxBop,
        MessageKind::EopReq,
        MessageKind::RetxEop,
    ];

    /// 플래그 비트 → 메시지 종류
    ///
    /// 비트가 없거나 둘 이상이거나 알 수 없는 비트면 거부
    pub fn from_bits(flags: u16) -> Result<Self> {
        if flags.count_ones() != 1 {
            return Err(Error::InvalidFlags(flags));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|k| *k as u16 == flags)
            .ok_or(Error::InvalidFlags(flags))
    }

    pub fn bits(self) -> u16 {
        self as u16
    }

    /// 헤더 뒤에 payload_len 만큼의 본문이 따라오는지
    ///
    /// RETX_REQ는 payload_len을 요청 길이로 재사용하므로 본문이 없음
    pub fn has_body(self) -> bool {
        !matches!(self, MessageKind::RetxReq)
    }

    /// 수신자 → 송신자 방향 요청인지
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageKind::RetxReq | MessageKind::BopReq | MessageKind::EopReq | MessageKind::RetxEnd
        )
    }
}

/// 프레임 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 프로덕트 인덱스
    pub prod_index: ProdIndex,

    /// 프로덕트 내 바이트 오프셋
    pub seqnum: u32,

    /// 본문 길이 (RETX_REQ에서는 요청 길이)
    pub payload_len: u16,

    /// 메시지 종류
    pub kind: MessageKind,
}

impl FrameHeader {
    pub fn new(kind: MessageKind, prod_index: ProdIndex, seqnum: u32, payload_len: u16) -> Self {
        Self {
            prod_index,
            seqnum,
            payload_len,
            kind,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.prod_index);
        buf.put_u32(self.seqnum);
        buf.put_u16(self.payload_len);
        buf.put_u16(self.kind.bits());
    }

    /// 정확히 12바이트를 디코딩
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_LEN {
            return Err(Error::HeaderLength {
                expected: HEADER_LEN,
                got: data.len(),
            });
        }
        let mut buf = data;
        let prod_index = buf.get_u32();
        let seqnum = buf.get_u32();
        let payload_len = buf.get_u16();
        let kind = MessageKind::from_bits(buf.get_u16())?;
        Ok(Self {
            prod_index,
            seqnum,
            payload_len,
            kind,
        })
    }

    /// 헤더 뒤에 실제로 따라오는 본문 바이트 수
    pub fn body_len(&self) -> usize {
        if self.kind.has_body() {
            self.payload_len as usize
        } else {
            0
        }
    }
}

/// 프로덕트 시작 시각 (초 상위 32비트, 초 하위 32비트, 나노초)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartTime {
    pub secs: u64,
    pub nanos: u32,
}

impl StartTime {
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    pub fn to_words(self) -> [u32; 3] {
        [(self.secs >> 32) as u32, self.secs as u32, self.nanos]
    }

    pub fn from_words(words: [u32; 3]) -> Self {
        Self {
            secs: ((words[0] as u64) << 32) | words[1] as u64,
            nanos: words[2],
        }
    }
}

/// BOP 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BopMessage {
    pub start_time: StartTime,
    pub prodsize: u32,
    pub metadata: Bytes,
}

impl BopMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BOP_FIXED_LEN + self.metadata.len());
        for word in self.start_time.to_words() {
            buf.put_u32(word);
        }
        buf.put_u32(self.prodsize);
        buf.put_u16(self.metadata.len() as u16);
        buf.put_slice(&self.metadata);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < BOP_FIXED_LEN {
            return Err(Error::PayloadLength {
                declared: BOP_FIXED_LEN,
                available: payload.len(),
            });
        }
        let mut buf = payload;
        let words = [buf.get_u32(), buf.get_u32(), buf.get_u32()];
        let prodsize = buf.get_u32();
        let metasize = buf.get_u16() as usize;
        if metasize > buf.remaining() {
            return Err(Error::MetadataOverflow {
                metasize,
                payload: payload.len(),
            });
        }
        Ok(Self {
            start_time: StartTime::from_words(words),
            prodsize,
            metadata: Bytes::copy_from_slice(&buf[..metasize]),
        })
    }
}

/// 완전한 프레임 (헤더 + 본문)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// 본문이 있는 프레임
    pub fn new(kind: MessageKind, prod_index: ProdIndex, seqnum: u32, payload: Bytes) -> Self {
        Self {
            header: FrameHeader::new(kind, prod_index, seqnum, payload.len() as u16),
            payload,
        }
    }

    /// 본문 없는 제어 프레임 (seqnum = 0, payload_len = 0)
    pub fn control(kind: MessageKind, prod_index: ProdIndex) -> Self {
        Self::new(kind, prod_index, 0, Bytes::new())
    }

    /// 데이터 재전송 요청
    pub fn retx_request(prod_index: ProdIndex, offset: u32, len: u16) -> Self {
        Self {
            header: FrameHeader::new(MessageKind::RetxReq, prod_index, offset, len),
            payload: Bytes::new(),
        }
    }

    pub fn bop(kind: MessageKind, prod_index: ProdIndex, bop: &BopMessage) -> Self {
        Self::new(kind, prod_index, 0, bop.encode())
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn prod_index(&self) -> ProdIndex {
        self.header.prod_index
    }

    pub fn seqnum(&self) -> u32 {
        self.header.seqnum
    }

    /// 와이어 바이트 길이
    pub fn wire_len(&self, auth: &dyn FrameAuth) -> usize {
        HEADER_LEN + self.payload.len() + auth.mac_len()
    }

    /// 헤더 + 본문 + MAC 인코딩
    pub fn encode(&self, auth: &dyn FrameAuth) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len(auth));
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        if auth.mac_len() > 0 {
            let mac = auth.sign(&buf);
            buf.put_slice(&mac);
        }
        buf.freeze()
    }

    /// 데이터그램 하나를 디코딩
    ///
    /// 선언된 본문 길이 + MAC이 실제 바이트 수와 정확히 같아야 하고, 그 뒤 MAC을 검증함
    pub fn decode(data: &[u8], auth: &dyn FrameAuth) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::HeaderLength {
                expected: HEADER_LEN,
                got: data.len(),
            });
        }
        let header = FrameHeader::decode(&data[..HEADER_LEN])?;
        let body_len = header.body_len();
        let mac_len = auth.mac_len();
        let available = data.len() - HEADER_LEN;
        if body_len + mac_len != available {
            return Err(Error::PayloadLength {
                declared: body_len + mac_len,
                available,
            });
        }

        let signed_end = HEADER_LEN + body_len;
        if !auth.verify(&data[..signed_end], &data[signed_end..signed_end + mac_len]) {
            return Err(Error::MacMismatch(header.prod_index));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..signed_end]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Crc32Check, NoAuth};

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(MessageKind::Data, 0x01020304, 1024, 512);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[1, 2, 3, 4, 0, 0, 4, 0, 0x02, 0x00, 0x00, 0x04]
        );
        assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_wrong_length() {
        let err = FrameHeader::decode(&[0u8; 11]).unwrap_err();
        assert!(matches!(err, Error::HeaderLength { expected: 12, got: 11 }));
    }

    #[test]
    fn test_flags_must_be_single_known_bit() {
        assert!(matches!(MessageKind::from_bits(0), Err(Error::InvalidFlags(0))));
        assert!(MessageKind::from_bits(0x0003).is_err());
        assert!(MessageKind::from_bits(0x0800).is_err());
        assert_eq!(MessageKind::from_bits(0x0400).unwrap(), MessageKind::RetxEop);
    }

    #[test]
    fn test_bop_parse() {
        let bop = BopMessage {
            start_time: StartTime {
                secs: 0x1_0000_0002,
                nanos: 7,
            },
            prodsize: 3000,
            metadata: Bytes::from_static(b"name.txt"),
        };
        let encoded = bop.encode();
        assert_eq!(encoded.len(), BOP_FIXED_LEN + 8);
        assert_eq!(&encoded[..4], &[0, 0, 0, 1]);
        assert_eq!(BopMessage::decode(&encoded).unwrap(), bop);
    }

    #[test]
    fn test_bop_metadata_overflow() {
        let mut raw = BopMessage {
            start_time: StartTime::default(),
            prodsize: 10,
            metadata: Bytes::from_static(b"abc"),
        }
        .encode()
        .to_vec();
        raw.truncate(raw.len() - 1);
        let err = BopMessage::decode(&raw).unwrap_err();
        assert!(matches!(err, Error::MetadataOverflow { metasize: 3, .. }));
    }

    #[test]
    fn test_frame_payload_shorter_than_declared() {
        let frame = Frame::new(MessageKind::Data, 1, 0, Bytes::from_static(b"hello"));
        let wire = frame.encode(&NoAuth);
        let err = Frame::decode(&wire[..wire.len() - 2], &NoAuth).unwrap_err();
        assert!(matches!(err, Error::PayloadLength { declared: 5, available: 3 }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = Frame::new(MessageKind::Data, 1, 0, Bytes::from_static(b"hello"));
        let mut wire = frame.encode(&NoAuth).to_vec();
        wire.extend_from_slice(&[0xAA; 7]);
        let err = Frame::decode(&wire, &NoAuth).unwrap_err();
        assert!(matches!(err, Error::PayloadLength { declared: 5, available: 12 }));

        // MAC 자리에 남는 바이트도 거부
        let mut wire = frame.encode(&Crc32Check).to_vec();
        wire.push(0);
        assert!(Frame::decode(&wire, &Crc32Check).is_err());
    }

    #[test]
    fn test_frame_with_crc_trailer() {
        let auth = Crc32Check;
        let frame = Frame::new(MessageKind::RetxData, 9, 2048, Bytes::from_static(b"block"));
        let mut wire = frame.encode(&auth).to_vec();
        assert_eq!(wire.len(), HEADER_LEN + 5 + 4);
        assert_eq!(Frame::decode(&wire, &auth).unwrap(), frame);

        wire[HEADER_LEN] ^= 0xff;
        assert!(matches!(
            Frame::decode(&wire, &auth),
            Err(Error::MacMismatch(9))
        ));
    }

    #[test]
    fn test_retx_request_has_no_body() {
        let frame = Frame::retx_request(4, 1024, 1024);
        let wire = frame.encode(&NoAuth);
        assert_eq!(wire.len(), HEADER_LEN);
        let decoded = Frame::decode(&wire, &NoAuth).unwrap();
        assert_eq!(decoded.header.payload_len, 1024);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_request_kinds() {
        assert!(MessageKind::RetxEnd.is_request());
        assert!(MessageKind::BopReq.is_request());
        assert!(!MessageKind::RetxBop.is_request());
        assert!(!MessageKind::Data.is_request());
    }

    #[test]
    fn test_ring_arithmetic() {
        assert!(is_ahead(5, 3));
        assert!(!is_ahead(3, 3));
        assert!(!is_ahead(3, 5));
        assert!(is_ahead(1, u32::MAX));
        assert!(!is_ahead(0x8000_0000, 0));
        assert_eq!(index_gap(u32::MAX, 2), Some(3));
        assert_eq!(index_gap(0, 0x8000_0000), None);
    }
}
