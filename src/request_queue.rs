//! 수신측 내부 요청 큐
//!
//! 멀티캐스트/재전송 수신 태스크와 타이머 태스크가 요청을 넣고,
//! 요청 송신 태스크 하나가 꺼내서 TCP로 보냄 (TCP 쓰기는 한 곳에서만)

use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::frame::{Frame, MessageKind, ProdIndex};

/// 내부 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// BOP 재전송 요청
    MissingBop(ProdIndex),

    /// 데이터 구간 재전송 요청
    MissingData {
        index: ProdIndex,
        offset: u32,
        len: u16,
    },

    /// EOP 재전송 요청
    MissingEop(ProdIndex),

    /// 프로덕트 수신 완료 (RETX_END)
    RetxEnd(ProdIndex),

    /// 송신 태스크 종료
    Shutdown,
}

impl Request {
    /// 와이어 프레임으로 변환. Shutdown은 None
    pub fn to_frame(&self) -> Option<Frame> {
        match *self {
            Request::MissingBop(index) => Some(Frame::control(MessageKind::BopReq, index)),
            Request::MissingData { index, offset, len } => {
                Some(Frame::retx_request(index, offset, len))
            }
            Request::MissingEop(index) => Some(Frame::control(MessageKind::EopReq, index)),
            Request::RetxEnd(index) => Some(Frame::control(MessageKind::RetxEnd, index)),
            Request::Shutdown => None,
        }
    }
}

/// FIFO 요청 큐
#[derive(Debug)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Request>,
    rx: Mutex<mpsc::UnboundedReceiver<Request>>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, request: Request) -> Result<()> {
        self.tx.send(request).map_err(|_| Error::ChannelError)
    }

    /// 다음 요청이 올 때까지 대기
    pub async fn pop(&self) -> Result<Request> {
        self.rx.lock().await.recv().await.ok_or(Error::ChannelError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = RequestQueue::new();
        queue.push(Request::MissingBop(3)).unwrap();
        queue
            .push(Request::MissingData {
                index: 3,
                offset: 1024,
                len: 1024,
            })
            .unwrap();
        queue.push(Request::Shutdown).unwrap();

        assert_eq!(queue.pop().await.unwrap(), Request::MissingBop(3));
        assert!(matches!(queue.pop().await.unwrap(), Request::MissingData { offset: 1024, .. }));
        assert_eq!(queue.pop().await.unwrap(), Request::Shutdown);
    }

    #[test]
    fn test_request_frames() {
        let frame = Request::MissingData {
            index: 8,
            offset: 2048,
            len: 952,
        }
        .to_frame()
        .unwrap();
        assert_eq!(frame.kind(), MessageKind::RetxReq);
        assert_eq!(frame.seqnum(), 2048);
        assert_eq!(frame.header.payload_len, 952);

        let end = Request::RetxEnd(8).to_frame().unwrap();
        assert_eq!(end.kind(), MessageKind::RetxEnd);
        assert_eq!(end.seqnum(), 0);
        assert!(Request::Shutdown.to_frame().is_none());
    }
}
