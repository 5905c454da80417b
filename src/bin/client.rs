//! PMTP 수신자 - 멀티캐스트 그룹에 가입해 프로덕트를 파일로 저장
//!
//! 사용법:
//!   cargo run --release --bin pmtp-recv -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin pmtp-recv -- --sender 10.0.0.5:5174 --out ./received
//!
//!   # 3개 받고 종료
//!   cargo run --release --bin pmtp-recv -- -s 10.0.0.5:5174 --count 3

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pmtp::{
    Config, Crc32Check, FrameAuth, NoAuth, ProdIndex, ProductBegin, Receiver, ReceiverHooks,
    UdpMulticastReceiver,
};

/// 수신자 실행 설정
struct RecvArgs {
    group: SocketAddrV4,
    sender: SocketAddr,
    out_dir: PathBuf,
    count: Option<u64>,
    crc: bool,
    config: Config,
}

impl Default for RecvArgs {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 0, 1), 5173),
            sender: SocketAddr::from(([127, 0, 0, 1], 5174)),
            out_dir: PathBuf::from("."),
            count: None,
            crc: false,
            config: Config::default(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, name: &str) -> Result<T, String> {
    args.get(i + 1)
        .ok_or_else(|| format!("{} 값 필요", name))?
        .parse()
        .map_err(|_| format!("{} 값이 유효하지 않음", name))
}

fn parse_args() -> Result<RecvArgs, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = RecvArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--group" | "-g" => {
                parsed.group = parse_value(&args, i, "--group")?;
                i += 1;
            }
            "--sender" | "-s" => {
                parsed.sender = parse_value(&args, i, "--sender")?;
                i += 1;
            }
            "--out" | "-o" => {
                parsed.out_dir = parse_value(&args, i, "--out")?;
                i += 1;
            }
            "--count" | "-c" => {
                parsed.count = Some(parse_value(&args, i, "--count")?);
                i += 1;
            }
            "--iface" => {
                parsed.config.interface = parse_value(&args, i, "--iface")?;
                i += 1;
            }
            "--link-speed" => {
                parsed.config.link_speed_bps = parse_value(&args, i, "--link-speed")?;
                i += 1;
            }
            "--crc" => parsed.crc = true,
            "--help" | "-h" => {
                println!(
                    r#"PMTP Receiver - Product Multicast Transfer Protocol 수신자

사용법:
  cargo run --release --bin pmtp-recv -- [OPTIONS]

옵션:
  -g, --group <ADDR>        멀티캐스트 그룹 (기본: 239.255.0.1:5173)
  -s, --sender <ADDR>       송신자 재전송 TCP 주소 (기본: 127.0.0.1:5174)
  -o, --out <DIR>           저장 디렉터리 (기본: .)
  -c, --count <N>           N개 받으면 종료
  --iface <IP>              멀티캐스트 인터페이스
  --link-speed <BPS>        링크 속도 추정치 bits/s (EOP 타임아웃 계산용)
  --crc                     CRC32 프레임 트레일러 사용
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other)),
        }
        i += 1;
    }
    Ok(parsed)
}

/// 완료/실패 이벤트
enum Outcome {
    Done {
        index: ProdIndex,
        name: String,
        data: Option<Bytes>,
        retx_count: u32,
    },
    Missed(ProdIndex),
}

/// 프로덕트 이름(메타데이터)을 기억했다가 완료 시 메인 루프로 넘김
struct FileHooks {
    names: Mutex<HashMap<ProdIndex, String>>,
    tx: mpsc::UnboundedSender<Outcome>,
}

impl ReceiverHooks for FileHooks {
    fn on_begin(&self, begin: &ProductBegin) -> Option<BytesMut> {
        let name = String::from_utf8_lossy(&begin.metadata).into_owned();
        info!("수신 시작: 프로덕트 {} '{}' ({} bytes)", begin.index, name, begin.size);
        self.names.lock().insert(begin.index, name);
        Some(BytesMut::zeroed(begin.size as usize))
    }

    fn on_end(&self, index: ProdIndex, data: Option<Bytes>, retx_count: u32) {
        let name = self.names.lock().remove(&index).unwrap_or_default();
        let _ = self.tx.send(Outcome::Done {
            index,
            name,
            data,
            retx_count,
        });
    }

    fn on_missed(&self, index: ProdIndex) {
        self.names.lock().remove(&index);
        let _ = self.tx.send(Outcome::Missed(index));
    }
}

/// 경로 구분자를 제거한 안전한 파일 이름
fn safe_name(name: &str, index: ProdIndex) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("product-{}.bin", index)
    } else {
        cleaned
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    tokio::fs::create_dir_all(&args.out_dir).await?;

    let auth: Arc<dyn FrameAuth> = if args.crc {
        Arc::new(Crc32Check)
    } else {
        Arc::new(NoAuth)
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let hooks = Arc::new(FileHooks {
        names: Mutex::new(HashMap::new()),
        tx,
    });

    let mcast = UdpMulticastReceiver::new(args.group, &args.config)?;
    let receiver = Receiver::start(args.config.clone(), Box::new(mcast), args.sender, auth, hooks).await?;

    info!("PMTP Receiver");
    info!("  Group: {}", args.group);
    info!("  Sender: {}", args.sender);
    info!("  Output: {:?}", args.out_dir);

    let mut received = 0u64;
    loop {
        let outcome = tokio::select! {
            outcome = rx.recv() => outcome,
            result = receiver.wait() => {
                if let Err(e) = result {
                    warn!("수신자 에러: {}", e);
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        };

        match outcome {
            Some(Outcome::Done {
                index,
                name,
                data,
                retx_count,
            }) => {
                let path = args.out_dir.join(safe_name(&name, index));
                if let Some(data) = data {
                    tokio::fs::write(&path, &data).await?;
                    info!(
                        "저장: {:?} ({} bytes, 재전송 {} 블록)",
                        path,
                        data.len(),
                        retx_count
                    );
                }
                received += 1;
            }
            Some(Outcome::Missed(index)) => warn!("프로덕트 {} 놓침", index),
            None => break,
        }

        if args.count.map_or(false, |n| received >= n) {
            break;
        }
    }

    receiver.stop().await;
    info!("{}", receiver.stats().summary());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("../etc/passwd", 1), "..etcpasswd");
        assert_eq!(safe_name("", 7), "product-7.bin");
        assert_eq!(safe_name("..", 2), "product-2.bin");
    }
}
