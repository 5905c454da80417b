//! PMTP 송신자 - 파일을 프로덕트로 멀티캐스트
//!
//! 사용법:
//!   cargo run --release --bin pmtp-send -- [OPTIONS] <FILE>...
//!
//! 예시:
//!   # 수신자 2명이 붙으면 전송 시작
//!   cargo run --release --bin pmtp-send -- --receivers 2 a.bin b.bin
//!
//!   # 광역망 설정 + CRC 트레일러
//!   cargo run --release --bin pmtp-send -- --preset wan --crc data.bin

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pmtp::{Config, Crc32Check, FrameAuth, NoAuth, ProdIndex, Sender, SenderHooks, UdpMulticastSender};

/// 송신자 실행 설정
struct SendArgs {
    group: SocketAddrV4,
    listen: SocketAddr,
    files: Vec<PathBuf>,
    receivers: usize,
    crc: bool,
    config: Config,
}

impl Default for SendArgs {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 0, 1), 5173),
            listen: SocketAddr::from(([0, 0, 0, 0], 5174)),
            files: Vec::new(),
            receivers: 1,
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

fn parse_args() -> Result<SendArgs, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SendArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--group" | "-g" => {
                parsed.group = parse_value(&args, i, "--group")?;
                i += 1;
            }
            "--listen" | "-l" => {
                parsed.listen = parse_value(&args, i, "--listen")?;
                i += 1;
            }
            "--iface" => {
                parsed.config.interface = parse_value(&args, i, "--iface")?;
                i += 1;
            }
            "--ttl" => {
                parsed.config.mcast_ttl = parse_value(&args, i, "--ttl")?;
                i += 1;
            }
            "--rate" => {
                parsed.config.send_rate_bps = parse_value(&args, i, "--rate")?;
                i += 1;
            }
            "--retx-timeout" => {
                let secs: u64 = parse_value(&args, i, "--retx-timeout")?;
                parsed.config.retx_timeout = Duration::from_secs(secs);
                i += 1;
            }
            "--receivers" | "-n" => {
                parsed.receivers = parse_value(&args, i, "--receivers")?;
                i += 1;
            }
            "--preset" => {
                let name: String = parse_value(&args, i, "--preset")?;
                let interface = parsed.config.interface;
                parsed.config = match name.as_str() {
                    "lan" => Config::lan(),
                    "wan" => Config::wan(),
                    "low-rate" => Config::low_rate(),
                    other => return Err(format!("알 수 없는 preset: {}", other)),
                };
                parsed.config.interface = interface;
                i += 1;
            }
            "--crc" => parsed.crc = true,
            "--help" | "-h" => {
                println!(
                    r#"PMTP Sender - Product Multicast Transfer Protocol 송신자

사용법:
  cargo run --release --bin pmtp-send -- [OPTIONS] <FILE>...

옵션:
  -g, --group <ADDR>        멀티캐스트 그룹 (기본: 239.255.0.1:5173)
  -l, --listen <ADDR>       재전송 TCP 주소 (기본: 0.0.0.0:5174)
  -n, --receivers <N>       전송 시작 전 기다릴 수신자 수 (기본: 1)
  --iface <IP>              멀티캐스트 인터페이스
  --ttl <N>                 멀티캐스트 TTL
  --rate <BPS>              송신 속도 제한 bits/s (0 = 제한 없음)
  --retx-timeout <SECS>     재전송 보관 시간
  --preset <lan|wan|low-rate>
  --crc                     CRC32 프레임 트레일러 사용
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (예: RUST_LOG=pmtp=debug)
"#
                );
                std::process::exit(0);
            }
            path => parsed.files.push(PathBuf::from(path)),
        }
        i += 1;
    }

    if parsed.files.is_empty() {
        return Err("전송할 파일이 없음 (--help 참고)".into());
    }
    Ok(parsed)
}

/// 진행 로그용 콜백
struct LogHooks;

impl SenderHooks for LogHooks {
    fn vet_receiver(&self, peer: SocketAddr) -> bool {
        info!("수신자 접속 요청: {}", peer);
        true
    }

    fn on_product_done(&self, index: ProdIndex) {
        info!("프로덕트 {} 해제", index);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;

    let auth: Arc<dyn FrameAuth> = if args.crc {
        Arc::new(Crc32Check)
    } else {
        Arc::new(NoAuth)
    };

    let mcast = Arc::new(UdpMulticastSender::new(args.group, &args.config)?);
    let listener = TcpListener::bind(args.listen).await?;
    let sender = Sender::start(args.config.clone(), mcast, listener, auth, Arc::new(LogHooks))?;

    info!("PMTP Sender");
    info!("  Group: {}", args.group);
    info!("  Retransmission: {}", sender.local_addr());
    info!("  Files: {}", args.files.len());

    info!("수신자 {}명 대기 중...", args.receivers);
    while sender.receiver_count() < args.receivers {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut last = None;
    for path in &args.files {
        let data = tokio::fs::read(path).await?;
        let name = file_name(path);
        let size = data.len();
        let index = sender.send_product(Bytes::from(data), name.as_bytes()).await?;
        info!("전송: {} ({} bytes) → 프로덕트 {}", name, size, index);
        last = Some(index);
    }

    if let Some(index) = last {
        info!("모든 수신자의 완료 대기...");
        let deadline = args.config.retx_timeout + Duration::from_secs(5);
        match tokio::time::timeout(deadline, sender.wait_completed(index)).await {
            Ok(Ok(())) => info!("전송 완료"),
            Ok(Err(e)) => warn!("송신자 에러: {}", e),
            Err(_) => warn!("완료 대기 시간 초과"),
        }
    }

    info!("{}", sender.stats().summary());
    sender.stop().await;
    Ok(())
}
