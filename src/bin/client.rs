//! GEYS 클라이언트 - 암호화 병렬 파일 분배 프로토콜
//!
//! input.txt에 적힌 파일명을 서버에서 병렬 청크 다운로드로 받아옴
//! - 기동 시 서버 카탈로그 출력
//! - 5초마다 input.txt를 해시로 감시, 새로 추가된 줄만 다운로드
//! - 이미 받은 파일은 건너뜀 (멱등)
//!
//! 사용법:
//!   cargo run --release --bin geys-client -- [OPTIONS]
//!
//! 예시:
//!   # 스트림(TCP) 모드
//!   cargo run --release --bin geys-client -- --server 127.0.0.1 --input input.txt
//!
//!   # 데이터그램(UDP) 모드, 8청크
//!   cargo run --release --bin geys-client -- -t datagram -c 8

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use geys::datagram::DatagramClient;
use geys::stream::StreamConnection;
use geys::{CatalogEntry, Config, Downloader, Error, ManifestWatcher, TransportKind};

/// 클라이언트 설정
struct ClientArgs {
    input_path: PathBuf,
    config: Config,
}

impl Default for ClientArgs {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("input.txt"),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ClientArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    parsed.config.server_host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    parsed.config.tcp_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--udp-port" => {
                if i + 1 < args.len() {
                    parsed.config.udp_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--transport" | "-t" => {
                if i + 1 < args.len() {
                    parsed.config.transport = match args[i + 1].as_str() {
                        "stream" | "tcp" => TransportKind::Stream,
                        "datagram" | "udp" => TransportKind::Datagram,
                        other => panic!("알 수 없는 드라이버: {other}"),
                    };
                    i += 1;
                }
            }
            "--input" | "-i" => {
                if i + 1 < args.len() {
                    parsed.input_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--out-dir" | "-o" => {
                if i + 1 < args.len() {
                    parsed.config.download_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--chunks" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config.chunk_count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    parsed.config.recv_timeout = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--retries" => {
                if i + 1 < args.len() {
                    parsed.config.retry_budget = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"GEYS Client - 암호화 병렬 파일 분배 프로토콜 클라이언트

input.txt의 파일명을 서버에서 병렬 청크로 다운로드
- 파일마다 N개 워커, 워커마다 독립 연결/세션 키
- input.txt는 SHA-256 해시로 감시, 추가된 줄만 새로 받음

사용법:
  cargo run --release --bin geys-client -- [OPTIONS]

옵션:
  -s, --server <HOST>     서버 호스트 (기본: 127.0.0.1)
  -p, --port <PORT>       TCP 포트 (기본: 3000)
  --udp-port <PORT>       UDP 포트 (기본: 54321)
  -t, --transport <KIND>  드라이버: stream | datagram (기본: stream)
  -i, --input <PATH>      매니페스트 경로 (기본: input.txt)
  -o, --out-dir <PATH>    다운로드 디렉터리 (기본: download)
  -c, --chunks <N>        파일당 청크 수 (기본: 4)
  --timeout <SECS>        블로킹 수신 타임아웃 (기본: 5)
  --retries <N>           청크당 재시도 한도 (기본: 3)
  -h, --help              이 도움말 출력

예시:
  # 스트림 모드
  cargo run --release --bin geys-client -- -s 192.168.1.100 -i input.txt

  # 데이터그램 모드 + 8청크
  cargo run --release --bin geys-client -- -t datagram -c 8
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    parsed
}

/// 카탈로그 한 번 출력
fn print_catalog(entries: &[CatalogEntry]) {
    info!("서버 공개 파일 {}건:", entries.len());
    for entry in entries {
        info!("  {} - {} bytes", entry.name, entry.size);
    }
}

/// 파일 크기 결정: 스트림 모드는 E 협상, 데이터그램 모드는 카탈로그 조회
async fn resolve_size(
    config: &Config,
    catalog_cache: &mut HashMap<String, u64>,
    file_name: &str,
) -> geys::Result<u64> {
    match config.transport {
        TransportKind::Stream => {
            // 협상용 연결 (연결당 세션 키 하나)
            let mut conn =
                StreamConnection::connect(&config.tcp_addr(), config.recv_timeout).await?;
            let size = conn.negotiate_download(file_name, config.chunk_count).await;
            conn.disconnect().await?;
            size
        }
        TransportKind::Datagram => {
            if !catalog_cache.contains_key(file_name) {
                let client = DatagramClient::new(
                    tokio::net::lookup_host(config.udp_addr())
                        .await?
                        .next()
                        .ok_or_else(|| Error::Framing("UDP 서버 주소 해석 실패".to_string()))?,
                    config.recv_timeout,
                    config.ack_timeout,
                    config.max_consecutive_timeouts,
                );
                catalog_cache.clear();
                for entry in client.list_files().await? {
                    catalog_cache.insert(entry.name, entry.size);
                }
            }
            catalog_cache
                .get(file_name)
                .copied()
                .ok_or_else(|| Error::FileNotFound {
                    name: file_name.to_string(),
                })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();
    let config = args.config.clone();

    info!("GEYS Client starting...");
    info!("Server: {} ({:?})", config.server_host, config.transport);
    info!("Manifest: {:?}", args.input_path);

    // 기동 시 카탈로그 출력
    match config.transport {
        TransportKind::Stream => {
            let mut conn = StreamConnection::connect(&config.tcp_addr(), config.recv_timeout).await?;
            print_catalog(&conn.list_files().await?);
            conn.disconnect().await?;
        }
        TransportKind::Datagram => {
            let client = DatagramClient::new(
                tokio::net::lookup_host(config.udp_addr())
                    .await?
                    .next()
                    .ok_or("UDP 서버 주소 해석 실패")?,
                config.recv_timeout,
                config.ack_timeout,
                config.max_consecutive_timeouts,
            );
            print_catalog(&client.list_files().await?);
        }
    }

    let downloader = Downloader::from_config(&config).await?;
    let mut watcher = ManifestWatcher::new(&args.input_path);
    let mut catalog_cache: HashMap<String, u64> = HashMap::new();

    info!("매니페스트 감시 시작 ({}초 주기)", config.poll_interval.as_secs());

    loop {
        let fresh = match watcher.poll() {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("매니페스트 읽기 실패: {}", e);
                Vec::new()
            }
        };

        if fresh.is_empty() {
            info!("변경 없음. 대기 중...");
        } else {
            info!("새 항목 {}건 발견", fresh.len());
        }

        for file_name in fresh {
            // 이미 받은 파일은 재시도하지 않음
            if config.download_dir.join(&file_name).exists() {
                info!("{} 이미 존재, 건너뜀", file_name);
                continue;
            }

            let size = match resolve_size(&config, &mut catalog_cache, &file_name).await {
                Ok(size) => size,
                Err(e) => {
                    warn!("{} 크기 확인 실패: {}", file_name, e);
                    continue;
                }
            };

            match downloader.download_file(&file_name, size).await {
                Ok(path) => info!("{} 다운로드 성공 → {:?}", file_name, path),
                Err(e) => warn!("{} 다운로드 실패: {}", file_name, e),
            }
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}
