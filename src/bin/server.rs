//! GEYS 서버 - 암호화 병렬 파일 분배 프로토콜
//!
//! database 디렉터리의 파일을 TCP(스트림)와 UDP(데이터그램) 드라이버로
//! 동시에 공개함
//! - TCP: RSA-OAEP 핸드쉐이크 + AES-128-GCM 패킷, stop-and-wait 청크 전송
//! - UDP: 평문 ASCII 요청, seq|md5|bytes 프레임 + NACK 재전송
//!
//! 사용법:
//!   cargo run --release --bin geys-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 기동
//!   cargo run --release --bin geys-server -- --dir database
//!
//!   # 바인드 주소 지정
//!   cargo run --release --bin geys-server -- -b 0.0.0.0:3000 --udp-bind 0.0.0.0:54321

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use geys::datagram::DatagramServer;
use geys::stream::StreamServer;
use geys::{Config, ServerIdentity};

/// 서버 설정
struct ServerArgs {
    tcp_bind: String,
    udp_bind: String,
    database_dir: PathBuf,
    config: Config,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            tcp_bind: "0.0.0.0:3000".to_string(),
            udp_bind: "0.0.0.0:54321".to_string(),
            database_dir: PathBuf::from("database"),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ServerArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    parsed.tcp_bind = args[i + 1].clone();
                    i += 1;
                }
            }
            "--udp-bind" => {
                if i + 1 < args.len() {
                    parsed.udp_bind = args[i + 1].clone();
                    i += 1;
                }
            }
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    parsed.database_dir = PathBuf::from(&args[i + 1]);
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
            "--ack-timeout-ms" => {
                if i + 1 < args.len() {
                    let ms: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    parsed.config.ack_timeout = Duration::from_millis(ms);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"GEYS Server - 암호화 병렬 파일 분배 프로토콜 서버

database 디렉터리의 파일을 TCP/UDP 두 드라이버로 공개
- TCP: RSA-OAEP 핸드쉐이크 + AES-128-GCM, stop-and-wait 청크 전송
- UDP: seq|md5|bytes 프레임 + NACK 재전송

사용법:
  cargo run --release --bin geys-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        TCP 바인드 주소 (기본: 0.0.0.0:3000)
  --udp-bind <ADDR>        UDP 바인드 주소 (기본: 0.0.0.0:54321)
  -d, --dir <PATH>         공개할 파일 디렉터리 (기본: database)
  --timeout <SECS>         블로킹 수신 타임아웃 (기본: 5)
  --ack-timeout-ms <MS>    데이터그램 ACK 타임아웃 (기본: 1000)
  -h, --help               이 도움말 출력

예시:
  # 기본 기동
  cargo run --release --bin geys-server -- --dir database

  # 불안정 네트워크: ACK 타임아웃 완화
  cargo run --release --bin geys-server -- --ack-timeout-ms 2000
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();

    info!("GEYS Server starting...");
    info!("Database dir: {:?}", args.database_dir);

    // RSA 키쌍은 기동 시 1회 생성, 모든 연결이 공유
    info!("RSA-2048 키쌍 생성 중...");
    let identity = Arc::new(ServerIdentity::generate()?);
    info!("키쌍 준비 완료");

    // 스트림(TCP) 드라이버
    let listener = TcpListener::bind(&args.tcp_bind).await?;
    let stream_server = Arc::new(StreamServer::new(
        identity,
        args.database_dir.clone(),
        args.config.recv_timeout,
    ));
    let stream_task = tokio::spawn(stream_server.serve(listener));

    // 데이터그램(UDP) 드라이버
    let datagram_server = Arc::new(
        DatagramServer::bind(
            &args.udp_bind,
            args.database_dir.clone(),
            args.config.ack_timeout,
            args.config.max_consecutive_timeouts,
        )
        .await?,
    );
    let datagram_task = tokio::spawn(datagram_server.serve());

    // 둘 중 하나라도 죽으면 종료
    tokio::select! {
        result = stream_task => result??,
        result = datagram_task => result??,
    }

    Ok(())
}
