//! 프로토콜 설정
//!
//! 전역 상수 대신 명시적 Config를 드라이버/오케스트레이터 생성자에 전달

use std::path::PathBuf;
use std::time::Duration;

/// 청크 전송 드라이버 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP stop-and-wait (ACK/EOF 시그널링)
    Stream,
    /// UDP 시퀀스 번호 + 체크섬 재전송
    Datagram,
}

/// GEYS 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 서버 호스트 (TCP/UDP 공통)
    pub server_host: String,

    /// TCP 포트
    pub tcp_port: u16,

    /// UDP 포트
    pub udp_port: u16,

    /// 드라이버 선택
    pub transport: TransportKind,

    /// 파일당 청크(워커) 수
    pub chunk_count: usize,

    /// 블로킹 수신 타임아웃
    pub recv_timeout: Duration,

    /// 데이터그램 ACK 대기 타임아웃
    pub ack_timeout: Duration,

    /// 청크당 재시도 한도
    pub retry_budget: u32,

    /// 연속 타임아웃 허용 횟수 (데이터그램)
    pub max_consecutive_timeouts: u32,

    /// 매니페스트 폴링 주기
    pub poll_interval: Duration,

    /// 서버측 파일 디렉터리
    pub database_dir: PathBuf,

    /// 클라이언트측 다운로드 디렉터리
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            tcp_port: 3000,
            udp_port: 54321,
            transport: TransportKind::Stream,
            chunk_count: 4,
            recv_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(1),
            retry_budget: 3,
            max_consecutive_timeouts: 10,
            poll_interval: Duration::from_secs(5),
            database_dir: PathBuf::from("database"),
            download_dir: PathBuf::from("download"),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 서버 TCP 주소 문자열
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.tcp_port)
    }

    /// 서버 UDP 주소 문자열
    pub fn udp_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.udp_port)
    }

    /// 근거리망용 설정 (짧은 타임아웃, 많은 워커)
    pub fn lan() -> Self {
        Self {
            chunk_count: 8,
            recv_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_millis(300),
            retry_budget: 2,
            max_consecutive_timeouts: 5,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정 (긴 타임아웃, 넉넉한 재시도)
    pub fn unstable_network() -> Self {
        Self {
            chunk_count: 4,
            recv_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(2),
            retry_budget: 6,
            max_consecutive_timeouts: 20,
            ..Self::default()
        }
    }
}
