//! 청크 다운로드 오케스트레이터
//!
//! 파일 [0, total)을 N개의 연속 비중첩 구간으로 나누고 청크당 워커 태스크
//! 하나를 띄움. 워커는 각자 자기 연결/세션 키/part 파일만 소유하므로
//! 전송 자체에는 락이 필요 없음. 모든 워커를 조인한 뒤에만 인덱스 순서로
//! 병합함 — 완료 전 병합은 정합성 버그

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, TransportKind};
use crate::datagram::DatagramClient;
use crate::progress::{spawn_aggregator, ProgressBoard, ProgressEvent};
use crate::stream::StreamConnection;
use crate::{Error, Result};

/// 워커 하나가 최소한으로 맡는 바이트 수
///
/// 요청 청크 수가 파일 크기를 넘어서는 경우를 막음: 이보다 작은 파일은
/// 워커 하나로 내려받음
pub const MIN_CHUNK_BYTES: u64 = 1024;

/// 청크 기술자: 분할 시 생성, 워커 하나가 소비, 병합되면 소멸
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub file_name: String,
    pub offset: u64,
    pub length: u64,
    /// 1부터 시작
    pub chunk_index: usize,
}

impl ChunkDescriptor {
    /// 이 청크의 part 파일 경로
    pub fn part_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.part{}", self.file_name, self.chunk_index))
    }
}

/// 요청 청크 수를 파일 크기에 맞게 보정
pub fn effective_chunk_count(total_size: u64, requested: usize) -> usize {
    if total_size == 0 {
        return 1;
    }
    let max_workers = (total_size / MIN_CHUNK_BYTES).max(1) as usize;
    requested.clamp(1, max_workers)
}

/// [0, total_size)를 chunk_count개의 연속 구간으로 분할
///
/// 올림 나눗셈으로 균등 분할하고 마지막 구간이 나머지를 흡수함.
/// 길이 합은 정확히 total_size, 꼬리 구간은 길이 0일 수 있음
pub fn split_ranges(file_name: &str, total_size: u64, chunk_count: usize) -> Vec<ChunkDescriptor> {
    let chunk_size = (total_size + chunk_count as u64 - 1) / chunk_count as u64;

    (0..chunk_count)
        .map(|i| {
            let offset = chunk_size * i as u64;
            let length = chunk_size.min(total_size.saturating_sub(offset));
            ChunkDescriptor {
                file_name: file_name.to_string(),
                offset,
                length,
                chunk_index: i + 1,
            }
        })
        .collect()
}

/// 청크 전송 드라이버 공통 인터페이스
///
/// 스트림/데이터그램 드라이버가 각자 구현함. 호출마다 자체 연결(과
/// 스트림 모드에서는 자체 핸드쉐이크)을 열므로 워커끼리 연결이나
/// 세션 키를 공유하지 않음
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn fetch_chunk(
        &self,
        desc: &ChunkDescriptor,
        part_path: &Path,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<u64>;
}

/// 스트림(TCP) 드라이버 커넥터
pub struct StreamTransport {
    addr: String,
    recv_timeout: Duration,
}

impl StreamTransport {
    pub fn new(addr: String, recv_timeout: Duration) -> Self {
        Self { addr, recv_timeout }
    }
}

#[async_trait]
impl ChunkTransport for StreamTransport {
    async fn fetch_chunk(
        &self,
        desc: &ChunkDescriptor,
        part_path: &Path,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<u64> {
        let mut conn = StreamConnection::connect(&self.addr, self.recv_timeout).await?;
        let written = conn.fetch_chunk(desc, part_path, &progress).await?;
        conn.disconnect().await?;
        Ok(written)
    }
}

/// 데이터그램(UDP) 드라이버 커넥터
pub struct DatagramTransport {
    client: DatagramClient,
}

impl DatagramTransport {
    pub fn new(client: DatagramClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkTransport for DatagramTransport {
    async fn fetch_chunk(
        &self,
        desc: &ChunkDescriptor,
        part_path: &Path,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<u64> {
        self.client.fetch_chunk(desc, part_path, &progress).await
    }
}

/// 다운로드 오케스트레이터
pub struct Downloader {
    transport: Arc<dyn ChunkTransport>,
    download_dir: PathBuf,
    chunk_count: usize,
    retry_budget: u32,
}

impl Downloader {
    pub fn new(transport: Arc<dyn ChunkTransport>, config: &Config) -> Self {
        Self {
            transport,
            download_dir: config.download_dir.clone(),
            chunk_count: config.chunk_count,
            retry_budget: config.retry_budget,
        }
    }

    /// 설정의 드라이버 종류로 커넥터 구성
    pub async fn from_config(config: &Config) -> Result<Self> {
        let transport: Arc<dyn ChunkTransport> = match config.transport {
            TransportKind::Stream => {
                Arc::new(StreamTransport::new(config.tcp_addr(), config.recv_timeout))
            }
            TransportKind::Datagram => {
                let server_addr = tokio::net::lookup_host(config.udp_addr())
                    .await?
                    .next()
                    .ok_or_else(|| Error::Framing("UDP 서버 주소 해석 실패".to_string()))?;
                Arc::new(DatagramTransport::new(DatagramClient::new(
                    server_addr,
                    config.recv_timeout,
                    config.ack_timeout,
                    config.max_consecutive_timeouts,
                )))
            }
        };

        Ok(Self::new(transport, config))
    }

    /// 파일 하나 다운로드: 분할 → 워커 기동 → 전체 조인 → 병합
    ///
    /// 워커 하나라도 복구 불가능하게 실패하면 전체 실패로 보고하고
    /// part 파일을 병합하지 않음
    pub async fn download_file(&self, file_name: &str, total_size: u64) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let count = effective_chunk_count(total_size, self.chunk_count);
        let descs = split_ranges(file_name, total_size, count);

        info!(
            "다운로드 시작: {} ({}바이트, {}청크)",
            file_name, total_size, count
        );

        let board = ProgressBoard::new(count, total_size);
        let (tx, rx) = mpsc::channel(256);
        let aggregator = spawn_aggregator(board.clone(), rx);

        // 2초마다 진행률 로깅 (표시 경로는 보드 스냅샷만 읽음)
        let logger = {
            let board = board.clone();
            let name = file_name.to_string();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(2));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    info!("{} 진행률: {:.1}% ({}바이트)", name, board.percent(), board.bytes_done());
                }
            })
        };

        // 조인 전에 모든 워커를 먼저 기동
        let mut workers = Vec::with_capacity(count);
        for desc in descs {
            let transport = self.transport.clone();
            let part_path = desc.part_path(&self.download_dir);
            let tx = tx.clone();
            let retry_budget = self.retry_budget;

            workers.push(tokio::spawn(async move {
                run_worker(transport, desc, part_path, tx, retry_budget).await
            }));
        }
        drop(tx);

        // 전체 조인: 하나라도 끝나기 전에 병합하지 않음
        let mut failure = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(bytes)) => debug!("워커 완료: {}바이트", bytes),
                Ok(Err(e)) => failure = Some(e),
                Err(_) => failure = Some(Error::WorkerAborted),
            }
        }
        aggregator.await.map_err(|_| Error::WorkerAborted)?;
        logger.abort();

        if let Some(e) = failure {
            warn!("다운로드 실패: {} ({})", file_name, e);
            return Err(e);
        }

        let final_path = self.merge_parts(file_name, count).await?;
        info!("다운로드 완료: {}", file_name);
        Ok(final_path)
    }

    /// part 파일을 인덱스 순서로 이어붙이고 삭제
    async fn merge_parts(&self, file_name: &str, chunk_count: usize) -> Result<PathBuf> {
        let final_path = self.download_dir.join(file_name);
        let mut out = File::create(&final_path).await?;

        for index in 1..=chunk_count {
            let part_path = self.download_dir.join(format!("{file_name}.part{index}"));
            let mut part = File::open(&part_path).await?;
            tokio::io::copy(&mut part, &mut out).await?;
            tokio::fs::remove_file(&part_path).await?;
        }

        out.flush().await?;
        Ok(final_path)
    }
}

/// 워커 하나: 소프트 실패는 재시도, 치명 에러는 즉시 전파
async fn run_worker(
    transport: Arc<dyn ChunkTransport>,
    desc: ChunkDescriptor,
    part_path: PathBuf,
    progress: mpsc::Sender<ProgressEvent>,
    retry_budget: u32,
) -> Result<u64> {
    let mut attempts = 0u32;

    loop {
        match transport.fetch_chunk(&desc, &part_path, progress.clone()).await {
            Ok(written) => return Ok(written),
            Err(e) if e.is_retryable() => {
                attempts += 1;
                if attempts >= retry_budget {
                    return Err(Error::RetriesExhausted {
                        index: desc.chunk_index,
                        attempts,
                    });
                }
                warn!(
                    "청크 {} 재시도 {}/{}: {}",
                    desc.chunk_index, attempts, retry_budget, e
                );
                let _ = progress
                    .send(ProgressEvent::Restart {
                        chunk_index: desc.chunk_index,
                    })
                    .await;
            }
            Err(e) => return Err(e),
        }
    }
}
