//! 전송 진행률 집계
//!
//! 워커는 공유 배열을 직접 만지지 않음: 진행 이벤트를 채널로 보내고,
//! 소비자 태스크 하나가 보드에 누적함. 표시 경로는 스냅샷만 읽음

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 워커가 보고하는 진행 이벤트
#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent {
    /// 청크에 bytes만큼 기록함 (증분)
    Advance { chunk_index: usize, bytes: u64 },

    /// 청크 재시도 시작: 해당 슬롯을 0으로 되돌림
    Restart { chunk_index: usize },
}

/// 파일 하나의 진행률 보드
pub struct ProgressBoard {
    /// 청크별 누적 바이트 (인덱스-1 위치)
    per_chunk: RwLock<Vec<u64>>,

    /// 파일 전체 크기
    total_size: u64,
}

impl ProgressBoard {
    pub fn new(chunk_count: usize, total_size: u64) -> Arc<Self> {
        Arc::new(Self {
            per_chunk: RwLock::new(vec![0; chunk_count]),
            total_size,
        })
    }

    /// 이벤트 반영
    pub fn apply(&self, event: ProgressEvent) {
        let mut per_chunk = self.per_chunk.write();
        match event {
            ProgressEvent::Advance { chunk_index, bytes } => {
                if let Some(slot) = per_chunk.get_mut(chunk_index.saturating_sub(1)) {
                    *slot += bytes;
                }
            }
            ProgressEvent::Restart { chunk_index } => {
                if let Some(slot) = per_chunk.get_mut(chunk_index.saturating_sub(1)) {
                    *slot = 0;
                }
            }
        }
    }

    /// 전체 누적 바이트
    pub fn bytes_done(&self) -> u64 {
        self.per_chunk.read().iter().sum()
    }

    /// 진행률 (0.0 ~ 100.0)
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.bytes_done() as f64 / self.total_size as f64) * 100.0
    }

    /// 청크별 스냅샷
    pub fn snapshot(&self) -> Vec<u64> {
        self.per_chunk.read().clone()
    }
}

/// 진행 이벤트 소비자 태스크 기동
///
/// 모든 송신자가 닫히면 종료됨
pub fn spawn_aggregator(
    board: Arc<ProgressBoard>,
    mut rx: mpsc::Receiver<ProgressEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            board.apply(event);
        }
    })
}
