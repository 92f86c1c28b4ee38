//! 에러 타입 정의
//!
//! 재시도 정책은 호출자 몫: TransferTimeout만 재시도 가능,
//! 나머지 wire 에러는 연결 종료, 오케스트레이션 에러는 다운로드 실패

use thiserror::Error;

/// GEYS 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("핸드쉐이크 실패: {0}")]
    Handshake(String),

    #[error("복호화 실패 (키 불일치 또는 변조)")]
    Decryption,

    #[error("프레이밍 에러: {0}")]
    Framing(String),

    #[error("알 수 없는 타입 코드: {code:#04X}")]
    UnknownTypeCode { code: u8 },

    #[error("수신 타임아웃: {context}")]
    TransferTimeout { context: String },

    #[error("파일 없음: {name}")]
    FileNotFound { name: String },

    #[error("체크섬 불일치: seq={seq}")]
    ChecksumMismatch { seq: u64 },

    #[error("청크 {index} 재시도 한도 초과 ({attempts}회)")]
    RetriesExhausted { index: usize, attempts: u32 },

    #[error("워커 태스크 중단")]
    WorkerAborted,
}

impl Error {
    /// 재시도 가능한 소프트 실패 여부
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransferTimeout { .. } | Error::ChecksumMismatch { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
