//! 매니페스트 감시자 - 클라이언트측 input.txt 변경 감지
//!
//! 전체 파일 SHA-256과 이미 본 줄 수를 같이 추적함: 해시가 그대로면
//! 파일을 다시 읽지 않고, 바뀌었으면 새로 추가된 줄만 돌려줌

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::Result;

/// 파일 전체 SHA-256 (8KiB 단위 스트리밍)
pub fn digest_file(path: &Path) -> Result<Option<[u8; 32]>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Some(hasher.finalize().into()))
}

/// input.txt 감시자
pub struct ManifestWatcher {
    path: PathBuf,
    seen_lines: usize,
    last_digest: Option<[u8; 32]>,
}

impl ManifestWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen_lines: 0,
            last_digest: None,
        }
    }

    /// 매니페스트 경로
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 변경 확인: 새로 추가된 파일명만 반환
    ///
    /// 해시가 이전과 같으면 빈 벡터 (멱등성). 파일이 없으면 변경 없음으로 처리
    pub fn poll(&mut self) -> Result<Vec<String>> {
        let digest = match digest_file(&self.path)? {
            Some(digest) => digest,
            None => return Ok(Vec::new()),
        };

        if self.last_digest == Some(digest) {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let lines: Vec<String> = content
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        let fresh = lines.iter().skip(self.seen_lines).cloned().collect();
        self.seen_lines = lines.len();
        self.last_digest = Some(digest);

        Ok(fresh)
    }
}
