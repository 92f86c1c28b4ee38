//! 파일 카탈로그 - 서버측 공개 파일 목록
//!
//! 목록은 조회 시점의 읽기 전용 스냅샷. 목록과 다운로드 사이에 파일이
//! 사라지는 경우는 락으로 막지 않고 FileNotFound로 처리함

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// 카탈로그 항목 (이름 + 바이트 크기)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub size: u64,
}

/// 디렉터리의 일반 파일 목록 스냅샷
pub fn scan(dir: &Path) -> Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }

        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue, // UTF-8이 아닌 이름은 목록에서 제외
        };

        entries.push(CatalogEntry {
            name,
            size: meta.len(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// 요청된 파일명을 디렉터리 내부 경로로 해석
///
/// 경로 구분자나 상위 디렉터리 참조가 섞인 이름은 거부
pub fn resolve(dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
        return None;
    }
    let path = dir.join(name);
    path.is_file().then_some(path)
}

/// 파일 크기 조회 (없으면 None)
pub fn file_size(dir: &Path, name: &str) -> Option<u64> {
    resolve(dir, name).and_then(|path| fs::metadata(path).ok().map(|m| m.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_lists_names_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("b.txt"), vec![0u8; 5000]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let entries = scan(dir.path()).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 100);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].size, 5000);
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.bin"), b"data").unwrap();

        assert!(resolve(dir.path(), "ok.bin").is_some());
        assert!(resolve(dir.path(), "../ok.bin").is_none());
        assert!(resolve(dir.path(), "sub/ok.bin").is_none());
        assert!(resolve(dir.path(), "missing.bin").is_none());
    }

    #[test]
    fn test_file_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.bin"), vec![1u8; 777]).unwrap();

        assert_eq!(file_size(dir.path(), "f.bin"), Some(777));
        assert_eq!(file_size(dir.path(), "nope.bin"), None);
    }
}
