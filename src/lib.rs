//! # GEYS (암호화 병렬 파일 분배 프로토콜)
//!
//! 서버가 공개한 파일을 클라이언트가 N개의 독립 암호화 청크 스트림으로
//! 병렬 다운로드하여 재조립하는 점대점 프로토콜
//!
//! ## 핵심 특징
//! - **하이브리드 핸드쉐이크**: RSA-OAEP로 세션 키 전달, 이후 AES-128-GCM
//! - **고정 바이너리 헤더**: 15바이트 GEYS 헤더를 페이로드와 별도 암호화
//! - **청크 병렬화**: 청크마다 독립 연결 + 독립 세션 키
//! - **두 가지 신뢰성 전략**: TCP stop-and-wait ACK/EOF, UDP 시퀀스+체크섬 재전송
//! - **매니페스트 감시**: input.txt 해시 기반 변경 감지로 다운로드 트리거

pub mod catalog;
pub mod config;
pub mod datagram;
pub mod error;
pub mod handshake;
pub mod manifest;
pub mod packet;
pub mod progress;
pub mod stream;
pub mod transfer;

pub use catalog::CatalogEntry;
pub use config::{Config, TransportKind};
pub use error::{Error, Result};
pub use handshake::{ServerIdentity, SessionKey};
pub use manifest::ManifestWatcher;
pub use packet::{Packet, PacketType};
pub use progress::{ProgressBoard, ProgressEvent};
pub use transfer::{ChunkDescriptor, ChunkTransport, Downloader};

/// 프로토콜 태그 (헤더 선두 4바이트)
pub const PROTOCOL_TAG: [u8; 4] = *b"GEYS";

/// 세션 키 크기 (AES-128, 바이트)
pub const SESSION_KEY_SIZE: usize = 16;

/// AEAD nonce 크기 (바이트)
pub const NONCE_SIZE: usize = 16;

/// AEAD 인증 태그 크기 (바이트)
pub const TAG_SIZE: usize = 16;

/// 평문 헤더 크기: tag(4) + ip(4) + port(2) + type(1) + len(4)
pub const HEADER_PLAIN_SIZE: usize = 15;

/// 암호화된 헤더의 고정 wire 크기: nonce + 평문 + 태그
pub const HEADER_WIRE_SIZE: usize = NONCE_SIZE + HEADER_PLAIN_SIZE + TAG_SIZE;

/// 스트림 드라이버 파일 읽기 단위 (바이트)
pub const STREAM_READ_UNIT: usize = 1024;

/// 데이터그램 페이로드 상한 (프레이밍 여유 포함, MTU 이하)
pub const DATAGRAM_PAYLOAD_MAX: usize = 4086;

/// 청크 스트림 종료 센티넬
pub const SENTINEL_EOF: &[u8] = b"EOF";

/// 수신 확인 페이로드
pub const SENTINEL_ACK: &[u8] = b"ACK";
