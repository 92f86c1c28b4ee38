//! 패킷 코덱 - GEYS 고정 바이너리 헤더 + AEAD 암복호화
//!
//! 패킷은 물리적으로 분리된 두 블록으로 전송됨:
//! - 헤더: tag(4) + ip(4) + port(2) + type(1) + payloadLen(4) = 15바이트 평문,
//!   wire에서는 nonce(16) + 암호문 + 태그(16) = 고정 47바이트
//! - 페이로드: nonce(16) + 암호문 + 태그(16), 길이는 헤더의 payloadLen
//!
//! 헤더를 먼저 복호화해야 페이로드 길이를 알 수 있으므로 두 블록은
//! 각각 독립된 nonce로 암호화됨

use std::net::Ipv4Addr;

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::handshake::SessionKey;
use crate::{Error, Result};
use crate::{HEADER_PLAIN_SIZE, HEADER_WIRE_SIZE, NONCE_SIZE, PROTOCOL_TAG, TAG_SIZE};

/// 16바이트 nonce를 쓰는 AES-128-GCM
type PacketCipher = AesGcm<Aes128, U16>;

/// 메시지 타입 코드 (1바이트 판별자)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// 연결 유지 확인
    KeepAlive = b'K',

    /// 파일 목록 요청
    ListFiles = b'F',

    /// 다운로드 핸드쉐이크 (파일 크기 협상)
    DownloadHandshake = b'E',

    /// 청크 데이터 / 청크 요청
    ChunkData = b'D',

    /// 청크 수신 확인
    Ack = b'A',

    /// 일반 응답
    Response = b'R',

    /// 연결 종료
    Quit = b'Q',
}

impl PacketType {
    /// wire 코드에서 변환
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'K' => Ok(PacketType::KeepAlive),
            b'F' => Ok(PacketType::ListFiles),
            b'E' => Ok(PacketType::DownloadHandshake),
            b'D' => Ok(PacketType::ChunkData),
            b'A' => Ok(PacketType::Ack),
            b'R' => Ok(PacketType::Response),
            b'Q' => Ok(PacketType::Quit),
            code => Err(Error::UnknownTypeCode { code }),
        }
    }

    /// wire 코드 반환
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// 복호화된 패킷 헤더
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// 송신자 IPv4 주소
    pub sender_ip: Ipv4Addr,

    /// 송신자 포트
    pub sender_port: u16,

    /// 메시지 타입
    pub packet_type: PacketType,

    /// 암호화된 페이로드 블록의 wire 길이 (nonce + 암호문 + 태그)
    pub payload_len: u32,
}

/// 복호화 완료된 패킷 한 개
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// 호스트 문자열을 4바이트로 패킹
///
/// "localhost"는 127.0.0.1로 정규화, 4옥텟 미만이면 오른쪽을 0으로 채움
pub fn pack_host(host: &str) -> [u8; 4] {
    let host = if host == "localhost" { "127.0.0.1" } else { host };

    let mut packed = [0u8; 4];
    for (slot, part) in packed.iter_mut().zip(host.split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    packed
}

/// 한 블록 암호화: 새 랜덤 nonce 생성, nonce + 암호문(+태그) 반환
fn seal(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>> {
    let cipher = PacketCipher::new(GenericArray::from_slice(key));

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Decryption)?;

    let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// 한 블록 복호화: 인증 태그가 맞지 않으면 Decryption 에러
fn open(wire: &[u8], key: &SessionKey) -> Result<Vec<u8>> {
    if wire.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Framing(format!("블록이 너무 짧음: {}바이트", wire.len())));
    }

    let cipher = PacketCipher::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(&wire[..NONCE_SIZE]);

    cipher.decrypt(nonce, &wire[NONCE_SIZE..]).map_err(|_| Error::Decryption)
}

/// 패킷 인코딩: 헤더 블록 + 페이로드 블록의 wire 바이트
///
/// 페이로드를 먼저 암호화해야 헤더의 payloadLen을 채울 수 있음
pub fn seal_packet(
    payload: &[u8],
    packet_type: PacketType,
    sender_ip: [u8; 4],
    sender_port: u16,
    key: &SessionKey,
) -> Result<Vec<u8>> {
    let sealed_payload = seal(payload, key)?;

    let mut header = [0u8; HEADER_PLAIN_SIZE];
    header[0..4].copy_from_slice(&PROTOCOL_TAG);
    header[4..8].copy_from_slice(&sender_ip);
    header[8..10].copy_from_slice(&sender_port.to_be_bytes());
    header[10] = packet_type.code();
    header[11..15].copy_from_slice(&(sealed_payload.len() as u32).to_be_bytes());

    let sealed_header = seal(&header, key)?;

    let mut wire = Vec::with_capacity(sealed_header.len() + sealed_payload.len());
    wire.extend_from_slice(&sealed_header);
    wire.extend_from_slice(&sealed_payload);
    Ok(wire)
}

/// 헤더 블록 복호화 + 파싱 (입력은 고정 47바이트)
pub fn open_header(wire: &[u8], key: &SessionKey) -> Result<PacketHeader> {
    let plain = open(wire, key)?;

    if plain.len() != HEADER_PLAIN_SIZE {
        return Err(Error::Framing(format!(
            "헤더 길이 불일치: expected {}, got {}",
            HEADER_PLAIN_SIZE,
            plain.len()
        )));
    }

    if plain[0..4] != PROTOCOL_TAG {
        return Err(Error::Framing("프로토콜 태그 불일치".to_string()));
    }

    let sender_ip = Ipv4Addr::new(plain[4], plain[5], plain[6], plain[7]);
    let sender_port = u16::from_be_bytes([plain[8], plain[9]]);
    let packet_type = PacketType::from_code(plain[10])?;
    let payload_len = u32::from_be_bytes([plain[11], plain[12], plain[13], plain[14]]);

    Ok(PacketHeader {
        sender_ip,
        sender_port,
        packet_type,
        payload_len,
    })
}

/// 페이로드 블록 복호화
pub fn open_payload(wire: &[u8], key: &SessionKey) -> Result<Vec<u8>> {
    open(wire, key)
}

/// wire 바이트 전체에서 패킷 하나 복원 (헤더 47바이트 + 페이로드)
pub fn open_packet(wire: &[u8], key: &SessionKey) -> Result<Packet> {
    if wire.len() < HEADER_WIRE_SIZE {
        return Err(Error::Framing(format!("패킷이 너무 짧음: {}바이트", wire.len())));
    }

    let header = open_header(&wire[..HEADER_WIRE_SIZE], key)?;
    let payload_end = HEADER_WIRE_SIZE + header.payload_len as usize;
    if wire.len() < payload_end {
        return Err(Error::Framing("페이로드 길이가 헤더와 불일치".to_string()));
    }

    let payload = open_payload(&wire[HEADER_WIRE_SIZE..payload_end], key)?;

    Ok(Packet {
        header,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SessionKey {
        let mut key = [0u8; crate::SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let payload = b"chunk data bytes";

        let wire =
            seal_packet(payload, PacketType::ChunkData, pack_host("localhost"), 3000, &key)
                .unwrap();
        let packet = open_packet(&wire, &key).unwrap();

        assert_eq!(packet.header.packet_type, PacketType::ChunkData);
        assert_eq!(packet.header.sender_ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(packet.header.sender_port, 3000);
        assert_eq!(packet.payload.as_ref(), payload);
    }

    #[test]
    fn test_wrong_key_fails_loudly() {
        let key = test_key();
        let other_key = test_key();

        let wire = seal_packet(b"secret", PacketType::Response, [10, 0, 0, 1], 9000, &key).unwrap();

        // 잘못된 키로는 조용히 깨진 평문을 돌려주면 안 됨
        assert!(matches!(
            open_header(&wire[..HEADER_WIRE_SIZE], &other_key),
            Err(Error::Decryption)
        ));
    }

    #[test]
    fn test_header_wire_size_is_fixed() {
        let key = test_key();
        let wire = seal_packet(b"", PacketType::KeepAlive, [127, 0, 0, 1], 1, &key).unwrap();

        let header = open_header(&wire[..HEADER_WIRE_SIZE], &key).unwrap();
        // 빈 페이로드도 nonce + 태그만큼은 차지함
        assert_eq!(header.payload_len as usize, NONCE_SIZE + TAG_SIZE);
        assert_eq!(wire.len(), HEADER_WIRE_SIZE + header.payload_len as usize);
    }

    #[test]
    fn test_payload_len_matches_sealed_block() {
        let key = test_key();
        let payload = vec![0xAB; 1024];
        let wire =
            seal_packet(&payload, PacketType::ChunkData, [192, 168, 0, 7], 4242, &key).unwrap();

        let header = open_header(&wire[..HEADER_WIRE_SIZE], &key).unwrap();
        assert_eq!(header.payload_len as usize, NONCE_SIZE + payload.len() + TAG_SIZE);

        let opened = open_payload(&wire[HEADER_WIRE_SIZE..], &key).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_pack_host_localhost() {
        assert_eq!(pack_host("localhost"), [127, 0, 0, 1]);
        assert_eq!(pack_host("192.168.1.10"), [192, 168, 1, 10]);
    }

    #[test]
    fn test_pack_host_short_is_zero_padded() {
        assert_eq!(pack_host("10.1"), [10, 1, 0, 0]);
        assert_eq!(pack_host(""), [0, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_type_code() {
        assert!(matches!(
            PacketType::from_code(b'Z'),
            Err(Error::UnknownTypeCode { code: b'Z' })
        ));
    }

    #[test]
    fn test_tampered_payload_detected() {
        let key = test_key();
        let mut wire =
            seal_packet(b"important", PacketType::Response, [127, 0, 0, 1], 80, &key).unwrap();

        // 페이로드 마지막 바이트 변조
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        assert!(matches!(
            open_payload(&wire[HEADER_WIRE_SIZE..], &key),
            Err(Error::Decryption)
        ));
    }
}
