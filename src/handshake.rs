//! 세션 핸드쉐이크 - RSA-OAEP 세션 키 전달
//!
//! 흐름:
//! 1. 서버가 기동 시 RSA-2048 키쌍 생성
//! 2. 연결 첫 바이트로 공개키(SPKI DER)를 평문 전송
//! 3. 클라이언트가 랜덤 16바이트 세션 키 생성, OAEP로 암호화해 회신
//! 4. 서버가 개인키로 복호화 — 이후 모든 트래픽은 패킷 코덱의 AES-GCM
//!
//! 이 계층에서는 재시도하지 않음: 실패 시 연결을 닫고 상위(드라이버)가 판단

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, SESSION_KEY_SIZE};

/// 대칭 세션 키 (연결당 하나, 절대 저장하지 않음)
pub type SessionKey = [u8; SESSION_KEY_SIZE];

/// RSA 키 길이 (비트)
pub const RSA_KEY_BITS: usize = 2048;

/// 길이 접두사로 허용하는 최대 블록 크기
const MAX_BLOCK_SIZE: usize = 8192;

/// 서버측 비대칭 신원 (기동 시 1회 생성, 연결 간 공유)
#[derive(Clone)]
pub struct ServerIdentity {
    private_key: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl ServerIdentity {
    /// 새 RSA-2048 키쌍 생성
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::Handshake(format!("키 생성 실패: {e}")))?;
        let public_der = RsaPublicKey::from(&private_key)
            .to_public_key_der()
            .map_err(|e| Error::Handshake(format!("공개키 인코딩 실패: {e}")))?
            .as_bytes()
            .to_vec();

        Ok(Self {
            private_key,
            public_der,
        })
    }

    /// 공개키 (SPKI DER)
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// 클라이언트가 보낸 암호문에서 세션 키 복원
    pub fn decrypt_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey> {
        let plain = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| Error::Handshake(format!("세션 키 복호화 실패: {e}")))?;

        let key: SessionKey = plain
            .try_into()
            .map_err(|_| Error::Handshake("세션 키 길이 불일치".to_string()))?;
        Ok(key)
    }
}

/// 클라이언트측: 공개키 DER로 새 세션 키 생성 + 암호화
pub fn encrypt_session_key(public_der: &[u8]) -> Result<(SessionKey, Vec<u8>)> {
    let public_key = RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| Error::Handshake(format!("공개키 파싱 실패: {e}")))?;

    let mut session_key: SessionKey = [0u8; SESSION_KEY_SIZE];
    OsRng.fill_bytes(&mut session_key);

    let ciphertext = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &session_key)
        .map_err(|e| Error::Handshake(format!("세션 키 암호화 실패: {e}")))?;

    Ok((session_key, ciphertext))
}

/// u16 길이 접두사 블록 송신
async fn write_block<S: AsyncWrite + Unpin>(stream: &mut S, block: &[u8]) -> Result<()> {
    stream.write_all(&(block.len() as u16).to_be_bytes()).await?;
    stream.write_all(block).await?;
    stream.flush().await?;
    Ok(())
}

/// u16 길이 접두사 블록 수신
async fn read_block<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    if len == 0 || len > MAX_BLOCK_SIZE {
        return Err(Error::Handshake(format!("블록 길이 비정상: {len}")));
    }

    let mut block = vec![0u8; len];
    stream.read_exact(&mut block).await?;
    Ok(block)
}

/// 서버측 핸드쉐이크: 공개키 광고 후 세션 키 수신
pub async fn server_accept<S>(stream: &mut S, identity: &ServerIdentity) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_block(stream, identity.public_key_der()).await?;

    let ciphertext = read_block(stream).await?;
    identity.decrypt_session_key(&ciphertext)
}

/// 클라이언트측 핸드쉐이크: 공개키 수신, 세션 키 생성/전송
pub async fn client_handshake<S>(stream: &mut S) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public_der = read_block(stream).await?;
    let (session_key, ciphertext) = encrypt_session_key(&public_der)?;

    write_block(stream, &ciphertext).await?;
    Ok(session_key)
}
