//! 스트림 전송 드라이버 (TCP, 신뢰 바이트 스트림)
//!
//! 교환 하나의 수신은 Idle → AwaitHeader → AwaitPayload → Complete 순서:
//! 고정 47바이트 헤더를 먼저 읽어 복호화한 뒤에야 페이로드 길이를 알고,
//! 정확히 그만큼을 더 읽음
//!
//! 청크 전송은 stop-and-wait: 데이터 패킷마다 A(ACK)를 기다린 후 다음
//! 읽기 단위를 보냄. 종료는 페이로드가 리터럴 `EOF`인 패킷

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::{self, CatalogEntry};
use crate::handshake::{self, ServerIdentity, SessionKey};
use crate::packet::{self, Packet, PacketType};
use crate::progress::ProgressEvent;
use crate::transfer::ChunkDescriptor;
use crate::{Error, Result};
use crate::{HEADER_WIRE_SIZE, NONCE_SIZE, SENTINEL_ACK, SENTINEL_EOF, STREAM_READ_UNIT, TAG_SIZE};

/// 페이로드 wire 길이 상한 (비정상 헤더 방어)
const MAX_PAYLOAD_WIRE: u32 = 16 * 1024 * 1024;

/// E 요청 페이로드: 파일 크기 협상
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub file_name: String,
    pub chunk_number: usize,
}

/// E 응답 페이로드: Y + 크기, 또는 N (파일 없음)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// 패킷 한 개 송신
pub async fn send_packet<S>(
    stream: &mut S,
    payload: &[u8],
    packet_type: PacketType,
    sender_ip: [u8; 4],
    sender_port: u16,
    key: &SessionKey,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let wire = packet::seal_packet(payload, packet_type, sender_ip, sender_port, key)?;
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

/// 패킷 한 개 수신 (헤더 → 페이로드 순서, 각 읽기에 타임아웃)
pub async fn recv_packet<S>(
    stream: &mut S,
    key: &SessionKey,
    recv_timeout: Duration,
) -> Result<Packet>
where
    S: AsyncRead + Unpin,
{
    // AwaitHeader: 고정 크기 헤더 블록
    let mut header_wire = [0u8; HEADER_WIRE_SIZE];
    tokio::time::timeout(recv_timeout, stream.read_exact(&mut header_wire))
        .await
        .map_err(|_| Error::TransferTimeout {
            context: "헤더 수신".to_string(),
        })??;

    let header = packet::open_header(&header_wire, key)?;

    if header.payload_len < (NONCE_SIZE + TAG_SIZE) as u32 || header.payload_len > MAX_PAYLOAD_WIRE
    {
        return Err(Error::Framing(format!(
            "헤더의 페이로드 길이 비정상: {}",
            header.payload_len
        )));
    }

    // AwaitPayload: 헤더가 말한 만큼 정확히 읽음
    let mut payload_wire = vec![0u8; header.payload_len as usize];
    tokio::time::timeout(recv_timeout, stream.read_exact(&mut payload_wire))
        .await
        .map_err(|_| Error::TransferTimeout {
            context: "페이로드 수신".to_string(),
        })??;

    let payload = packet::open_payload(&payload_wire, key)?;

    // Complete
    Ok(Packet {
        header,
        payload: payload.into(),
    })
}

/// 클라이언트측 연결 (연결당 세션 키 하나)
pub struct StreamConnection<S = TcpStream> {
    stream: S,
    key: SessionKey,
    local_ip: [u8; 4],
    local_port: u16,
    recv_timeout: Duration,
}

impl StreamConnection<TcpStream> {
    /// TCP 연결 + 핸드쉐이크
    pub async fn connect(addr: &str, recv_timeout: Duration) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let key = handshake::client_handshake(&mut stream).await?;

        let local = stream.local_addr()?;
        let local_ip = match local.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            std::net::IpAddr::V6(_) => [0, 0, 0, 0],
        };

        Ok(Self {
            stream,
            key,
            local_ip,
            local_port: local.port(),
            recv_timeout,
        })
    }
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 테스트용: 이미 핸드쉐이크를 마친 스트림 위에 생성
    pub fn from_parts(stream: S, key: SessionKey, recv_timeout: Duration) -> Self {
        Self {
            stream,
            key,
            local_ip: [127, 0, 0, 1],
            local_port: 0,
            recv_timeout,
        }
    }

    async fn send(&mut self, payload: &[u8], packet_type: PacketType) -> Result<()> {
        send_packet(
            &mut self.stream,
            payload,
            packet_type,
            self.local_ip,
            self.local_port,
            &self.key,
        )
        .await
    }

    async fn recv(&mut self) -> Result<Packet> {
        recv_packet(&mut self.stream, &self.key, self.recv_timeout).await
    }

    /// K: 연결 유지 확인
    pub async fn keep_alive(&mut self) -> Result<()> {
        self.send(b"", PacketType::KeepAlive).await?;
        let reply = self.recv().await?;

        if reply.payload.as_ref() != SENTINEL_ACK {
            return Err(Error::Framing("keep-alive 응답이 ACK가 아님".to_string()));
        }
        Ok(())
    }

    /// F: 서버 카탈로그 조회
    pub async fn list_files(&mut self) -> Result<Vec<CatalogEntry>> {
        self.send(b"", PacketType::ListFiles).await?;
        let reply = self.recv().await?;

        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// E: 다운로드 핸드쉐이크, 파일 크기 반환
    pub async fn negotiate_download(&mut self, file_name: &str, chunk_number: usize) -> Result<u64> {
        let request = DownloadRequest {
            file_name: file_name.to_string(),
            chunk_number,
        };
        self.send(&serde_json::to_vec(&request)?, PacketType::DownloadHandshake)
            .await?;

        let reply = self.recv().await?;
        let response: DownloadResponse = serde_json::from_slice(&reply.payload)?;

        match (response.response.as_str(), response.file_size) {
            ("Y", Some(size)) => Ok(size),
            ("N", _) => Err(Error::FileNotFound {
                name: file_name.to_string(),
            }),
            _ => Err(Error::Framing("E 응답 형식 불일치".to_string())),
        }
    }

    /// D: 청크 하나 수신, part 파일에 기록
    ///
    /// 데이터 패킷마다 ACK를 보내는 stop-and-wait. EOF 센티넬로 종료
    pub async fn fetch_chunk(
        &mut self,
        desc: &ChunkDescriptor,
        part_path: &Path,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> Result<u64> {
        self.send(&serde_json::to_vec(desc)?, PacketType::ChunkData)
            .await?;

        let mut part = File::create(part_path).await?;
        let mut written = 0u64;

        loop {
            let data = self.recv().await?;

            // 청크 스트림 중 파일이 사라진 경우 서버는 R/N으로 알림
            if data.header.packet_type == PacketType::Response && data.payload.as_ref() == b"N" {
                return Err(Error::FileNotFound {
                    name: desc.file_name.clone(),
                });
            }

            if data.payload.as_ref() == SENTINEL_EOF {
                break;
            }

            part.write_all(&data.payload).await?;
            written += data.payload.len() as u64;

            self.send(SENTINEL_ACK, PacketType::Ack).await?;

            let _ = progress
                .send(ProgressEvent::Advance {
                    chunk_index: desc.chunk_index,
                    bytes: data.payload.len() as u64,
                })
                .await;
        }

        part.flush().await?;

        if written != desc.length {
            return Err(Error::Framing(format!(
                "청크 {} 길이 불일치: expected {}, got {}",
                desc.chunk_index, desc.length, written
            )));
        }

        Ok(written)
    }

    /// Q: 종료 패킷을 보내고 ACK로 드레인 확인 후 닫음
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(b"", PacketType::Quit).await?;
        let reply = self.recv().await?;

        if reply.payload.as_ref() != SENTINEL_ACK {
            return Err(Error::Framing("Q 응답이 ACK가 아님".to_string()));
        }
        Ok(())
    }
}

/// 서버측 스트림 드라이버
pub struct StreamServer {
    identity: Arc<ServerIdentity>,
    database_dir: PathBuf,
    recv_timeout: Duration,
}

impl StreamServer {
    pub fn new(identity: Arc<ServerIdentity>, database_dir: PathBuf, recv_timeout: Duration) -> Self {
        Self {
            identity,
            database_dir,
            recv_timeout,
        }
    }

    /// accept 루프: 연결마다 태스크 하나
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("스트림 서버 대기: {}", listener.local_addr()?);

        loop {
            let (mut socket, peer) = listener.accept().await?;
            debug!("연결 수락: {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                let local = socket.local_addr().ok();
                let (ip, port) = match local {
                    Some(addr) => match addr.ip() {
                        std::net::IpAddr::V4(v4) => (v4.octets(), addr.port()),
                        std::net::IpAddr::V6(_) => ([0, 0, 0, 0], addr.port()),
                    },
                    None => ([0, 0, 0, 0], 0),
                };

                if let Err(e) = handle_connection(
                    &mut socket,
                    &server.identity,
                    &server.database_dir,
                    server.recv_timeout,
                    ip,
                    port,
                )
                .await
                {
                    warn!("연결 {} 종료: {}", peer, e);
                }
            });
        }
    }
}

/// 연결 하나 처리: 핸드쉐이크 후 타입별 디스패치 루프
///
/// 프레이밍/복호화 에러는 연결을 닫음. 수신 타임아웃은 대기 지속
pub async fn handle_connection<S>(
    stream: &mut S,
    identity: &ServerIdentity,
    database_dir: &Path,
    recv_timeout: Duration,
    sender_ip: [u8; 4],
    sender_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = handshake::server_accept(stream, identity).await?;

    loop {
        let request = match recv_packet(stream, &key, recv_timeout).await {
            Ok(packet) => packet,
            Err(Error::TransferTimeout { .. }) => continue,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let from = request.header.sender_ip;
        match request.header.packet_type {
            PacketType::KeepAlive => {
                debug!("[GEYS] {} 연결 유지", from);
                send_packet(stream, SENTINEL_ACK, PacketType::Response, sender_ip, sender_port, &key)
                    .await?;
            }

            PacketType::ListFiles => {
                info!("[GEYS] {} 파일 목록 요청", from);
                let entries = catalog::scan(database_dir)?;
                send_packet(
                    stream,
                    &serde_json::to_vec(&entries)?,
                    PacketType::Response,
                    sender_ip,
                    sender_port,
                    &key,
                )
                .await?;
            }

            PacketType::DownloadHandshake => {
                let req: DownloadRequest = serde_json::from_slice(&request.payload)?;
                info!(
                    "[GEYS] {} 다운로드 협상: {} ({}청크)",
                    from, req.file_name, req.chunk_number
                );

                let response = match catalog::file_size(database_dir, &req.file_name) {
                    Some(file_size) => DownloadResponse {
                        response: "Y".to_string(),
                        file_size: Some(file_size),
                    },
                    None => DownloadResponse {
                        response: "N".to_string(),
                        file_size: None,
                    },
                };
                send_packet(
                    stream,
                    &serde_json::to_vec(&response)?,
                    PacketType::Response,
                    sender_ip,
                    sender_port,
                    &key,
                )
                .await?;
            }

            PacketType::ChunkData => {
                let desc: ChunkDescriptor = serde_json::from_slice(&request.payload)?;
                info!(
                    "[GEYS] {} 청크 요청: {} part {} (offset={}, len={})",
                    from, desc.file_name, desc.chunk_index, desc.offset, desc.length
                );

                serve_chunk(stream, database_dir, &desc, recv_timeout, sender_ip, sender_port, &key)
                    .await?;
            }

            PacketType::Quit => {
                debug!("[GEYS] {} 종료", from);
                send_packet(stream, SENTINEL_ACK, PacketType::Response, sender_ip, sender_port, &key)
                    .await?;
                return Ok(());
            }

            PacketType::Ack | PacketType::Response => {
                return Err(Error::Framing("요청 위치에 응답 타입 패킷".to_string()));
            }
        }
    }
}

/// 청크 하나 송신: 1024바이트 단위 읽기, 패킷마다 ACK 대기, 끝에 EOF
async fn serve_chunk<S>(
    stream: &mut S,
    database_dir: &Path,
    desc: &ChunkDescriptor,
    recv_timeout: Duration,
    sender_ip: [u8; 4],
    sender_port: u16,
    key: &SessionKey,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = match catalog::resolve(database_dir, &desc.file_name) {
        Some(path) => path,
        None => {
            // 목록과 다운로드 사이에 파일이 사라진 경우
            send_packet(stream, b"N", PacketType::Response, sender_ip, sender_port, key).await?;
            return Ok(());
        }
    };

    let mut file = File::open(&path).await?;
    file.seek(std::io::SeekFrom::Start(desc.offset)).await?;

    let mut remaining = desc.length;
    let mut buf = vec![0u8; STREAM_READ_UNIT];

    while remaining > 0 {
        let unit = remaining.min(STREAM_READ_UNIT as u64) as usize;
        let n = file.read(&mut buf[..unit]).await?;
        if n == 0 {
            break; // 파일이 요청 범위보다 짧음
        }

        send_packet(stream, &buf[..n], PacketType::ChunkData, sender_ip, sender_port, key).await?;
        remaining -= n as u64;

        // stop-and-wait: 다음 읽기 단위 전에 반드시 ACK
        let ack = recv_packet(stream, key, recv_timeout).await?;
        if ack.header.packet_type != PacketType::Ack || ack.payload.as_ref() != SENTINEL_ACK {
            return Err(Error::Framing("청크 ACK가 아닌 패킷 수신".to_string()));
        }
    }

    send_packet(stream, SENTINEL_EOF, PacketType::ChunkData, sender_ip, sender_port, key).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::tests::shared_identity;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// duplex 스트림 위에 서버 태스크 + 핸드쉐이크 완료된 클라이언트 연결 구성
    async fn test_session(
        database_dir: PathBuf,
    ) -> (
        StreamConnection<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let identity = shared_identity().clone();
        let (mut client_side, mut server_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            handle_connection(
                &mut server_side,
                &identity,
                &database_dir,
                TEST_TIMEOUT,
                [127, 0, 0, 1],
                3000,
            )
            .await
        });

        let key = handshake::client_handshake(&mut client_side).await.unwrap();
        (
            StreamConnection::from_parts(client_side, key, TEST_TIMEOUT),
            server,
        )
    }

    #[tokio::test]
    async fn test_list_files_returns_catalog_with_sizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b.txt"), vec![0u8; 5_000_000]).unwrap();

        let (mut conn, server) = test_session(dir.path().to_path_buf()).await;

        let entries = conn.list_files().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 100);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].size, 5_000_000);

        conn.disconnect().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, server) = test_session(dir.path().to_path_buf()).await;

        let result = conn.negotiate_download("missing.txt", 4).await;
        assert!(matches!(result, Err(Error::FileNotFound { .. })));

        conn.disconnect().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_returns_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![7u8; 12345]).unwrap();

        let (mut conn, server) = test_session(dir.path().to_path_buf()).await;

        assert_eq!(conn.negotiate_download("data.bin", 4).await.unwrap(), 12345);

        conn.disconnect().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, server) = test_session(dir.path().to_path_buf()).await;

        conn.keep_alive().await.unwrap();

        conn.disconnect().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fetch_chunk_writes_requested_range() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("f.bin"), &data).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let part_path = out_dir.path().join("f.bin.part2");

        let (mut conn, server) = test_session(dir.path().to_path_buf()).await;

        let desc = ChunkDescriptor {
            file_name: "f.bin".to_string(),
            offset: 1000,
            length: 2500,
            chunk_index: 2,
        };
        let (tx, mut rx) = mpsc::channel(64);

        let written = conn.fetch_chunk(&desc, &part_path, &tx).await.unwrap();
        assert_eq!(written, 2500);
        assert_eq!(std::fs::read(&part_path).unwrap(), &data[1000..3500]);

        // 진행 이벤트 합이 청크 길이와 일치
        drop(tx);
        let mut reported = 0u64;
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Advance { chunk_index, bytes } => {
                    assert_eq!(chunk_index, 2);
                    reported += bytes;
                }
                ProgressEvent::Restart { .. } => panic!("재시도 없는 수신"),
            }
        }
        assert_eq!(reported, 2500);

        conn.disconnect().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_and_wait_blocks_until_ack() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), vec![9u8; 3000]).unwrap();

        let (mut conn, _server) = test_session(dir.path().to_path_buf()).await;

        let desc = ChunkDescriptor {
            file_name: "f.bin".to_string(),
            offset: 0,
            length: 3000,
            chunk_index: 1,
        };
        conn.send(&serde_json::to_vec(&desc).unwrap(), PacketType::ChunkData)
            .await
            .unwrap();

        // 첫 데이터 패킷 수신
        let first = conn.recv().await.unwrap();
        assert_eq!(first.payload.len(), STREAM_READ_UNIT);

        // ACK를 보내지 않으면 다음 데이터 패킷이 와서는 안 됨
        let mut short = conn;
        short.recv_timeout = Duration::from_millis(300);
        assert!(matches!(
            short.recv().await,
            Err(Error::TransferTimeout { .. })
        ));

        // ACK 후에는 다음 패킷 수신
        short.recv_timeout = TEST_TIMEOUT;
        short.send(SENTINEL_ACK, PacketType::Ack).await.unwrap();
        let second = short.recv().await.unwrap();
        assert_eq!(second.payload.len(), STREAM_READ_UNIT);
    }

    #[tokio::test]
    async fn test_chunk_request_for_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut conn, server) = test_session(dir.path().to_path_buf()).await;

        let out_dir = tempfile::tempdir().unwrap();
        let desc = ChunkDescriptor {
            file_name: "vanished.bin".to_string(),
            offset: 0,
            length: 100,
            chunk_index: 1,
        };
        let (tx, _rx) = mpsc::channel(8);

        let result = conn
            .fetch_chunk(&desc, &out_dir.path().join("vanished.part1"), &tx)
            .await;
        assert!(matches!(result, Err(Error::FileNotFound { .. })));

        conn.disconnect().await.unwrap();
        server.await.unwrap().unwrap();
    }
}
