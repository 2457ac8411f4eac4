//! Scripted-server helpers for session tests over an in-memory duplex.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use mssql_session::{Session, SessionConfig};
use tds_protocol::packet::PACKET_HEADER_SIZE;
use tds_protocol::token::{Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue, LoginAck, ServerMessage, TokenType};
use tds_protocol::PacketType;

pub const DONE_MORE: u16 = 0x0001;
pub const DONE_COUNT: u16 = 0x0010;
pub const DONE_ATTN: u16 = 0x0020;

/// Read one complete request message from the client: returns the packet
/// type byte and the concatenated payload.
pub async fn read_request(server: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut payload = Vec::new();
    loop {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; length - PACKET_HEADER_SIZE];
        server.read_exact(&mut body).await.unwrap();
        payload.extend_from_slice(&body);
        if header[1] & 0x01 != 0 {
            return (header[0], payload);
        }
    }
}

/// Read one raw packet; returns (type, status, packet_id, payload).
pub async fn read_raw_packet(server: &mut DuplexStream) -> (u8, u8, u8, Vec<u8>) {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    server.read_exact(&mut header).await.unwrap();
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut body = vec![0u8; length - PACKET_HEADER_SIZE];
    server.read_exact(&mut body).await.unwrap();
    (header[0], header[1], header[6], body)
}

/// Write one response packet (type TabularResult).
pub async fn write_frame(server: &mut DuplexStream, payload: &[u8], packet_id: u8, eom: bool) {
    let mut frame = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
    frame.put_u8(0x04); // TabularResult
    frame.put_u8(if eom { 0x01 } else { 0x08 }); // EOM or BATCH
    frame.put_u16((PACKET_HEADER_SIZE + payload.len()) as u16);
    frame.put_u16(0x0038); // spid
    frame.put_u8(packet_id);
    frame.put_u8(0);
    frame.put_slice(payload);
    server.write_all(&frame).await.unwrap();
    server.flush().await.unwrap();
}

/// Write a token stream as a response, split into packets of the given
/// size.
pub async fn write_response_packets(server: &mut DuplexStream, tokens: &[u8], packet_size: usize) {
    let max_payload = packet_size - PACKET_HEADER_SIZE;
    let chunks: Vec<&[u8]> = if tokens.is_empty() {
        vec![&[][..]]
    } else {
        tokens.chunks(max_payload).collect()
    };
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        write_frame(server, chunk, (i % 255) as u8 + 1, i == last).await;
    }
}

/// Write a token stream as a 4096-byte-packet response.
pub async fn write_response(server: &mut DuplexStream, tokens: &[u8]) {
    write_response_packets(server, tokens, 4096).await;
}

pub fn done_token(bits: u16, row_count: u64) -> Vec<u8> {
    let done = Done {
        status: DoneStatus::from_bits(bits),
        cur_cmd: 0,
        row_count,
    };
    let mut buf = BytesMut::new();
    done.encode(TokenType::Done, &mut buf);
    buf.to_vec()
}

pub fn env_binary_token(env_type: EnvChangeType, new: &[u8], old: &[u8]) -> Vec<u8> {
    let env = EnvChange {
        env_type,
        new_value: EnvChangeValue::Binary(Bytes::copy_from_slice(new)),
        old_value: EnvChangeValue::Binary(Bytes::copy_from_slice(old)),
    };
    let mut buf = BytesMut::new();
    env.encode(&mut buf);
    buf.to_vec()
}

pub fn env_string_token(env_type: EnvChangeType, new: &str, old: &str) -> Vec<u8> {
    let env = EnvChange {
        env_type,
        new_value: EnvChangeValue::String(new.into()),
        old_value: EnvChangeValue::String(old.into()),
    };
    let mut buf = BytesMut::new();
    env.encode(&mut buf);
    buf.to_vec()
}

pub fn begin_transaction_token(descriptor: u64) -> Vec<u8> {
    env_binary_token(
        EnvChangeType::BeginTransaction,
        &descriptor.to_le_bytes(),
        &[],
    )
}

pub fn commit_transaction_token() -> Vec<u8> {
    env_binary_token(EnvChangeType::CommitTransaction, &[], &[])
}

pub fn login_ack_token() -> Vec<u8> {
    let ack = LoginAck {
        interface: 1,
        tds_version: 0x7400_0004,
        prog_name: "Microsoft SQL Server".into(),
        prog_version: 0x1000_0000,
    };
    let mut buf = BytesMut::new();
    ack.encode(&mut buf);
    buf.to_vec()
}

pub fn info_token(number: i32, message: &str) -> Vec<u8> {
    let info = ServerMessage {
        number,
        state: 1,
        class: 10,
        message: message.into(),
        server: "testserver".into(),
        procedure: String::new(),
        line: 1,
    };
    let mut buf = BytesMut::new();
    info.encode(TokenType::Info, &mut buf);
    buf.to_vec()
}

pub fn error_token(number: i32, class: u8, message: &str) -> Vec<u8> {
    let error = ServerMessage {
        number,
        state: 1,
        class,
        message: message.into(),
        server: "testserver".into(),
        procedure: String::new(),
        line: 1,
    };
    let mut buf = BytesMut::new();
    error.encode(TokenType::Error, &mut buf);
    buf.to_vec()
}

/// A ROW token carrying a single little-endian i32 column.
pub fn int_row_token(value: i32) -> Vec<u8> {
    let mut row = vec![TokenType::Row as u8];
    row.extend_from_slice(&value.to_le_bytes());
    row
}

/// Connect a session and run the login exchange against the scripted
/// server: the client sends a login message; the server acknowledges with
/// packet-size and language environment changes, a LOGINACK, and a DONE.
pub async fn perform_login(session: &mut Session<DuplexStream>, server: &mut DuplexStream) {
    session
        .send_request(PacketType::Tds7Login, b"login-payload")
        .await
        .unwrap();

    let (packet_type, _payload) = read_request(server).await;
    assert_eq!(packet_type, PacketType::Tds7Login as u8);

    let mut tokens = Vec::new();
    tokens.extend(env_string_token(EnvChangeType::PacketSize, "4096", "4096"));
    tokens.extend(env_string_token(
        EnvChangeType::Language,
        "us_english",
        "",
    ));
    tokens.extend(login_ack_token());
    tokens.extend(done_token(0, 0));
    write_response(server, &tokens).await;

    session.run_to_completion().await.unwrap();
    assert_eq!(session.state(), mssql_session::SessionState::LoggedIn);
}

/// A fresh connected pair with default configuration.
pub fn session_pair(config: SessionConfig) -> (Session<DuplexStream>, DuplexStream) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let session = Session::new(client, config).unwrap();
    (session, server)
}

/// Decode the UTF-16LE SQL text of a SQL batch payload (after
/// ALL_HEADERS).
pub fn batch_sql(payload: &[u8]) -> String {
    let all_headers_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let sql_bytes = &payload[all_headers_len..];
    let units: Vec<u16> = sql_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).unwrap()
}

/// The transaction descriptor stamped in a SQL batch's ALL_HEADERS.
pub fn batch_descriptor(payload: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[10..18]);
    u64::from_le_bytes(raw)
}
