//! Master/worker wire protocol (§4.7, §6): a length-prefixed binary stream
//! on TCP. Hand-rolled rather than `serde`-driven — the hot master/worker
//! path cares about a handful of fixed-width fields, not general-purpose
//! (de)serialization.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use aero_snapshot::TestcaseResult;

use crate::error::ProtocolError;

/// §9 "Resolved — wire protocol framing limit": guards a worker or master
/// against a corrupted/adversarial peer declaring an unbounded length.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// `{testcase, coverage, result}`, the worker→master message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    pub testcase: Vec<u8>,
    pub coverage: HashSet<u64>,
    pub result: TestcaseResult,
}

/// Read one `u32-LE length || payload` frame, rejecting declared lengths
/// over [`MAX_FRAME_LEN`] before allocating the payload buffer.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::MessageTooLarge { len, limit: MAX_FRAME_LEN });
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.map_err(map_eof)?;
    Ok(payload)
}

/// Write one `u32-LE length || payload` frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::MessageTooLarge {
        len: u32::MAX,
        limit: MAX_FRAME_LEN,
    })?;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

fn map_eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(err)
    }
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode_bytes(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u32(buf, cursor)? as usize;
    let end = cursor.checked_add(len).ok_or_else(|| ProtocolError::Malformed("bytes length overflow".into()))?;
    let slice = buf.get(*cursor..end).ok_or_else(|| ProtocolError::Malformed("truncated bytes field".into()))?;
    *cursor = end;
    Ok(slice.to_vec())
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32, ProtocolError> {
    let end = *cursor + 4;
    let slice = buf.get(*cursor..end).ok_or_else(|| ProtocolError::Malformed("truncated u32 field".into()))?;
    *cursor = end;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> Result<u64, ProtocolError> {
    let end = *cursor + 8;
    let slice = buf.get(*cursor..end).ok_or_else(|| ProtocolError::Malformed("truncated u64 field".into()))?;
    *cursor = end;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, ProtocolError> {
    let byte = buf.get(*cursor).copied().ok_or_else(|| ProtocolError::Malformed("truncated u8 field".into()))?;
    *cursor += 1;
    Ok(byte)
}

/// Master→worker payload: just `bytes` (§6).
pub fn encode_testcase(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    encode_bytes(&mut out, bytes);
    out
}

pub fn decode_testcase(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut cursor = 0;
    decode_bytes(payload, &mut cursor)
}

fn encode_result(out: &mut Vec<u8>, result: &TestcaseResult) {
    out.push(result.discriminant());
    if let TestcaseResult::Crash { name } = result {
        encode_bytes(out, name.as_bytes());
    }
}

fn decode_result(buf: &[u8], cursor: &mut usize) -> Result<TestcaseResult, ProtocolError> {
    match read_u8(buf, cursor)? {
        0 => Ok(TestcaseResult::Ok),
        1 => Ok(TestcaseResult::Timedout),
        2 => Ok(TestcaseResult::Cr3Change),
        3 => {
            let name_bytes = decode_bytes(buf, cursor)?;
            let name = String::from_utf8(name_bytes).map_err(|_| ProtocolError::Malformed("crash name is not utf8".into()))?;
            Ok(TestcaseResult::Crash { name })
        }
        other => Err(ProtocolError::Malformed(format!("unknown result discriminant {other}"))),
    }
}

/// Worker→master payload: `(bytes, coverage-set, result-tag)` (§6).
pub fn encode_worker_message(msg: &WorkerMessage) -> Vec<u8> {
    let mut out = Vec::new();
    encode_bytes(&mut out, &msg.testcase);
    out.extend_from_slice(&(msg.coverage.len() as u64).to_le_bytes());
    for id in &msg.coverage {
        out.extend_from_slice(&id.to_le_bytes());
    }
    encode_result(&mut out, &msg.result);
    out
}

pub fn decode_worker_message(payload: &[u8]) -> Result<WorkerMessage, ProtocolError> {
    let mut cursor = 0;
    let testcase = decode_bytes(payload, &mut cursor)?;
    let count = read_u64(payload, &mut cursor)? as usize;
    let mut coverage = HashSet::with_capacity(count);
    for _ in 0..count {
        coverage.insert(read_u64(payload, &mut cursor)?);
    }
    let result = decode_result(payload, &mut cursor)?;
    Ok(WorkerMessage { testcase, coverage, result })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testcase_round_trips() {
        let bytes = b"hello world".to_vec();
        let encoded = encode_testcase(&bytes);
        assert_eq!(decode_testcase(&encoded).unwrap(), bytes);
    }

    #[test]
    fn worker_message_round_trips_with_ok_result() {
        let msg = WorkerMessage {
            testcase: b"abc".to_vec(),
            coverage: [1u64, 2, 3].into_iter().collect(),
            result: TestcaseResult::Ok,
        };
        let encoded = encode_worker_message(&msg);
        assert_eq!(decode_worker_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn worker_message_round_trips_with_crash_result() {
        let msg = WorkerMessage {
            testcase: Vec::new(),
            coverage: HashSet::new(),
            result: TestcaseResult::Crash { name: "crash-EXCEPTION_ACCESS_VIOLATION_WRITE-deadbeef".into() },
        };
        let encoded = encode_worker_message(&msg);
        assert_eq!(decode_worker_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn truncated_payload_is_reported_as_malformed() {
        let err = decode_testcase(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[tokio::test]
    async fn frame_round_trips_over_an_in_memory_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"payload").await.unwrap();
        let received = read_frame(&mut b).await.unwrap();
        assert_eq!(received, b"payload");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocating() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }
}
