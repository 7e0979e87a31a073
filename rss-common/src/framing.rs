//! On-disk block framing for partition files (§6): `[u32 length][u32
//! crc32c][u32 mapId][u16 mapAttempt][u32 seqNo][bytes payload]`, big-endian.
//! A block with a zero-length payload is the per-(mapAttempt, partition)
//! terminator: the literal wire frame has no dedicated terminator flag, so
//! an empty payload is the signal, since every real data block carries at
//! least one byte of payload.

use crate::error::RssError;
use crate::model::{Block, StageShuffleId};

const HEADER_LEN: usize = 4 + 4 + 4 + 2 + 4;

fn framing_err(message: impl Into<String>) -> RssError {
    RssError::ProtocolError {
        message: message.into(),
    }
}

/// Encode a single block as one on-disk frame.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + block.payload.len());
    let crc = crc32c::crc32c(&block.payload);
    out.extend_from_slice(&(block.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&block.map_id.to_be_bytes());
    out.extend_from_slice(&block.map_attempt.to_be_bytes());
    out.extend_from_slice(&block.seq_no.to_be_bytes());
    out.extend_from_slice(&block.payload);
    out
}

/// Decode every frame in `bytes` into `Block`s addressed at `stage`/
/// `partition_id`. Stops cleanly at a partial trailing frame (the tail of a
/// file still being appended by a concurrent writer) rather than erroring,
/// since the reader may observe a partition file mid-flush.
pub fn decode_blocks(bytes: &[u8], stage: &StageShuffleId, partition_id: u32) -> Result<Vec<Block>, RssError> {
    let mut blocks = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        if bytes.len() - offset < HEADER_LEN {
            break;
        }
        let length = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let map_id = u32::from_be_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
        let map_attempt = u16::from_be_bytes(bytes[offset + 12..offset + 14].try_into().unwrap());
        let seq_no = u32::from_be_bytes(bytes[offset + 14..offset + 18].try_into().unwrap());

        let payload_start = offset + HEADER_LEN;
        let payload_end = payload_start + length;
        if payload_end > bytes.len() {
            break;
        }
        let payload = &bytes[payload_start..payload_end];
        let actual_crc = crc32c::crc32c(payload);
        if actual_crc != crc {
            return Err(framing_err(format!(
                "crc mismatch at offset {offset} for mapId={map_id} seqNo={seq_no}: expected {crc:#x}, got {actual_crc:#x}"
            )));
        }

        blocks.push(Block {
            stage: stage.clone(),
            map_id,
            map_attempt,
            partition_id,
            seq_no,
            payload: payload.to_vec(),
            is_terminator: length == 0,
        });

        offset = payload_end;
    }

    Ok(blocks)
}
