use bytes::Bytes;

use driftfs_types::{BlockRef, ContentId, SliceId, SliceState};

use crate::error::{WalError, WalResult};

/// Entry type tags.
pub(crate) const ENTRY_SLICE: u8 = 0;
pub(crate) const ENTRY_DELETE_LEGACY: u8 = 1;
pub(crate) const ENTRY_REMOVE: u8 = 3;

/// Wire length of the fixed slice-id field.
const SLICE_ID_WIRE_LEN: usize = 36;

/// A single logged write.
///
/// Wire layout (all integers little-endian):
/// ```text
/// [1  B] entry type = 0
/// [2  B] handle length, [N B] handle
/// [4  B] chunk index
/// [36 B] slice id (ASCII, zero-padded)
/// [4  B] offset within chunk
/// [4  B] data length
/// [1  B] slice state
/// [8  B] created-at (wall-clock nanoseconds, signed)
/// [2  B] block-ref count, then per ref: [1 B] id length, [N B] id, [4 B] size
/// [len B] data
/// ```
/// The `length` field and the trailing data length are required to match
/// byte-for-byte; a shortfall on decode is corruption, not truncation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceRecord {
    pub content_id: ContentId,
    pub chunk_idx: u32,
    pub slice_id: SliceId,
    /// Byte offset within the chunk.
    pub offset: u32,
    pub data: Bytes,
    pub state: SliceState,
    /// Wall-clock nanoseconds at write time.
    pub created_at: i64,
    pub block_refs: Vec<BlockRef>,
}

impl SliceRecord {
    /// Exact encoded size of this record, including the type byte.
    pub fn encoded_len(&self) -> usize {
        let refs: usize = self
            .block_refs
            .iter()
            .map(|r| 1 + r.id.len() + 4)
            .sum();
        1 + 2 + self.content_id.len() + 4 + SLICE_ID_WIRE_LEN + 4 + 4 + 1 + 8 + 2 + refs
            + self.data.len()
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> WalResult<()> {
        if self.data.len() > u32::MAX as usize {
            return Err(WalError::InvalidRecord(format!(
                "slice data of {} bytes exceeds u32 framing",
                self.data.len()
            )));
        }
        if self.block_refs.len() > u16::MAX as usize {
            return Err(WalError::InvalidRecord(format!(
                "{} block refs exceed u16 framing",
                self.block_refs.len()
            )));
        }

        out.push(ENTRY_SLICE);
        out.extend_from_slice(&(self.content_id.len() as u16).to_le_bytes());
        out.extend_from_slice(self.content_id.as_bytes());
        out.extend_from_slice(&self.chunk_idx.to_le_bytes());

        // Slice id: ASCII, zero-padded to the fixed wire width.
        let id = self.slice_id.as_str().as_bytes();
        out.extend_from_slice(id);
        out.extend(std::iter::repeat(0u8).take(SLICE_ID_WIRE_LEN - id.len()));

        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.push(self.state.to_wire());
        out.extend_from_slice(&self.created_at.to_le_bytes());

        out.extend_from_slice(&(self.block_refs.len() as u16).to_le_bytes());
        for r in &self.block_refs {
            if r.id.len() > u8::MAX as usize {
                return Err(WalError::InvalidRecord(format!(
                    "block ref id of {} bytes exceeds u8 framing",
                    r.id.len()
                )));
            }
            out.push(r.id.len() as u8);
            out.extend_from_slice(r.id.as_bytes());
            out.extend_from_slice(&r.size.to_le_bytes());
        }

        out.extend_from_slice(&self.data);
        Ok(())
    }
}

pub(crate) fn encode_remove(content_id: &ContentId, out: &mut Vec<u8>) {
    out.push(ENTRY_REMOVE);
    out.extend_from_slice(&(content_id.len() as u16).to_le_bytes());
    out.extend_from_slice(content_id.as_bytes());
}

pub(crate) fn encoded_remove_len(content_id: &ContentId) -> usize {
    1 + 2 + content_id.len()
}

/// One decoded log entry.
#[derive(Debug)]
pub(crate) enum RawEntry {
    Slice(SliceRecord),
    /// Legacy delete records are skipped on replay.
    LegacyDelete,
    Remove(ContentId),
}

/// Decode one entry starting at `buf[0]`. `base` is the entry's absolute
/// file offset, used only for error reporting. Returns the entry and the
/// number of bytes consumed.
pub(crate) fn decode_entry(buf: &[u8], base: u64) -> WalResult<(RawEntry, usize)> {
    let mut cur = Cursor { buf, pos: 0, base };

    let entry_type = cur.u8()?;
    match entry_type {
        ENTRY_SLICE => {
            let handle_len = cur.u16()? as usize;
            let handle = cur.bytes(handle_len)?;
            let content_id = ContentId::from_bytes(handle)
                .map_err(|e| cur.corrupt(format!("bad handle: {e}")))?;

            let chunk_idx = cur.u32()?;

            let raw_id = cur.bytes(SLICE_ID_WIRE_LEN)?;
            let trimmed: &[u8] = match raw_id.iter().position(|&b| b == 0) {
                Some(end) => &raw_id[..end],
                None => raw_id,
            };
            let id_str = std::str::from_utf8(trimmed)
                .map_err(|_| cur.corrupt("slice id is not ASCII".into()))?;
            let slice_id =
                SliceId::parse(id_str).map_err(|e| cur.corrupt(format!("bad slice id: {e}")))?;

            let offset = cur.u32()?;
            let length = cur.u32()? as usize;
            let state_byte = cur.u8()?;
            let state = SliceState::from_wire(state_byte)
                .ok_or_else(|| cur.corrupt(format!("unknown slice state {state_byte}")))?;
            let created_at = cur.i64()?;

            let ref_count = cur.u16()? as usize;
            let mut block_refs = Vec::with_capacity(ref_count);
            for _ in 0..ref_count {
                let id_len = cur.u8()? as usize;
                let id_bytes = cur.bytes(id_len)?;
                let id = std::str::from_utf8(id_bytes)
                    .map_err(|_| cur.corrupt("block ref id is not ASCII".into()))?
                    .to_string();
                let size = cur.u32()?;
                block_refs.push(BlockRef { id, size });
            }

            let data = Bytes::copy_from_slice(cur.bytes(length)?);

            Ok((
                RawEntry::Slice(SliceRecord {
                    content_id,
                    chunk_idx,
                    slice_id,
                    offset,
                    data,
                    state,
                    created_at,
                    block_refs,
                }),
                cur.pos,
            ))
        }
        ENTRY_DELETE_LEGACY => {
            let handle_len = cur.u16()? as usize;
            cur.bytes(handle_len)?;
            Ok((RawEntry::LegacyDelete, cur.pos))
        }
        ENTRY_REMOVE => {
            let handle_len = cur.u16()? as usize;
            let handle = cur.bytes(handle_len)?;
            let content_id = ContentId::from_bytes(handle)
                .map_err(|e| cur.corrupt(format!("bad handle: {e}")))?;
            Ok((RawEntry::Remove(content_id), cur.pos))
        }
        other => Err(WalError::Corrupted {
            offset: base,
            reason: format!("unknown entry type {other}"),
        }),
    }
}

/// Bounds-checked reader over an entry's bytes.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> Cursor<'a> {
    fn corrupt(&self, reason: String) -> WalError {
        WalError::Corrupted {
            offset: self.base + self.pos as u64,
            reason,
        }
    }

    fn bytes(&mut self, n: usize) -> WalResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(WalError::Corrupted {
                offset: self.base + self.pos as u64,
                reason: format!(
                    "entry truncated: need {n} bytes, {} remain",
                    self.buf.len() - self.pos
                ),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> WalResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> WalResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> WalResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> WalResult<i64> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
