use std::io::{Cursor, Read, Seek, SeekFrom};

use binrw::{BinRead, BinReaderExt};
use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::helpers::{parse_varint_u32, parse_varint_u64};

use super::Object;

/// Header shared by event blocks and metadata blocks.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct BlobBlockHeader {
    /// Size of the header including this field; anything beyond the fixed
    /// fields is reserved padding.
    pub size: u16,
    pub flags: u16,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

const BLOB_BLOCK_HEADER_LEN: i64 = 20;

bitflags! {
    // Field-presence bits of the compressed blob header. A clear bit means
    // the field is inherited from the previous blob in the block.
    #[derive(Debug, Clone, Copy)]
    struct HeaderFlags: u8 {
        const METADATA_ID = 1 << 0;
        const CAPTURE_THREAD_AND_SEQUENCE = 1 << 1;
        const THREAD_ID = 1 << 2;
        const STACK_ID = 1 << 3;
        const ACTIVITY_ID = 1 << 4;
        const RELATED_ACTIVITY_ID = 1 << 5;
        const IS_SORTED = 1 << 6;
        const PAYLOAD_SIZE = 1 << 7;
    }
}

/// Blob header, shared by the compressed and uncompressed formats. The
/// uncompressed layout is read directly; the compressed layout is
/// reconstructed field by field against the previous header.
#[derive(BinRead, Debug, Default, Clone, Copy)]
#[br(little)]
pub struct BlobHeader {
    /// Record size not counting this field. Unused beyond framing.
    pub event_size: i32,
    pub metadata_id: i32,
    pub sequence_number: i32,
    pub thread_id: i64,
    pub capture_thread_id: i64,
    pub capture_proc_number: i32,
    pub stack_id: i32,
    pub timestamp: i64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub payload_size: i32,
}

/// One event or metadata record. The payload borrows from the block and is
/// only valid until the next blob is read.
#[derive(Debug)]
pub struct Blob<'a> {
    pub header: BlobHeader,
    pub payload: &'a [u8],
    pub(crate) sorted: bool,
}

impl Blob<'_> {
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }
}

/// Sequential reader over the blobs of an `EventBlock` or `MetadataBlock`.
/// Bit 0 of the block flags selects compressed headers; the delta cache for
/// them is state of the block and never crosses block boundaries.
pub struct BlobBlock {
    pub header: BlobBlockHeader,
    compressed: bool,
    last_header: BlobHeader,
    data: Cursor<Vec<u8>>,
}

impl BlobBlock {
    pub fn from_object(object: Object) -> Result<Self> {
        let mut data = Cursor::new(object.payload);
        let header = BlobBlockHeader::read(&mut data)?;
        let padding = i64::from(header.size) - BLOB_BLOCK_HEADER_LEN;
        if padding > 0 {
            data.seek(SeekFrom::Current(padding))?;
        }
        Ok(BlobBlock {
            header,
            compressed: header.flags & 0x0001 != 0,
            last_header: BlobHeader::default(),
            data,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Next blob in the block, or `None` once the payload is consumed.
    pub fn next_blob(&mut self) -> Result<Option<Blob<'_>>> {
        if self.data.position() >= self.data.get_ref().len() as u64 {
            return Ok(None);
        }
        let (header, sorted) = if self.compressed {
            self.read_compressed_header()?
        } else {
            self.read_header()?
        };
        if header.payload_size < 0 {
            return Err(Error::Decode(binrw::Error::AssertFail {
                pos: self.data.position(),
                message: format!("negative blob payload size {}", header.payload_size),
            }));
        }
        let start = self.data.position() as usize;
        let end = start + header.payload_size as usize;
        if end > self.data.get_ref().len() {
            return Err(Error::Decode(binrw::Error::AssertFail {
                pos: self.data.position(),
                message: "blob payload extends past the end of the block".to_string(),
            }));
        }
        self.data.set_position(end as u64);
        Ok(Some(Blob {
            header,
            sorted,
            payload: &self.data.get_ref()[start..end],
        }))
    }

    fn read_header(&mut self) -> Result<(BlobHeader, bool)> {
        let mut header = BlobHeader::read(&mut self.data)?;
        // In an event block the low bits of the raw word key the event's
        // metadata record; in a metadata block they are zero. The high flag
        // bit marks unsorted events.
        header.metadata_id &= 0x7FFF;
        let sorted = header.metadata_id & 0x8000 == 0;
        Ok((header, sorted))
    }

    fn read_compressed_header(&mut self) -> Result<(BlobHeader, bool)> {
        let mut header = self.last_header;
        let r = &mut self.data;
        let flags = HeaderFlags::from_bits_retain(r.read_le::<u8>()?);
        if flags.contains(HeaderFlags::METADATA_ID) {
            header.metadata_id = parse_varint_u32(r)? as i32;
        }
        if flags.contains(HeaderFlags::CAPTURE_THREAD_AND_SEQUENCE) {
            header.sequence_number = (parse_varint_u32(r)? as i32).wrapping_add(1);
            header.capture_thread_id = parse_varint_u64(r)? as i64;
            header.capture_proc_number = parse_varint_u32(r)? as i32;
        } else if header.metadata_id != 0 {
            header.sequence_number = header.sequence_number.wrapping_add(1);
        }
        if flags.contains(HeaderFlags::THREAD_ID) {
            header.thread_id = parse_varint_u64(r)? as i64;
        }
        if flags.contains(HeaderFlags::STACK_ID) {
            header.stack_id = parse_varint_u32(r)? as i32;
        }
        // The timestamp delta is always present and accumulates.
        header.timestamp = header.timestamp.wrapping_add(parse_varint_u64(r)? as i64);
        if flags.contains(HeaderFlags::ACTIVITY_ID) {
            r.read_exact(&mut header.activity_id)?;
        }
        if flags.contains(HeaderFlags::RELATED_ACTIVITY_ID) {
            r.read_exact(&mut header.related_activity_id)?;
        }
        if flags.contains(HeaderFlags::PAYLOAD_SIZE) {
            header.payload_size = parse_varint_u32(r)? as i32;
        }
        let sorted = flags.contains(HeaderFlags::IS_SORTED);
        self.last_header = header;
        Ok((header, sorted))
    }
}

/// A captured call stack: raw bytes whose interpretation as 4- or 8-byte
/// instruction pointers depends on the trace header's pointer size.
#[derive(Debug, Clone)]
pub struct Stack {
    pub id: i32,
    pub data: Vec<u8>,
}

impl Stack {
    /// Decodes the stack as little-endian 64-bit instruction pointers.
    pub fn instruction_pointers_64(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        let mut buf = [0u8; 8];
        for chunk in self.data.chunks_exact(8) {
            buf.copy_from_slice(chunk);
            out.push(u64::from_le_bytes(buf));
        }
        out
    }

    /// Decodes the stack as little-endian 32-bit instruction pointers,
    /// widened to 64 bits.
    pub fn instruction_pointers_32(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.data.len() / 4);
        let mut buf = [0u8; 4];
        for chunk in self.data.chunks_exact(4) {
            buf.copy_from_slice(chunk);
            out.push(u64::from(u32::from_le_bytes(buf)));
        }
        out
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RawStack {
    size: u32,
    #[br(count = size)]
    data: Vec<u8>,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RawStackBlock {
    first_id: i32,
    count: u32,
    #[br(count = count)]
    stacks: Vec<RawStack>,
}

/// A batch of stacks, each assigned the id `first_id + index`. Stack ids are
/// only valid within the sequence-point window that produced them.
#[derive(Debug)]
pub struct StackBlock {
    pub first_id: i32,
    pub stacks: Vec<Stack>,
}

impl StackBlock {
    pub fn from_object(object: Object) -> Result<Self> {
        let raw = RawStackBlock::read(&mut Cursor::new(object.payload))?;
        let stacks = raw
            .stacks
            .into_iter()
            .enumerate()
            .map(|(i, s)| Stack {
                id: raw.first_id.wrapping_add(i as i32),
                data: s.data,
            })
            .collect();
        Ok(StackBlock {
            first_id: raw.first_id,
            stacks,
        })
    }
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct ThreadSequencePoint {
    pub thread_id: i64,
    pub sequence_number: i32,
}

/// A synchronization marker: buffered samples must be drained and the stack
/// cache discarded once it is handled.
#[derive(BinRead, Debug)]
#[br(little)]
pub struct SequencePointBlock {
    pub timestamp: i64,
    thread_count: u32,
    #[br(count = thread_count)]
    pub threads: Vec<ThreadSequencePoint>,
}

impl SequencePointBlock {
    pub fn from_object(object: Object) -> Result<Self> {
        Ok(SequencePointBlock::read(&mut Cursor::new(object.payload))?)
    }
}
