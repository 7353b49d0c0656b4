//! Decoding of the `.nettrace` container: the FastSerialization object
//! framing and the block payloads it carries.
//!
//! Format reference:
//! https://github.com/microsoft/perfview/blob/main/src/TraceEvent/EventPipe/EventPipeFormat.md

mod block;
mod decoder;
mod metadata;
mod stream;

pub use block::{Blob, BlobBlock, BlobBlockHeader, BlobHeader, SequencePointBlock, Stack,
                StackBlock, ThreadSequencePoint};
pub use decoder::Decoder;
pub use metadata::{FieldType, Metadata, MetadataField, MetadataHeader, MetadataPayload, TypeCode};
pub use stream::{EventSink, Status, Stream};

use binrw::BinRead;
use num_derive::FromPrimitive;

/// FastSerialization one-byte tags. Only `NullReference`,
/// `BeginPrivateObject` and `EndObject` appear in a nettrace stream.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    NullReference = 1,
    ObjectReference = 2,
    ForwardReference = 3,
    BeginObject = 4,
    BeginPrivateObject = 5,
    EndObject = 6,
}

/// A FastSerialization-framed unit: type descriptor plus raw payload bytes.
/// Block payloads are decoded further by [`BlobBlock`], [`StackBlock`] and
/// [`SequencePointBlock`].
#[derive(Debug, Clone)]
pub struct Object {
    pub type_name: String,
    pub version: i32,
    pub min_reader_version: i32,
    pub payload: Vec<u8>,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct WallClockTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millisecond: u16,
}

/// The trace header object, always first in the stream. Timestamps elsewhere
/// in the trace are QPC ticks relative to `sync_time_qpc`.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct Trace {
    pub sync_time_utc: WallClockTime,
    pub sync_time_qpc: i64,
    pub qpc_frequency: i64,
    #[br(assert(pointer_size == 4 || pointer_size == 8, "pointer size {} is not 4 or 8", pointer_size))]
    pub pointer_size: u32,
    pub process_id: u32,
    pub number_of_processors: u32,
    pub expected_cpu_sampling_rate: u32,
}
