use std::io::{Read, Seek};

use binrw::BinReaderExt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};
use crate::helpers::read_utf16_nts;

use super::Blob;

/// .NET type codes as they appear in metadata payload descriptions, plus the
/// EventPipe-specific `Array` code.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TypeCode {
    Empty = 0,
    Object = 1,
    DbNull = 2,
    Boolean = 3,
    Char = 4,
    SByte = 5,
    Byte = 6,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Single = 13,
    Double = 14,
    Decimal = 15,
    DateTime = 16,
    String = 18,
    Array = 19,
}

/// A metadata record: the event definition that event blobs reference by id.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub header: MetadataHeader,
    pub payload: MetadataPayload,
}

#[derive(Debug, Clone)]
pub struct MetadataHeader {
    pub metadata_id: i32,
    pub provider_name: String,
    pub event_id: i32,
    pub event_name: String,
    pub keywords: i64,
    pub version: i32,
    pub level: i32,
}

/// Description of an event payload: a field count followed by the fields.
/// Object-typed fields nest another payload description, to arbitrary depth.
#[derive(Debug, Clone, Default)]
pub struct MetadataPayload {
    pub fields: Vec<MetadataField>,
}

#[derive(Debug, Clone)]
pub struct MetadataField {
    pub field_type: FieldType,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum FieldType {
    Primitive(TypeCode),
    Object(MetadataPayload),
}

impl Metadata {
    /// Decodes a metadata record from a blob of a `MetadataBlock`. Trailing
    /// bytes after the payload description would be V5+ tagged metadata,
    /// which is out of scope here.
    pub fn from_blob(blob: &Blob<'_>) -> Result<Metadata> {
        let mut cur = std::io::Cursor::new(blob.payload);
        let header = read_header(&mut cur)?;
        let payload = read_payload(&mut cur)?;
        if (cur.position() as usize) < blob.payload.len() {
            return Err(Error::NotImplemented("tagged metadata (format V5 and later)"));
        }
        Ok(Metadata { header, payload })
    }
}

fn read_header<R: BinReaderExt + Read + Seek>(r: &mut R) -> Result<MetadataHeader> {
    Ok(MetadataHeader {
        metadata_id: r.read_le()?,
        provider_name: read_utf16_nts(r)?,
        event_id: r.read_le()?,
        event_name: read_utf16_nts(r)?,
        keywords: r.read_le()?,
        version: r.read_le()?,
        level: r.read_le()?,
    })
}

fn read_payload<R: BinReaderExt + Read + Seek>(r: &mut R) -> Result<MetadataPayload> {
    let count: i32 = r.read_le()?;
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        fields.push(read_field(r)?);
    }
    Ok(MetadataPayload { fields })
}

fn read_field<R: BinReaderExt + Read + Seek>(r: &mut R) -> Result<MetadataField> {
    let raw: i32 = r.read_le()?;
    let Some(code) = TypeCode::from_i32(raw) else {
        return Err(Error::Decode(binrw::Error::AssertFail {
            pos: r.stream_position()?,
            message: format!("unknown metadata type code {raw}"),
        }));
    };
    let field_type = match code {
        TypeCode::Array => return Err(Error::NotImplemented("array-typed metadata fields")),
        TypeCode::Object => FieldType::Object(read_payload(r)?),
        code => FieldType::Primitive(code),
    };
    let name = read_utf16_nts(r)?;
    Ok(MetadataField { field_type, name })
}
