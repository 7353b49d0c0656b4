use std::io::Read;

use binrw::BinRead;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};

use super::{Object, Tag, Trace};

const MAGIC: &[u8; 8] = b"Nettrace";
const SIGNATURE: &[u8] = b"!FastSerialization.1";

const TRACE_OBJECT: &str = "Trace";
// sync time (8 x u16), sync QPC, QPC frequency, pointer size, process id,
// processor count, sampling rate. The trace payload carries no length prefix.
const TRACE_PAYLOAD_LEN: usize = 48;

const BLOCK_OBJECTS: [&str; 4] = ["EventBlock", "MetadataBlock", "StackBlock", "SPBlock"];

/// Reads the FastSerialization framing from a byte source and yields typed
/// [`Object`]s. The source only needs to implement [`Read`]; the decoder
/// tracks its own absolute offset for the 4-byte block alignment, so live
/// socket streams decode the same way as files.
pub struct Decoder<R> {
    source: R,
    offset: u64,
    finished: bool,
}

impl<R: Read> Decoder<R> {
    pub fn new(source: R) -> Self {
        Decoder {
            source,
            offset: 0,
            finished: false,
        }
    }

    /// Consumes the stream preamble and the leading trace object.
    pub fn open_trace(&mut self) -> Result<Trace> {
        self.read_preamble()?;
        let Some(object) = self.next_object()? else {
            return Err(self.assert_fail("stream ended before the trace object"));
        };
        if object.type_name != TRACE_OBJECT {
            return Err(self.assert_fail("first object in the stream is not a trace header"));
        }
        let trace = Trace::read(&mut std::io::Cursor::new(&object.payload))?;
        log::trace!("trace header: {trace:?}");
        Ok(trace)
    }

    /// Decodes one object, or returns `None` at the end-of-stream tag.
    /// Subsequent calls after the end of the stream keep returning `None`.
    pub fn next_object(&mut self) -> Result<Option<Object>> {
        if self.finished {
            return Ok(None);
        }
        let (byte, offset) = self.read_tag()?;
        match Tag::from_u8(byte) {
            Some(Tag::NullReference) => {
                self.finished = true;
                return Ok(None);
            }
            Some(Tag::BeginPrivateObject) => {}
            Some(Tag::BeginObject | Tag::ObjectReference | Tag::ForwardReference) => {
                return Err(Error::NotImplemented("object and forward references"));
            }
            _ => return Err(Error::UnexpectedTag { tag: byte, offset }),
        }

        let (type_name, version, min_reader_version) = self.read_type_descriptor()?;
        let payload = if type_name == TRACE_OBJECT {
            self.read_bytes(TRACE_PAYLOAD_LEN)?
        } else if BLOCK_OBJECTS.contains(&type_name.as_str()) {
            self.read_block_payload()?
        } else {
            return Err(Error::UnknownObjectType(type_name));
        };
        self.expect_tag(Tag::EndObject)?;

        log::trace!("object {type_name} v{version}, payload {} bytes", payload.len());
        Ok(Some(Object {
            type_name,
            version,
            min_reader_version,
            payload,
        }))
    }

    fn read_preamble(&mut self) -> Result<()> {
        let mut magic = [0u8; 8];
        self.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidSignature);
        }
        let len = self.read_u32()? as usize;
        if len != SIGNATURE.len() {
            return Err(Error::InvalidSignature);
        }
        let signature = self.read_bytes(len)?;
        if signature != SIGNATURE {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    // Type descriptor: a nested private object whose own type is a null
    // reference, carrying versions and the type name.
    fn read_type_descriptor(&mut self) -> Result<(String, i32, i32)> {
        self.expect_tag(Tag::BeginPrivateObject)?;
        self.expect_tag(Tag::NullReference)?;
        let version = self.read_u32()? as i32;
        let min_reader_version = self.read_u32()? as i32;
        let name_len = self.read_u32()? as usize;
        let name = self.read_bytes(name_len)?;
        let name = String::from_utf8_lossy(&name).into_owned();
        self.expect_tag(Tag::EndObject)?;
        Ok((name, version, min_reader_version))
    }

    // Every block payload is framed by an int32 size followed by padding
    // that aligns the payload to 4 bytes relative to the stream start.
    fn read_block_payload(&mut self) -> Result<Vec<u8>> {
        let size = self.read_u32()? as usize;
        let misaligned = (self.offset & 3) as usize;
        if misaligned != 0 {
            let mut pad = [0u8; 4];
            self.read_exact(&mut pad[..4 - misaligned])?;
        }
        self.read_bytes(size)
    }

    fn read_tag(&mut self) -> Result<(u8, u64)> {
        let offset = self.offset;
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok((byte[0], offset))
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let offset = self.offset;
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        if Tag::from_u8(byte[0]) != Some(expected) {
            return Err(Error::UnexpectedTag {
                tag: byte[0],
                offset,
            });
        }
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.source.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn assert_fail(&self, message: &str) -> Error {
        Error::Decode(binrw::Error::AssertFail {
            pos: self.offset,
            message: message.to_string(),
        })
    }
}
