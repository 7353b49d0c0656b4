use std::io::{Read, Seek};

use binrw::{BinRead, BinReaderExt, BinResult, NullWideString};

pub fn parse_varint_u64<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u64> {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte: u8 = reader.read_le()?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

pub fn parse_varint_u32<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u32> {
    parse_varint_u64(reader).map(|x| x as u32)
}

/// Reads a UTF-16 string terminated by a two-byte NUL, decoding surrogate
/// pairs.
pub fn read_utf16_nts<R: Read + Seek>(reader: &mut R) -> BinResult<String> {
    let s = NullWideString::read_le(reader)?;
    Ok(s.to_string())
}

#[binrw::parser(reader)]
pub fn utf16_nts() -> BinResult<String> {
    read_utf16_nts(reader)
}
