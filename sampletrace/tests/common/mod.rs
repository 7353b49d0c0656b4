//! Byte-level builder for synthetic nettrace streams.
#![allow(dead_code)]

const BEGIN_PRIVATE_OBJECT: u8 = 5;
const END_OBJECT: u8 = 6;
const NULL_REFERENCE: u8 = 1;

pub struct TraceBuilder {
    buf: Vec<u8>,
}

impl TraceBuilder {
    /// Starts a stream with a valid preamble.
    pub fn new() -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"Nettrace");
        let signature = b"!FastSerialization.1";
        buf.extend_from_slice(&(signature.len() as u32).to_le_bytes());
        buf.extend_from_slice(signature);
        TraceBuilder { buf }
    }

    fn object_header(&mut self, name: &str) {
        self.buf.push(BEGIN_PRIVATE_OBJECT);
        self.buf.push(BEGIN_PRIVATE_OBJECT);
        self.buf.push(NULL_REFERENCE);
        self.buf.extend_from_slice(&4u32.to_le_bytes()); // version
        self.buf.extend_from_slice(&4u32.to_le_bytes()); // min reader version
        self.buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(END_OBJECT);
    }

    pub fn trace(mut self, pointer_size: u32, sync_time_qpc: i64) -> Self {
        self.object_header("Trace");
        for _ in 0..8 {
            self.buf.extend_from_slice(&0u16.to_le_bytes()); // sync UTC time
        }
        self.buf.extend_from_slice(&sync_time_qpc.to_le_bytes());
        self.buf.extend_from_slice(&1000i64.to_le_bytes()); // QPC frequency
        self.buf.extend_from_slice(&pointer_size.to_le_bytes());
        self.buf.extend_from_slice(&4242u32.to_le_bytes()); // process id
        self.buf.extend_from_slice(&8u32.to_le_bytes()); // processors
        self.buf.extend_from_slice(&1000u32.to_le_bytes()); // sampling rate
        self.buf.push(END_OBJECT);
        self
    }

    /// Appends a block object: size prefix, padding to a 4-byte stream
    /// offset, then the payload.
    pub fn block(mut self, name: &str, payload: &[u8]) -> Self {
        self.object_header(name);
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self.buf.extend_from_slice(payload);
        self.buf.push(END_OBJECT);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(NULL_REFERENCE);
        self.buf
    }
}

pub fn utf16_nts(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

pub fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// Event or metadata block payload: fixed header plus concatenated blobs.
pub fn blob_block(flags: u16, blobs: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&20u16.to_le_bytes()); // header size
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&0i64.to_le_bytes()); // min timestamp
    buf.extend_from_slice(&0i64.to_le_bytes()); // max timestamp
    buf.extend_from_slice(blobs);
    buf
}

/// One blob in the uncompressed header format.
pub fn event_blob(
    raw_metadata_id: i32,
    thread_id: i64,
    stack_id: i32,
    timestamp: i64,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0i32.to_le_bytes()); // event size
    buf.extend_from_slice(&raw_metadata_id.to_le_bytes());
    buf.extend_from_slice(&1i32.to_le_bytes()); // sequence number
    buf.extend_from_slice(&thread_id.to_le_bytes());
    buf.extend_from_slice(&thread_id.to_le_bytes()); // capture thread id
    buf.extend_from_slice(&0i32.to_le_bytes()); // capture proc
    buf.extend_from_slice(&stack_id.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&[0u8; 16]); // activity id
    buf.extend_from_slice(&[0u8; 16]); // related activity id
    buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// A metadata record with an empty payload description.
pub fn metadata_record(id: i32, provider: &str, event_id: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&utf16_nts(provider));
    buf.extend_from_slice(&event_id.to_le_bytes());
    buf.extend_from_slice(&utf16_nts(""));
    buf.extend_from_slice(&0i64.to_le_bytes()); // keywords
    buf.extend_from_slice(&1i32.to_le_bytes()); // version
    buf.extend_from_slice(&4i32.to_le_bytes()); // level
    buf.extend_from_slice(&0i32.to_le_bytes()); // field count
    buf
}

/// Rundown method payload (event 144).
pub fn method_record(
    module_id: i64,
    start_address: u64,
    size: i32,
    namespace: &str,
    name: &str,
    signature: &str,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&1i64.to_le_bytes()); // method id
    buf.extend_from_slice(&module_id.to_le_bytes());
    buf.extend_from_slice(&start_address.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&0i32.to_le_bytes()); // token
    buf.extend_from_slice(&0i32.to_le_bytes()); // flags
    buf.extend_from_slice(&utf16_nts(namespace));
    buf.extend_from_slice(&utf16_nts(name));
    buf.extend_from_slice(&utf16_nts(signature));
    buf
}

/// Rundown module payload (event 152).
pub fn module_record(module_id: i64, il_path: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&module_id.to_le_bytes());
    buf.extend_from_slice(&1i64.to_le_bytes()); // assembly id
    buf.extend_from_slice(&0i32.to_le_bytes()); // flags
    buf.extend_from_slice(&[0u8; 12]); // reserved
    buf.extend_from_slice(&utf16_nts(il_path));
    buf
}

/// Stack block payload: stacks get ids `first_id + index`.
pub fn stack_block(first_id: i32, stacks: &[&[u64]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&first_id.to_le_bytes());
    buf.extend_from_slice(&(stacks.len() as u32).to_le_bytes());
    for stack in stacks {
        buf.extend_from_slice(&((stack.len() * 8) as u32).to_le_bytes());
        for address in *stack {
            buf.extend_from_slice(&address.to_le_bytes());
        }
    }
    buf
}

pub fn sequence_point_block(timestamp: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // thread count
    buf
}
