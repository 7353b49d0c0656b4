//! End-to-end tests: synthetic streams through the stream orchestrator into
//! the sample profiler.

mod common;

use common::*;

use sampletrace::nettrace::{Blob, BlobHeader, EventSink, Status, Stream, Trace};
use sampletrace::profiler::{SampleProfiler, SampleType, SAMPLE_PROFILER_PROVIDER};
use sampletrace::render;
use sampletrace::Error;

const RUNDOWN: &str = "Microsoft-Windows-DotNETRuntimeRundown";

fn run(bytes: Vec<u8>, sink: &mut dyn EventSink) -> sampletrace::Result<Trace> {
    let mut stream = Stream::new(bytes.as_slice());
    let trace = stream.open()?;
    while stream.next(sink)? == Status::Ok {}
    Ok(trace)
}

fn sample_payload(sample_type: SampleType) -> Vec<u8> {
    (sample_type as i32).to_le_bytes().to_vec()
}

/// Builds the pinned profiling scenario: one resolved method, one unknown
/// frame, two threads.
fn golden_stream() -> Vec<u8> {
    let mut metadata = Vec::new();
    metadata.extend(event_blob(0, 0, 0, 0, &metadata_record(1, SAMPLE_PROFILER_PROVIDER, 0)));
    metadata.extend(event_blob(0, 0, 0, 0, &metadata_record(2, RUNDOWN, 144)));
    metadata.extend(event_blob(0, 0, 0, 0, &metadata_record(3, RUNDOWN, 152)));

    let mut rundown = Vec::new();
    rundown.extend(event_blob(
        2,
        1,
        0,
        0,
        &method_record(10, 0x1000, 0x100, "App", "Main", "void (string[])"),
    ));
    rundown.extend(event_blob(3, 1, 0, 0, &module_record(10, "/app/App.dll")));

    let mut samples = Vec::new();
    for timestamp in [100i64, 200, 300] {
        samples.extend(event_blob(1, 100, 1, timestamp, &sample_payload(SampleType::Managed)));
    }
    for timestamp in [100i64, 250] {
        samples.extend(event_blob(1, 200, 2, timestamp, &sample_payload(SampleType::Managed)));
    }

    TraceBuilder::new()
        .trace(8, 0)
        .block("MetadataBlock", &blob_block(0, &metadata))
        .block("EventBlock", &blob_block(0, &rundown))
        .block("StackBlock", &stack_block(1, &[&[0x1010], &[0x1010, 0x9999]]))
        .block("EventBlock", &blob_block(0, &samples))
        .block("SPBlock", &sequence_point_block(300))
        .finish()
}

#[test]
fn golden_collapsed_output() {
    let mut profiler = {
        let bytes = golden_stream();
        let mut stream = Stream::new(bytes.as_slice());
        let trace = stream.open().unwrap();
        assert_eq!(trace.pointer_size, 8);
        let mut profiler = SampleProfiler::new(trace);
        while stream.next(&mut profiler).unwrap() == Status::Ok {}
        profiler
    };

    let mut out = Vec::new();
    render::write_collapsed(&mut profiler, &mut out).unwrap();
    let expected = "\
?!? 150
?!?;App!App.Main(string[]) 150
App!App.Main(string[]) 200
";
    assert_eq!(String::from_utf8(out).unwrap(), expected);
}

#[test]
fn golden_walk_is_deterministic() {
    let collect = || {
        let bytes = golden_stream();
        let mut stream = Stream::new(bytes.as_slice());
        let trace = stream.open().unwrap();
        let mut profiler = SampleProfiler::new(trace);
        while stream.next(&mut profiler).unwrap() == Status::Ok {}
        let mut frames = Vec::new();
        profiler.walk(|f| frames.push((f.thread_id, f.level, f.name, f.sampled_time)));
        frames
    };
    assert_eq!(collect(), collect());
}

#[derive(Default)]
struct Capture {
    headers: Vec<BlobHeader>,
    payloads: Vec<Vec<u8>>,
}

impl EventSink for Capture {
    fn event(&mut self, blob: &Blob<'_>) -> sampletrace::Result<()> {
        self.headers.push(blob.header);
        self.payloads.push(blob.payload.to_vec());
        Ok(())
    }
}

#[test]
fn compressed_headers_inherit_between_blobs() {
    let mut blobs = Vec::new();
    blobs.push(0b1000_1111u8); // metadata, capture+seq, thread, stack, payload size
    blobs.extend(varint(5)); // metadata id
    blobs.extend(varint(0)); // sequence number
    blobs.extend(varint(100)); // capture thread id
    blobs.extend(varint(0)); // capture proc
    blobs.extend(varint(100)); // thread id
    blobs.extend(varint(3)); // stack id
    blobs.extend(varint(700)); // timestamp delta
    blobs.extend(varint(4)); // payload size
    blobs.extend_from_slice(b"pay1");
    blobs.push(0x00); // second blob: everything inherited
    blobs.extend(varint(0)); // timestamp delta
    blobs.extend_from_slice(b"pay2");

    let bytes = TraceBuilder::new()
        .trace(8, 0)
        .block("EventBlock", &blob_block(1, &blobs))
        .finish();

    let mut capture = Capture::default();
    run(bytes, &mut capture).unwrap();

    assert_eq!(capture.headers.len(), 2);
    let (first, second) = (capture.headers[0], capture.headers[1]);
    assert_eq!(first.metadata_id, 5);
    assert_eq!(first.timestamp, 700);
    assert_eq!(second.metadata_id, first.metadata_id);
    assert_eq!(second.thread_id, first.thread_id);
    assert_eq!(second.stack_id, first.stack_id);
    assert_eq!(second.payload_size, first.payload_size);
    assert_eq!(second.activity_id, first.activity_id);
    assert_eq!(second.related_activity_id, first.related_activity_id);
    // Timestamp delta of zero keeps the inherited value; a non-zero
    // inherited metadata id increments the sequence number.
    assert_eq!(second.timestamp, first.timestamp);
    assert_eq!(second.sequence_number, first.sequence_number + 1);
    assert_eq!(capture.payloads, vec![b"pay1".to_vec(), b"pay2".to_vec()]);
}

#[test]
fn pointer_size_selects_stack_width() {
    // The same stack bytes, profiled under 4- and 8-byte pointers. Under
    // 4-byte pointers the single 8-byte stack splits into two frames.
    let samples = |ts: &[i64]| {
        let mut out = Vec::new();
        for &t in ts {
            out.extend(event_blob(1, 7, 1, t, &sample_payload(SampleType::Managed)));
        }
        out
    };
    let build = |pointer_size: u32| {
        let mut metadata = Vec::new();
        metadata.extend(event_blob(0, 0, 0, 0, &metadata_record(1, SAMPLE_PROFILER_PROVIDER, 0)));
        TraceBuilder::new()
            .trace(pointer_size, 0)
            .block("MetadataBlock", &blob_block(0, &metadata))
            .block("StackBlock", &stack_block(1, &[&[0x0000_2000_0000_1000]]))
            .block("EventBlock", &blob_block(0, &samples(&[100, 200])))
            .block("SPBlock", &sequence_point_block(200))
            .finish()
    };

    let bytes = build(8);
    let mut stream = Stream::new(bytes.as_slice());
    let trace = stream.open().unwrap();
    let mut wide = SampleProfiler::new(trace);
    while stream.next(&mut wide).unwrap() == Status::Ok {}
    let mut frames = Vec::new();
    wide.walk(|f| frames.push(f.addr));
    assert_eq!(frames, vec![0x0000_2000_0000_1000]);

    let bytes = build(4);
    let mut stream = Stream::new(bytes.as_slice());
    let trace = stream.open().unwrap();
    assert_eq!(trace.pointer_size, 4);
    let mut narrow = SampleProfiler::new(trace);
    while stream.next(&mut narrow).unwrap() == Status::Ok {}
    let mut frames = Vec::new();
    narrow.walk(|f| frames.push(f.addr));
    // Leaf-first storage: the high half is the entry point.
    assert_eq!(frames, vec![0x2000, 0x1000]);
}

struct NoSink;
impl EventSink for NoSink {}

#[test]
fn missing_metadata_aborts_stream() {
    let mut samples = Vec::new();
    samples.extend(event_blob(999, 7, 1, 100, &sample_payload(SampleType::Managed)));
    let bytes = TraceBuilder::new()
        .trace(8, 0)
        .block("EventBlock", &blob_block(0, &samples))
        .finish();

    let trace = Stream::new(bytes.as_slice()).open().unwrap();
    let mut profiler = SampleProfiler::new(trace);
    match run(bytes, &mut profiler) {
        Err(Error::MissingMetadata(999)) => {}
        other => panic!("expected missing metadata, got {other:?}"),
    }
}

#[test]
fn end_of_stream_is_idempotent() {
    let bytes = TraceBuilder::new().trace(8, 0).finish();
    let mut stream = Stream::new(bytes.as_slice());
    stream.open().unwrap();
    let mut sink = NoSink;
    assert_eq!(stream.next(&mut sink).unwrap(), Status::EndOfStream);
    assert_eq!(stream.next(&mut sink).unwrap(), Status::EndOfStream);
}

#[test]
fn invalid_signature_is_rejected() {
    let mut bytes = TraceBuilder::new().trace(8, 0).finish();
    bytes[0] = b'M';
    let mut stream = Stream::new(bytes.as_slice());
    assert!(matches!(stream.open(), Err(Error::InvalidSignature)));
}

#[test]
fn handler_errors_abort_the_stream() {
    struct Failing;
    impl EventSink for Failing {
        fn stack_block(
            &mut self,
            _block: &sampletrace::nettrace::StackBlock,
        ) -> sampletrace::Result<()> {
            Err(Error::handler("stack storage full"))
        }
    }

    let bytes = TraceBuilder::new()
        .trace(8, 0)
        .block("StackBlock", &stack_block(1, &[&[0x1000]]))
        .finish();
    assert!(matches!(run(bytes, &mut Failing), Err(Error::Handler(_))));
}
