//! Consumes decoded EventPipe events and accumulates sampled CPU time into
//! per-thread call trees with resolved managed method names.

mod symbols;
mod thread;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::Cursor;

use binrw::BinReaderExt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};
use crate::nettrace::{Blob, EventSink, Metadata, SequencePointBlock, Stack, StackBlock, Trace};

pub use symbols::{MethodRecord, ModuleRecord};

use symbols::{Symbols, UNKNOWN_FRAME};
use thread::{CallTree, Thread};

pub const SAMPLE_PROFILER_PROVIDER: &str = "Microsoft-DotNETCore-SampleProfiler";
pub const RUNDOWN_PROVIDER: &str = "Microsoft-Windows-DotNETRuntimeRundown";

/// Keywords and level the sample profiler provider has to be enabled with
/// for the runtime to emit thread samples.
pub const SAMPLE_PROFILER_KEYWORDS: u64 = 0x0000_F000_0000_0000;
pub const SAMPLE_PROFILER_LEVEL: u32 = 4;

const THREAD_SAMPLE_EVENT: i32 = 0;
const METHOD_RUNDOWN_EVENT: i32 = 144;
const MODULE_RUNDOWN_EVENT: i32 = 152;

/// Classification carried in the thread sample event payload.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum SampleType {
    /// The sampler failed to capture the thread.
    Error = 0,
    /// The thread was executing outside managed code.
    External = 1,
    /// The thread was running managed code.
    Managed = 2,
}

// Ordered by timestamp; the remaining fields only break ties so that the
// drain order is fully deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Sample {
    timestamp: i64,
    relative_time: i64,
    thread_id: i64,
    stack_id: i32,
    sample_type: SampleType,
}

/// One emitted frame of a call-tree walk.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub thread_id: i64,
    pub level: usize,
    /// Accumulated sample time in QPC ticks.
    pub sampled_time: i64,
    pub addr: u64,
    pub name: String,
}

/// Builds per-thread CPU-time call trees from the sample profiler and
/// rundown events of a trace. Samples are buffered in a timestamp-ordered
/// heap and drained at every sequence point; stack ids are only valid
/// within the sequence-point window that produced them, so the stack cache
/// is discarded along with the drained samples. Symbols and call trees
/// persist for the life of the profiler.
pub struct SampleProfiler {
    trace: Trace,
    symbols: Symbols,
    metadata: HashMap<i32, Metadata>,
    stacks: HashMap<i32, Vec<u64>>,
    threads: HashMap<i64, Thread>,
    samples: BinaryHeap<Reverse<Sample>>,
}

impl SampleProfiler {
    pub fn new(trace: Trace) -> Self {
        SampleProfiler {
            trace,
            symbols: Symbols::default(),
            metadata: HashMap::new(),
            stacks: HashMap::new(),
            threads: HashMap::new(),
            samples: BinaryHeap::new(),
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Walks every thread's call tree in thread-id order. See
    /// [`walk_thread`] for the level convention.
    ///
    /// [`walk_thread`]: SampleProfiler::walk_thread
    pub fn walk(&mut self, mut f: impl FnMut(FrameInfo)) {
        for thread_id in self.thread_ids() {
            self.walk_thread(thread_id, &mut f);
        }
    }

    /// Pre-order walk of one thread's call tree with resolved frame names.
    /// Levels follow the legacy numbering of [`CallTree::walk`]: the first
    /// root child reports level 0, later root children report their index
    /// minus one.
    pub fn walk_thread(&mut self, thread_id: i64, mut f: impl FnMut(FrameInfo)) {
        let Some(thread) = self.threads.get(&thread_id) else {
            return;
        };
        let symbols = &mut self.symbols;
        thread.tree.walk(&mut |level, frame| {
            let name = match symbols.resolve_address(frame.addr) {
                Some(start) => symbols.resolve_string(start),
                None => UNKNOWN_FRAME.to_string(),
            };
            f(FrameInfo {
                thread_id,
                level,
                sampled_time: frame.sampled_time,
                addr: frame.addr,
                name,
            });
        });
    }

    /// Depth-first walk yielding the full resolved frame path of every tree
    /// node, entry point first. Unlike [`walk`], depth is implied by the
    /// path itself, which makes this the traversal of choice for collapsed
    /// stacks.
    ///
    /// [`walk`]: SampleProfiler::walk
    pub fn walk_paths(&mut self, mut f: impl FnMut(i64, &[String], i64)) {
        for thread_id in self.thread_ids() {
            let Some(thread) = self.threads.get(&thread_id) else {
                continue;
            };
            let symbols = &mut self.symbols;
            let mut path = Vec::new();
            visit_paths(&thread.tree, symbols, &mut path, thread_id, &mut f);
        }
    }

    fn thread_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.threads.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn add_sample(&mut self, blob: &Blob<'_>) -> Result<()> {
        let raw: i32 = Cursor::new(blob.payload).read_le()?;
        // Unknown classifications are ignored the same way sampler errors
        // are.
        let sample_type = SampleType::from_i32(raw).unwrap_or(SampleType::Error);
        self.samples.push(Reverse(Sample {
            timestamp: blob.header.timestamp,
            relative_time: blob.header.timestamp - self.trace.sync_time_qpc,
            thread_id: blob.header.thread_id,
            stack_id: blob.header.stack_id,
            sample_type,
        }));
        Ok(())
    }

    fn add_stack(&mut self, stack: &Stack) {
        let pointers = if self.trace.pointer_size == 8 {
            stack.instruction_pointers_64()
        } else {
            stack.instruction_pointers_32()
        };
        self.stacks.insert(stack.id, pointers);
    }
}

fn visit_paths(
    tree: &CallTree,
    symbols: &mut Symbols,
    path: &mut Vec<String>,
    thread_id: i64,
    f: &mut impl FnMut(i64, &[String], i64),
) {
    for frame in &tree.frames {
        let name = match symbols.resolve_address(frame.addr) {
            Some(start) => symbols.resolve_string(start),
            None => UNKNOWN_FRAME.to_string(),
        };
        path.push(name);
        f(thread_id, path, frame.sampled_time);
        visit_paths(&frame.children, symbols, path, thread_id, f);
        path.pop();
    }
}

impl EventSink for SampleProfiler {
    fn event(&mut self, blob: &Blob<'_>) -> Result<()> {
        let (is_sample, is_method, is_module) = {
            let Some(metadata) = self.metadata.get(&blob.header.metadata_id) else {
                return Err(Error::MissingMetadata(blob.header.metadata_id));
            };
            let provider = metadata.header.provider_name.as_str();
            let event_id = metadata.header.event_id;
            (
                provider == SAMPLE_PROFILER_PROVIDER && event_id == THREAD_SAMPLE_EVENT,
                provider == RUNDOWN_PROVIDER && event_id == METHOD_RUNDOWN_EVENT,
                provider == RUNDOWN_PROVIDER && event_id == MODULE_RUNDOWN_EVENT,
            )
        };
        if is_sample {
            self.add_sample(blob)
        } else if is_method {
            self.symbols.add_method(blob)
        } else if is_module {
            self.symbols.add_module(blob)
        } else {
            Ok(())
        }
    }

    fn metadata(&mut self, metadata: &Metadata) -> Result<()> {
        self.metadata
            .insert(metadata.header.metadata_id, metadata.clone());
        Ok(())
    }

    fn stack_block(&mut self, block: &StackBlock) -> Result<()> {
        for stack in &block.stacks {
            self.add_stack(stack);
        }
        Ok(())
    }

    fn sequence_point_block(&mut self, _block: &SequencePointBlock) -> Result<()> {
        log::debug!(
            "sequence point: draining {} samples over {} stacks",
            self.samples.len(),
            self.stacks.len()
        );
        while let Some(Reverse(sample)) = self.samples.pop() {
            let stack = self
                .stacks
                .get(&sample.stack_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            self.threads
                .entry(sample.thread_id)
                .or_default()
                .add_sample(sample.sample_type, sample.relative_time, stack);
        }
        self.stacks.clear();
        Ok(())
    }
}
