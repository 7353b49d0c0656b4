//! Streaming decoder and CPU-time sample profiler for .NET EventPipe
//! (`.nettrace`) traces.
//!
//! The [`nettrace`] module decodes the FastSerialization container and its
//! inner blob blocks; the [`profiler`] module consumes decoded events and
//! accumulates sampled CPU time into per-thread call trees with resolved
//! managed method names. On Unix, the [`diag`] module can start a live
//! `CollectTracing` session against a running .NET process and hand its
//! output stream to the decoder.
//!
//! ```no_run
//! use sampletrace::nettrace::{Status, Stream};
//! use sampletrace::profiler::SampleProfiler;
//!
//! # fn main() -> sampletrace::Result<()> {
//! let file = std::fs::File::open("trace.nettrace")?;
//! let mut stream = Stream::new(std::io::BufReader::new(file));
//! let trace = stream.open()?;
//! let mut profiler = SampleProfiler::new(trace);
//! while stream.next(&mut profiler)? == Status::Ok {}
//! profiler.walk(|frame| println!("{}\t{}", frame.name, frame.sampled_time));
//! # Ok(())
//! # }
//! ```

mod error;
mod helpers;

pub mod nettrace;
pub mod profiler;
pub mod render;

#[cfg(unix)]
pub mod diag;

pub use error::{Error, Result};
