//! Text rendering of profiling results: collapsed stacks and an indented
//! call-tree dump.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::profiler::SampleProfiler;

/// Aggregates every call-tree path across threads into collapsed-stack
/// form: `entry;caller;...;leaf <ticks>` keyed by the joined path. Paths
/// are returned in sorted order, so the output is stable for a given
/// input.
pub fn collapsed_stacks(profiler: &mut SampleProfiler) -> BTreeMap<String, i64> {
    let mut totals = BTreeMap::new();
    profiler.walk_paths(|_thread_id, path, sampled_time| {
        *totals.entry(path.join(";")).or_default() += sampled_time;
    });
    totals
}

/// Writes collapsed-stack lines, one `path value` pair per line.
pub fn write_collapsed<W: Write>(profiler: &mut SampleProfiler, w: &mut W) -> io::Result<()> {
    for (path, sampled_time) in collapsed_stacks(profiler) {
        writeln!(w, "{path} {sampled_time}")?;
    }
    Ok(())
}

/// Writes an indented per-thread call tree, one frame per line.
pub fn write_tree<W: Write>(profiler: &mut SampleProfiler, w: &mut W) -> io::Result<()> {
    let mut result = Ok(());
    profiler.walk(|frame| {
        if result.is_err() {
            return;
        }
        result = writeln!(
            w,
            "{}[{}] {}",
            "\t".repeat(frame.level),
            frame.sampled_time,
            frame.name
        );
    });
    result
}
