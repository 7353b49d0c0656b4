use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use sampletrace::nettrace::{Status, Stream};
use sampletrace::profiler::SampleProfiler;
use sampletrace::render;

#[derive(Parser, Debug)]
#[command(
    name = "dotnet-stacks",
    about = "Collapsed CPU stacks from .NET EventPipe traces"
)]
struct Opt {
    /// Path to a captured .nettrace file.
    #[arg(long, conflicts_with = "pid")]
    input: Option<PathBuf>,

    /// Process id to attach to via the diagnostics socket.
    #[arg(long)]
    pid: Option<u32>,

    /// Collection duration in seconds when attaching to a process.
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Print an indented call tree instead of collapsed stacks.
    #[arg(long)]
    tree: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();
    match (&opt.input, opt.pid) {
        (Some(path), _) => {
            let file =
                File::open(path).with_context(|| format!("opening {}", path.display()))?;
            profile(BufReader::new(file), &opt)
        }
        (None, Some(pid)) => attach(pid, &opt),
        (None, None) => bail!("either --input or --pid is required"),
    }
}

fn profile<R: Read>(source: R, opt: &Opt) -> anyhow::Result<()> {
    let mut stream = Stream::new(source);
    let trace = stream.open().context("opening trace stream")?;
    log::debug!("trace header: {trace:?}");

    let mut profiler = SampleProfiler::new(trace);
    while stream.next(&mut profiler)? == Status::Ok {}

    let stdout = io::stdout().lock();
    let mut out = io::BufWriter::new(stdout);
    if opt.tree {
        render::write_tree(&mut profiler, &mut out)?;
    } else {
        render::write_collapsed(&mut profiler, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(unix)]
fn attach(pid: u32, opt: &Opt) -> anyhow::Result<()> {
    use std::time::{Duration, Instant};

    use sampletrace::diag;

    let address = diag::default_server_address(pid)
        .with_context(|| format!("no diagnostic socket found for pid {pid}"))?;
    log::info!("attaching to {}", address.display());

    let config = diag::CollectTracingConfig {
        circular_buffer_size_mb: 10,
        providers: vec![diag::ProviderConfig::sample_profiler()],
    };
    let mut session = diag::collect_tracing(&address, &config)?;
    session.set_read_timeout(Some(Duration::from_millis(200)))?;

    // Buffer the stream for the requested duration, then ask the runtime to
    // stop and keep reading: the rundown events needed for symbolication
    // arrive between the stop command and the end of the stream.
    let deadline = Instant::now() + Duration::from_secs(opt.duration);
    let mut stopped = false;
    let mut captured = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        if !stopped && Instant::now() >= deadline {
            session.stop()?;
            stopped = true;
        }
        match session.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => captured.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => return Err(e).context("reading session stream"),
        }
    }
    log::info!("captured {} bytes", captured.len());

    profile(io::Cursor::new(captured), opt)
}

#[cfg(not(unix))]
fn attach(_pid: u32, _opt: &Opt) -> anyhow::Result<()> {
    bail!("attaching requires a Unix diagnostics socket; decode a capture with --input instead")
}
