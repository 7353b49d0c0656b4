//! Minimal diagnostics IPC client. Discovers the diagnostic socket a .NET
//! runtime listens on and starts an EventPipe `CollectTracing` session; the
//! session stream is a `.nettrace` byte stream that feeds straight into
//! [`crate::nettrace::Stream`].

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::profiler::{SAMPLE_PROFILER_KEYWORDS, SAMPLE_PROFILER_LEVEL, SAMPLE_PROFILER_PROVIDER};

const IPC_MAGIC: &[u8; 14] = b"DOTNET_IPC_V1\0";
const IPC_HEADER_LEN: usize = 20;

const COMMAND_SET_EVENTPIPE: u8 = 0x02;
const COMMAND_STOP_TRACING: u8 = 0x01;
const COMMAND_COLLECT_TRACING: u8 = 0x02;
const COMMAND_SET_SERVER: u8 = 0xff;
const COMMAND_SERVER_ERROR: u8 = 0xff;

const NETTRACE_FORMAT: u32 = 1;

/// One provider to enable in a tracing session.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider_name: String,
    pub keywords: u64,
    pub log_level: u32,
}

impl ProviderConfig {
    /// The provider the sample profiler requires.
    pub fn sample_profiler() -> Self {
        ProviderConfig {
            provider_name: SAMPLE_PROFILER_PROVIDER.to_string(),
            keywords: SAMPLE_PROFILER_KEYWORDS,
            log_level: SAMPLE_PROFILER_LEVEL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectTracingConfig {
    pub circular_buffer_size_mb: u32,
    pub providers: Vec<ProviderConfig>,
}

/// Locates the diagnostic socket of a running process: the lexicographically
/// largest `dotnet-diagnostic-{pid}-*-socket` entry in the temp directory.
pub fn default_server_address(pid: u32) -> Option<PathBuf> {
    let tmp = std::env::temp_dir();
    let prefix = format!("dotnet-diagnostic-{pid}-");
    let mut candidates: Vec<PathBuf> = fs::read_dir(&tmp)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .filter(|name| {
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with("-socket")
        })
        .map(|name| tmp.join(name))
        .collect();
    candidates.sort();
    candidates.pop()
}

/// A live `CollectTracing` session. Reading from it yields the nettrace
/// stream; [`stop`] asks the runtime to end the session, after which the
/// runtime flushes its rundown events and closes the stream.
///
/// [`stop`]: Session::stop
pub struct Session {
    stream: UnixStream,
    session_id: u64,
    address: PathBuf,
}

impl Session {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Sends `StopTracing` for this session over a fresh connection. The
    /// session stream stays readable until the runtime finishes the rundown
    /// and closes it.
    pub fn stop(&self) -> Result<()> {
        let mut control = UnixStream::connect(&self.address).map_err(crate::Error::from)?;
        let payload = self.session_id.to_le_bytes();
        write_message(&mut control, COMMAND_STOP_TRACING, &payload)?;
        read_response(&mut control)?;
        Ok(())
    }
}

impl Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

/// Connects to a diagnostic socket and starts tracing with the given
/// configuration.
pub fn collect_tracing(address: impl AsRef<Path>, config: &CollectTracingConfig) -> Result<Session> {
    let address = address.as_ref().to_path_buf();
    let mut stream = UnixStream::connect(&address).map_err(crate::Error::from)?;

    let mut payload = Vec::new();
    payload.extend_from_slice(&config.circular_buffer_size_mb.to_le_bytes());
    payload.extend_from_slice(&NETTRACE_FORMAT.to_le_bytes());
    payload.extend_from_slice(&(config.providers.len() as u32).to_le_bytes());
    for provider in &config.providers {
        payload.extend_from_slice(&provider.keywords.to_le_bytes());
        payload.extend_from_slice(&provider.log_level.to_le_bytes());
        write_ipc_string(&mut payload, &provider.provider_name);
        write_ipc_string(&mut payload, ""); // filter data
    }
    write_message(&mut stream, COMMAND_COLLECT_TRACING, &payload)?;

    read_response(&mut stream)?;
    let mut id = [0u8; 8];
    stream.read_exact(&mut id).map_err(crate::Error::from)?;
    let session_id = u64::from_le_bytes(id);
    log::debug!("tracing session {session_id} started on {}", address.display());

    Ok(Session {
        stream,
        session_id,
        address,
    })
}

fn write_message(stream: &mut UnixStream, command: u8, payload: &[u8]) -> Result<()> {
    let mut message = Vec::with_capacity(IPC_HEADER_LEN + payload.len());
    message.extend_from_slice(IPC_MAGIC);
    message.extend_from_slice(&((IPC_HEADER_LEN + payload.len()) as u16).to_le_bytes());
    message.push(COMMAND_SET_EVENTPIPE);
    message.push(command);
    message.extend_from_slice(&0u16.to_le_bytes()); // reserved
    message.extend_from_slice(payload);
    stream.write_all(&message).map_err(crate::Error::from)
}

// IPC strings are length-prefixed UTF-16 with a terminating NUL included in
// the character count.
fn write_ipc_string(buf: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().chain(std::iter::once(0)).collect();
    buf.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

fn read_response(stream: &mut UnixStream) -> Result<()> {
    let mut header = [0u8; IPC_HEADER_LEN];
    stream.read_exact(&mut header).map_err(crate::Error::from)?;
    if &header[..14] != IPC_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "diagnostics IPC response carries a bad magic",
        )
        .into());
    }
    let command_set = header[16];
    let command_id = header[17];
    if command_set == COMMAND_SET_SERVER && command_id == COMMAND_SERVER_ERROR {
        let mut code = [0u8; 4];
        stream.read_exact(&mut code).map_err(crate::Error::from)?;
        let hresult = u32::from_le_bytes(code);
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("diagnostics IPC error 0x{hresult:08x}"),
        )
        .into());
    }
    Ok(())
}
