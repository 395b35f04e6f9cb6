/// Bounded output capture
///
/// One reader thread per stream. Bytes beyond the per-stream budget are read
/// and discarded so the confined writer never blocks on a full pipe.
use crossbeam_channel::{bounded, Receiver};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const CHUNK_SIZE: usize = 4096;

/// Marker line appended to a stream that exceeded its budget
pub fn truncation_marker(discarded: u64, limit: usize) -> String {
    format!(
        "\n[codebox: output truncated, {} bytes over the {} byte limit discarded]\n",
        discarded, limit
    )
}

/// Captured content of one stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub data: Vec<u8>,
    pub truncated: bool,
    /// Everything the process wrote, kept or not
    pub total_bytes: u64,
}

impl CapturedStream {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Default)]
struct CaptureBuffer {
    data: Vec<u8>,
    total_bytes: u64,
    read_error: Option<String>,
}

/// In-flight capture of a single stream
pub struct StreamCollector {
    name: &'static str,
    limit: usize,
    buffer: Arc<Mutex<CaptureBuffer>>,
    done: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamCollector {
    /// Start draining `stream` on a dedicated thread
    pub fn spawn<R: Read + Send + 'static>(name: &'static str, stream: R, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let (done_tx, done) = bounded(1);
        let shared = Arc::clone(&buffer);

        let handle = thread::Builder::new()
            .name(format!("codebox-{}", name))
            .spawn(move || {
                drain(stream, limit, &shared);
                let _ = done_tx.send(());
            })
            .map_err(|e| log::error!("Failed to spawn {} collector: {}", name, e))
            .ok();

        Self {
            name,
            limit,
            buffer,
            done,
            handle,
        }
    }

    /// Collector for a stream the provider did not expose
    pub fn empty(name: &'static str) -> Self {
        let (done_tx, done) = bounded(1);
        let _ = done_tx.send(());
        Self {
            name,
            limit: 0,
            buffer: Arc::new(Mutex::new(CaptureBuffer::default())),
            done,
            handle: None,
        }
    }

    /// Wait up to `timeout` for EOF, then snapshot what was captured.
    /// A stream still open at the timeout is returned as truncated.
    pub fn finish(mut self, timeout: Duration) -> CapturedStream {
        let completed = match self.handle {
            Some(_) => self.done.recv_timeout(timeout).is_ok(),
            None => true,
        };

        if completed {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        } else {
            log::warn!(
                "{} still open {:?} after process exit; detaching collector",
                self.name,
                timeout
            );
        }

        let buffer = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(err) = &buffer.read_error {
            log::warn!("{} read error: {}", self.name, err);
        }

        let kept = buffer.data.len() as u64;
        let overflow = buffer.total_bytes.saturating_sub(kept);
        let mut captured = CapturedStream {
            data: buffer.data.clone(),
            truncated: overflow > 0 || !completed,
            total_bytes: buffer.total_bytes,
        };
        if overflow > 0 {
            captured
                .data
                .extend_from_slice(truncation_marker(overflow, self.limit).as_bytes());
        }
        captured
    }
}

fn drain<R: Read>(mut stream: R, limit: usize, buffer: &Mutex<CaptureBuffer>) {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let mut guard = match buffer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.total_bytes += n as u64;
                let room = limit.saturating_sub(guard.data.len());
                if room > 0 {
                    let keep = room.min(n);
                    guard.data.extend_from_slice(&chunk[..keep]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if let Ok(mut guard) = buffer.lock() {
                    guard.read_error = Some(e.to_string());
                }
                break;
            }
        }
    }
}

/// Finish both collectors sharing one overall budget
pub fn finish_pair(
    stdout: StreamCollector,
    stderr: StreamCollector,
    timeout: Duration,
) -> (CapturedStream, CapturedStream) {
    let start = Instant::now();
    let out = stdout.finish(timeout);
    let remaining = timeout.saturating_sub(start.elapsed());
    let err = stderr.finish(remaining);
    (out, err)
}
