//! Output tee for spawned processes.
//!
//! Each captured stream is read by one task that forwards every chunk both
//! to the operator's terminal and into an accumulation buffer. Neither side
//! consumes from the other, so readiness scraping never starves or reorders
//! what the operator sees.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, warn};

/// Operator-facing destination for a captured stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// Mirror to the host's stdout.
    Stdout,
    /// Mirror to the host's stderr.
    Stderr,
    /// Capture only.
    Silent,
}

/// Accumulates everything a process has written so far.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    open_streams: Arc<watch::Sender<usize>>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// Empty buffer with no attached streams.
    #[must_use]
    pub fn new() -> Self {
        let (open_streams, _) = watch::channel(0);
        Self {
            bytes: Arc::new(Mutex::new(Vec::new())),
            open_streams: Arc::new(open_streams),
        }
    }

    /// All text decoded so far.
    ///
    /// A multi-byte character split across reads shows up as a replacement
    /// character until its remaining bytes arrive.
    #[must_use]
    pub fn text(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Number of bytes captured.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been captured yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a chunk.
    pub fn append(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    /// Wait until every attached stream reached end-of-file, or `limit`
    /// elapses. Returns `true` when all streams closed.
    pub async fn wait_closed(&self, limit: Duration) -> bool {
        let mut rx = self.open_streams.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|open| *open == 0))
            .await
            .is_ok_and(|res| res.is_ok())
    }

    /// Attach `reader` to this buffer, echoing each chunk to `echo`.
    pub fn tee<R>(&self, label: String, reader: R, echo: Echo) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.open_streams.send_modify(|open| *open += 1);
        let buffer = self.clone();

        tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, BytesCodec::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(chunk) => {
                        buffer.append(&chunk);
                        write_echo(echo, &chunk).await;
                    }
                    Err(err) => {
                        warn!(label, %err, "failed to read process output");
                        break;
                    }
                }
            }
            debug!(label, "process output stream closed");
            buffer
                .open_streams
                .send_modify(|open| *open = open.saturating_sub(1));
        })
    }
}

async fn write_echo(echo: Echo, chunk: &[u8]) {
    // Echo failures never affect capture.
    let _ = match echo {
        Echo::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(chunk).await {
                Ok(()) => out.flush().await,
                Err(err) => Err(err),
            }
        }
        Echo::Stderr => {
            let mut out = tokio::io::stderr();
            match out.write_all(chunk).await {
                Ok(()) => out.flush().await,
                Err(err) => Err(err),
            }
        }
        Echo::Silent => Ok(()),
    };
}
