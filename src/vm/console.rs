//! Emulator console watching.
//!
//! The emulator's serial console is the only readiness signal the harness
//! trusts: a boot is "ready" once a literal marker (`Shell>`, `login:`) has
//! been seen on it. [`ConsoleWatcher`] reads the stream, records everything
//! into a shared [`ConsoleLog`], and matches markers across chunk
//! boundaries. Once boot is done, [`ConsoleWatcher::drain`] keeps consuming
//! the stream in the background so the emulator never stalls on a full pipe.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SetupError;

const READ_CHUNK: usize = 4096;

/// Retained transcript size. Older output is discarded past this.
pub const TRANSCRIPT_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Default)]
struct Transcript {
    bytes: Vec<u8>,
    /// Bytes discarded from the front. Positions handed out are absolute.
    dropped: usize,
}

/// Shared, append-only transcript of everything the console printed.
///
/// Only the most recent [`TRANSCRIPT_LIMIT`] bytes (or the limit given to
/// [`ConsoleLog::with_limit`]) are kept.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    inner: Arc<RwLock<Transcript>>,
    limit: usize,
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::with_limit(TRANSCRIPT_LIMIT)
    }
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Transcript::default())),
            limit: limit.max(1),
        }
    }

    /// The retained transcript, decoded lossily.
    pub async fn text(&self) -> String {
        String::from_utf8_lossy(&self.inner.read().await.bytes).into_owned()
    }

    async fn append(&self, chunk: &[u8]) {
        let mut t = self.inner.write().await;
        t.bytes.extend_from_slice(chunk);
        if t.bytes.len() > self.limit {
            let excess = t.bytes.len() - self.limit;
            t.bytes.drain(..excess);
            t.dropped += excess;
        }
    }

    /// Search for `needle` starting at absolute position `from`.
    ///
    /// `Ok(end)` is the position just past the first match. `Err(next)` is
    /// where the following search should resume so that already scanned
    /// bytes are not scanned again, while a match straddling the end of the
    /// current data is still found.
    async fn find_from(&self, from: usize, needle: &[u8]) -> Result<usize, usize> {
        let t = self.inner.read().await;
        let end = t.dropped + t.bytes.len();
        let start = from.max(t.dropped);
        if needle.is_empty() {
            return Ok(start.min(end));
        }
        let haystack = t.bytes.get(start - t.dropped..).unwrap_or(&[]);
        match haystack.windows(needle.len()).position(|w| w == needle) {
            Some(pos) => Ok(start + pos + needle.len()),
            None => Err(end.saturating_sub(needle.len() - 1).max(start)),
        }
    }
}

/// Reads a console stream and blocks on readiness markers.
pub struct ConsoleWatcher<R> {
    reader: R,
    log: ConsoleLog,
    cursor: usize,
    echo: bool,
}

impl<R> ConsoleWatcher<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wrap `reader`. With `echo`, console output is also logged at `info`.
    pub fn new(reader: R, echo: bool) -> Self {
        Self::with_log(reader, ConsoleLog::new(), echo)
    }

    /// Wrap `reader`, appending into an existing transcript. Used to fold
    /// the emulator's stderr into the same log as its serial console.
    pub fn with_log(reader: R, log: ConsoleLog, echo: bool) -> Self {
        Self {
            reader,
            log,
            cursor: 0,
            echo,
        }
    }

    /// Handle to the transcript this watcher writes into.
    pub fn log(&self) -> ConsoleLog {
        self.log.clone()
    }

    /// Block until `marker` appears after the previous match, or fail once
    /// `timeout` elapses or the stream ends.
    pub async fn wait_for(&mut self, marker: &str, timeout: Duration) -> Result<(), SetupError> {
        debug!(marker, ?timeout, "Waiting for console marker");
        match tokio::time::timeout(timeout, self.read_until(marker)).await {
            Ok(Ok(())) => {
                info!(marker, "Console marker seen");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(marker, ?timeout, "Console marker not seen in time");
                Err(SetupError::ConsoleTimeout {
                    marker: marker.to_string(),
                    timeout,
                    transcript: self.log.text().await,
                })
            }
        }
    }

    async fn read_until(&mut self, marker: &str) -> Result<(), SetupError> {
        let needle = marker.as_bytes();
        let mut buf = [0u8; READ_CHUNK];
        let mut search = self.cursor;
        loop {
            match self.log.find_from(search, needle).await {
                Ok(end) => {
                    self.cursor = end;
                    return Ok(());
                }
                Err(next) => search = next,
            }
            let n = match self.reader.read(&mut buf).await {
                Ok(n) => n,
                Err(source) => {
                    return Err(SetupError::ConsoleRead {
                        source,
                        transcript: self.log.text().await,
                    });
                }
            };
            if n == 0 {
                return Err(SetupError::ConsoleClosed {
                    marker: marker.to_string(),
                    transcript: self.log.text().await,
                });
            }
            record(&self.log, &buf[..n], self.echo).await;
        }
    }

    /// Keep reading the console until EOF on a background task.
    pub fn drain(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match self.reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Console stream closed");
                        return;
                    }
                    Ok(n) => record(&self.log, &buf[..n], self.echo).await,
                    Err(e) => {
                        warn!(error = %e, "Console read error, stopping drain");
                        return;
                    }
                }
            }
        })
    }
}

async fn record(log: &ConsoleLog, chunk: &[u8], echo: bool) {
    let text = String::from_utf8_lossy(chunk);
    if echo {
        info!(target: "uefi_vmtest::console", "{}", text.trim_end());
    } else {
        trace!(target: "uefi_vmtest::console", "{}", text.trim_end());
    }
    log.append(chunk).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn marker_in_stream_returns_ok() {
        let console: &'static [u8] = b"BdsDxe: starting Boot0001\r\nUEFI Interactive Shell v2.2\r\nShell> ";
        let mut watcher = ConsoleWatcher::new(console, false);

        watcher
            .wait_for("Shell>", Duration::from_secs(5))
            .await
            .expect("marker present");
        assert!(watcher.log().text().await.contains("UEFI Interactive Shell"));
    }

    #[tokio::test]
    async fn marker_split_across_chunks_is_found() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut watcher = ConsoleWatcher::new(rx, false);

        let writer = tokio::spawn(async move {
            tx.write_all(b"Welcome\r\nvm log").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(b"in: ").await.unwrap();
            tx
        });

        watcher.wait_for("login:", Duration::from_secs(5)).await.unwrap();
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn silent_console_times_out_with_transcript() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"PXE-E18: Server response timeout.").await.unwrap();
        let mut watcher = ConsoleWatcher::new(rx, false);

        let err = watcher
            .wait_for("Shell>", Duration::from_millis(100))
            .await
            .unwrap_err();

        match err {
            SetupError::ConsoleTimeout { marker, transcript, .. } => {
                assert_eq!(marker, "Shell>");
                assert!(transcript.contains("PXE-E18"));
            }
            other => panic!("expected ConsoleTimeout, got {other:?}"),
        }
        drop(tx);
    }

    #[tokio::test]
    async fn closed_console_is_not_a_hang() {
        let console: &'static [u8] = b"Kernel panic - not syncing";
        let mut watcher = ConsoleWatcher::new(console, false);

        let err = watcher
            .wait_for("login:", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::ConsoleClosed { .. }));
        assert_eq!(err.transcript(), Some("Kernel panic - not syncing"));
    }

    #[tokio::test]
    async fn successive_waits_do_not_rematch_old_output() {
        let console: &'static [u8] = b"login: \r\nlogin: ";
        let mut watcher = ConsoleWatcher::new(console, false);

        watcher.wait_for("login:", Duration::from_secs(1)).await.unwrap();
        watcher.wait_for("login:", Duration::from_secs(1)).await.unwrap();
        let third = watcher.wait_for("login:", Duration::from_secs(1)).await;
        assert!(third.is_err());
    }

    #[tokio::test]
    async fn incremental_scan_finds_marker_straddling_many_chunks() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let mut watcher = ConsoleWatcher::new(rx, false);

        let writer = tokio::spawn(async move {
            for chunk in [&b"noise "[..], b"Sh", b"e", b"ll", b"> "] {
                tx.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tx
        });

        watcher.wait_for("Shell>", Duration::from_secs(5)).await.unwrap();
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn transcript_keeps_only_the_tail() {
        let log = ConsoleLog::with_limit(8);
        log.append(b"0123456789").await;
        log.append(b"ab").await;

        assert_eq!(log.text().await, "456789ab");
        // Positions stay absolute across the discarded prefix.
        assert_eq!(log.find_from(0, b"89").await, Ok(10));
        assert_eq!(log.find_from(0, b"zz").await, Err(11));
    }

    #[tokio::test]
    async fn drain_keeps_recording_after_readiness() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut watcher = ConsoleWatcher::new(rx, false);
        let log = watcher.log();

        tx.write_all(b"Shell> ").await.unwrap();
        watcher.wait_for("Shell>", Duration::from_secs(1)).await.unwrap();

        let task = watcher.drain();
        tx.write_all(b"reset -s\r\n").await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(log.text().await, "Shell> reset -s\r\n");
    }
}
