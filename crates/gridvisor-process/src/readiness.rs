//! Readiness detection on child output
//!
//! A detector drains one output stream line by line, forwards every line to an
//! optional collector and fires a one-shot readiness signal the first time a
//! line contains the trigger. Streams are drained to the end even after the
//! trigger fired so the child never blocks on a full pipe.
//!
//! The end of a stream says nothing about the process: a child may close its
//! stdout and keep running, or exit while a grandchild still holds the pipe.
//! Callers race [`Readiness::wait`] against the child's own exit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ProcessError, Result};

/// Longest line handed out in one piece; longer runs are split
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Callback receiving one output line at a time, in receipt order
pub type LineCollector = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug)]
enum Outcome {
    Triggered,
    StreamClosed,
}

/// Scans a line stream for a trigger substring
#[derive(Clone)]
pub struct ReadinessDetector {
    trigger: String,
    collector: Option<LineCollector>,
    label: &'static str,
}

impl fmt::Debug for ReadinessDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessDetector")
            .field("trigger", &self.trigger)
            .field("collector", &self.collector.is_some())
            .field("label", &self.label)
            .finish()
    }
}

impl ReadinessDetector {
    /// Detector for `trigger`; an empty trigger means "ready at once"
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            collector: None,
            label: "stdout",
        }
    }

    /// Plain line forwarder without a trigger, e.g. for stderr
    pub fn forwarder(label: &'static str) -> Self {
        Self {
            trigger: String::new(),
            collector: None,
            label,
        }
    }

    /// Forward every line to `collector`
    pub fn with_collector(mut self, collector: Option<LineCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Whether `line` completes readiness
    pub fn matches(&self, line: &str) -> bool {
        !self.trigger.is_empty() && line.contains(&self.trigger)
    }

    /// Start draining `reader` on a background task
    pub fn spawn<R>(self, reader: R) -> Readiness
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.trigger.is_empty() {
            let task = tokio::spawn(self.drain(reader, None));
            return Readiness {
                rx: None,
                settled: Some(true),
                task,
            };
        }

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(self.drain(reader, Some(tx)));
        Readiness {
            rx: Some(rx),
            settled: None,
            task,
        }
    }

    async fn drain<R>(self, reader: R, mut signal: Option<oneshot::Sender<Outcome>>)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match (&mut reader)
                .take(MAX_LINE_BYTES)
                .read_until(b'\n', &mut buf)
                .await
            {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(stream = self.label, error = %e, "Output stream read failed");
                    break;
                }
            }

            let line = decode_line(&buf);
            match self.collector {
                Some(ref collector) => collector(&line),
                None => trace!(stream = self.label, line = %line, "Child output"),
            }

            if self.matches(&line) {
                if let Some(tx) = signal.take() {
                    debug!(trigger = %self.trigger, "Readiness trigger seen");
                    let _ = tx.send(Outcome::Triggered);
                }
            }
        }

        if let Some(tx) = signal.take() {
            let _ = tx.send(Outcome::StreamClosed);
        }
        debug!(stream = self.label, "Output stream closed");
    }
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// One-shot readiness signal for a single spawn
#[derive(Debug)]
pub struct Readiness {
    rx: Option<oneshot::Receiver<Outcome>>,
    /// `Some(true)` once the trigger was seen, `Some(false)` once the stream
    /// ended without it
    settled: Option<bool>,
    task: JoinHandle<()>,
}

impl Readiness {
    /// Whether readiness was granted immediately (no trigger configured)
    pub fn is_immediate(&self) -> bool {
        self.rx.is_none() && self.settled == Some(true)
    }

    /// Resolves with whether the trigger was seen, once the detector knows.
    /// Safe to call again after being cancelled mid-wait.
    async fn settle(&mut self) -> bool {
        if let Some(seen) = self.settled {
            return seen;
        }
        let seen = match self.rx.as_mut() {
            Some(rx) => matches!(rx.await, Ok(Outcome::Triggered)),
            None => false,
        };
        self.rx = None;
        self.settled = Some(seen);
        seen
    }

    /// Suspend until the trigger is seen, `timeout` elapses or `cancel`
    /// fires.
    ///
    /// A stream that ends without the trigger does not fail the wait; the
    /// process may still be alive. Race this against the child's exit.
    pub async fn wait(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let triggered = async {
            if !self.settle().await {
                debug!("Output closed before the trigger, waiting on the process");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
            outcome = tokio::time::timeout(timeout, triggered) => {
                outcome.map_err(|_| ProcessError::StartupTimeout {
                    millis: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Whether the trigger turns up within `grace`.
    ///
    /// Used after the child exited: output written just before the exit may
    /// still be in flight.
    pub async fn seen_within(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.settle())
            .await
            .unwrap_or(false)
    }

    /// Wait for the underlying stream to be fully drained
    pub async fn drained(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting() -> (LineCollector, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let collector: LineCollector = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });
        (collector, lines)
    }

    #[test]
    fn test_empty_trigger_never_matches() {
        let detector = ReadinessDetector::new("");
        assert!(!detector.matches("anything"));
        assert!(ReadinessDetector::new("READY").matches("node READY now"));
    }

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"tail"), "tail");
    }

    #[tokio::test]
    async fn test_trigger_fires_once_and_forwards_all_lines() {
        let (collector, lines) = collecting();
        let input: &[u8] = b"NOTYET\nREADY\nREADY again\n";

        let mut readiness = ReadinessDetector::new("READY")
            .with_collector(Some(collector))
            .spawn(input);
        assert!(!readiness.is_immediate());

        let cancel = CancellationToken::new();
        assert!(readiness.wait(Duration::from_secs(5), &cancel).await.is_ok());

        // The drain task keeps consuming the tail after the signal fired
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["NOTYET".to_string(), "READY".to_string(), "READY again".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stream_closed_before_trigger_keeps_waiting() {
        let input: &[u8] = b"starting\nbye\n";
        let mut readiness = ReadinessDetector::new("READY").spawn(input);

        let cancel = CancellationToken::new();
        let result = readiness.wait(Duration::from_millis(100), &cancel).await;
        assert!(matches!(
            result,
            Err(ProcessError::StartupTimeout { millis: 100 })
        ));
        assert!(!readiness.seen_within(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_seen_within_after_interrupted_wait() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut readiness = ReadinessDetector::new("READY").spawn(reader);

        let cancel = CancellationToken::new();
        let result = readiness.wait(Duration::from_millis(20), &cancel).await;
        assert!(matches!(result, Err(ProcessError::StartupTimeout { .. })));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"READY\n")
            .await
            .unwrap();
        assert!(readiness.seen_within(Duration::from_secs(5)).await);
        assert!(readiness.wait(Duration::from_millis(20), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let (collector, lines) = collecting();
        let mut input = vec![b'x'; 3 * MAX_LINE_BYTES as usize + 10];
        input.extend_from_slice(b"\nREADY\n");

        let mut readiness = ReadinessDetector::new("READY")
            .with_collector(Some(collector))
            .spawn(std::io::Cursor::new(input));

        let cancel = CancellationToken::new();
        assert!(readiness.wait(Duration::from_secs(5), &cancel).await.is_ok());

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 5);
        assert!(lines
            .iter()
            .all(|line| line.len() <= MAX_LINE_BYTES as usize));
        assert_eq!(lines[4], "READY");
    }

    #[tokio::test]
    async fn test_no_trigger_is_immediate() {
        let (collector, lines) = collecting();
        let input: &[u8] = b"a\nb\n";
        let readiness = ReadinessDetector::new("")
            .with_collector(Some(collector))
            .spawn(input);
        assert!(readiness.is_immediate());
        readiness.drained().await;
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_when_trigger_missing() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut readiness = ReadinessDetector::new("READY").spawn(reader);

        let cancel = CancellationToken::new();
        let result = readiness.wait(Duration::from_millis(50), &cancel).await;
        assert!(matches!(
            result,
            Err(ProcessError::StartupTimeout { millis: 50 })
        ));
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut readiness = ReadinessDetector::new("READY").spawn(reader);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = readiness.wait(Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(ProcessError::Cancelled)));
    }
}
