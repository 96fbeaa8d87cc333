use crate::capped_buffer::CappedBuffer;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Chunks in flight per stream before the producer waits on the collector.
const CHANNEL_DEPTH: usize = 64;

/// Producer side of one run's output pipeline, handed to the sandbox manager.
pub struct OutputSinks {
    pub stdout: mpsc::Sender<Vec<u8>>,
    pub stderr: mpsc::Sender<Vec<u8>>,
    pub stop: oneshot::Sender<()>,
}

/// Captured output of one run.
#[derive(Debug)]
pub struct CapturedOutput {
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
}

impl CapturedOutput {
    pub fn truncated(&self) -> bool {
        self.stdout.truncated() || self.stderr.truncated()
    }
}

/// Single collector task draining both streams into capped buffers until it
/// is told to stop.
pub struct OutputCollector {
    handle: JoinHandle<CapturedOutput>,
}

impl OutputCollector {
    pub fn spawn(limit: usize) -> (Self, OutputSinks) {
        let (stdout_tx, stdout_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel();

        let handle = tokio::spawn(collect(limit, stdout_rx, stderr_rx, stop_rx));

        let sinks = OutputSinks {
            stdout: stdout_tx,
            stderr: stderr_tx,
            stop: stop_tx,
        };
        (Self { handle }, sinks)
    }

    /// Wait for the collector to exit and hand back its buffers. Must be
    /// called after the stop signal was sent (or the sinks were dropped).
    pub async fn finish(self, limit: usize) -> CapturedOutput {
        match self.handle.await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "Output collector task failed");
                CapturedOutput {
                    stdout: CappedBuffer::new(limit),
                    stderr: CappedBuffer::new(limit),
                }
            }
        }
    }
}

async fn collect(
    limit: usize,
    mut stdout_rx: mpsc::Receiver<Vec<u8>>,
    mut stderr_rx: mpsc::Receiver<Vec<u8>>,
    mut stop_rx: oneshot::Receiver<()>,
) -> CapturedOutput {
    let mut stdout = CappedBuffer::new(limit);
    let mut stderr = CappedBuffer::new(limit);
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            biased;
            chunk = stdout_rx.recv(), if stdout_open => match chunk {
                Some(chunk) => { stdout.write(&chunk); }
                None => stdout_open = false,
            },
            chunk = stderr_rx.recv(), if stderr_open => match chunk {
                Some(chunk) => { stderr.write(&chunk); }
                None => stderr_open = false,
            },
            // Fires on an explicit stop and when the stop sender is dropped.
            _ = &mut stop_rx => break,
        }
    }

    // Chunks sent before the stop signal belong to this run.
    while let Ok(chunk) = stdout_rx.try_recv() {
        stdout.write(&chunk);
    }
    while let Ok(chunk) = stderr_rx.try_recv() {
        stderr.write(&chunk);
    }

    CapturedOutput { stdout, stderr }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collects_until_stop() {
        let (collector, sinks) = OutputCollector::spawn(1024);
        sinks.stdout.send(b"hello ".to_vec()).await.unwrap();
        sinks.stderr.send(b"warn".to_vec()).await.unwrap();
        sinks.stdout.send(b"world".to_vec()).await.unwrap();
        sinks.stop.send(()).unwrap();

        let output = collector.finish(1024).await;
        assert_eq!(output.stdout.as_bytes(), b"hello world");
        assert_eq!(output.stderr.as_bytes(), b"warn");
        assert!(!output.truncated());
    }

    #[tokio::test]
    async fn test_applies_limit() {
        let (collector, sinks) = OutputCollector::spawn(4);
        sinks.stdout.send(b"0123456789".to_vec()).await.unwrap();
        sinks.stop.send(()).unwrap();

        let output = collector.finish(4).await;
        assert_eq!(output.stdout.as_bytes(), b"0123");
        assert!(output.truncated());
    }

    #[tokio::test]
    async fn test_dropped_sinks_end_collection() {
        let (collector, sinks) = OutputCollector::spawn(16);
        sinks.stdout.send(b"partial".to_vec()).await.unwrap();
        drop(sinks);

        let output = collector.finish(16).await;
        assert_eq!(output.stdout.as_bytes(), b"partial");
    }

    #[tokio::test]
    async fn test_producer_after_stop_does_not_block() {
        let (collector, sinks) = OutputCollector::spawn(16);
        let OutputSinks { stdout, stderr: _stderr, stop } = sinks;
        stop.send(()).unwrap();
        let _ = collector.finish(16).await;

        // The receiver is gone; sends fail fast instead of waiting.
        assert!(stdout.send(b"late".to_vec()).await.is_err());
    }
}
