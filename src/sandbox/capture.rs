use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 8192;

/// Bytes captured from one output stream, bounded by a byte limit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// True when the stream produced more than the limit
    pub truncated: bool,
    /// Everything the stream produced, kept or not
    pub total_bytes: u64,
}

impl Captured {
    fn push(&mut self, data: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let kept = room.min(data.len());
        self.bytes.extend_from_slice(&data[..kept]);
        self.truncated |= kept < data.len();
        self.total_bytes += data.len() as u64;
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Drains a stream in the background, keeping at most `limit` bytes.
///
/// The stream is read to the end even past the limit so the writer never blocks
/// on a full pipe; excess bytes are discarded.
pub(super) struct Capture {
    buffer: Arc<Mutex<Captured>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    pub(super) fn spawn<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let task = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; CHUNK_SIZE];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => buffer.lock().push(&chunk[..n], limit),
                        Err(e) => {
                            log::debug!("Output stream closed with error: {e}");
                            break;
                        }
                    }
                }
            })
        });

        Self { buffer, task }
    }

    /// Waits up to `grace` for the stream to reach its end, then returns what was
    /// captured so far
    pub(super) async fn finish(mut self, grace: Duration) -> Captured {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                log::warn!("Output stream still open after teardown, abandoning it");
                task.abort();
            }
        }
        std::mem::take(&mut *self.buffer.lock())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_capture_within_limit() {
        let capture = Capture::spawn(Some(&b"hello\n"[..]), 64);
        let captured = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(captured.to_string_lossy(), "hello\n");
        assert!(!captured.truncated);
        assert_eq!(captured.total_bytes, 6);
    }

    #[tokio::test]
    async fn test_capture_truncates_and_keeps_draining() {
        let data = vec![b'x'; CHUNK_SIZE * 3 + 17];
        let capture = Capture::spawn(Some(std::io::Cursor::new(data)), 100);
        let captured = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, (CHUNK_SIZE * 3 + 17) as u64);
    }

    #[tokio::test]
    async fn test_capture_without_stream_is_empty() {
        let capture = Capture::spawn(None::<&'static [u8]>, 100);
        assert_eq!(capture.finish(Duration::from_secs(1)).await, Captured::default());
    }

    #[tokio::test]
    async fn test_capture_gives_up_on_a_stream_that_never_ends() {
        let (_writer, reader) = tokio::io::duplex(64);
        let capture = Capture::spawn(Some(reader), 100);
        let captured = capture.finish(Duration::from_millis(50)).await;
        assert!(captured.bytes.is_empty());
    }

    #[test]
    fn test_lossy_conversion() {
        let mut captured = Captured::default();
        captured.push(&[b'o', b'k', 0xff], 10);
        assert_eq!(captured.to_string_lossy(), "ok\u{fffd}");
    }
}
