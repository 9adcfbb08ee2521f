//! Line-oriented output stream for subprocess stdout/stderr

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Cloneable sink for subprocess output lines
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: UnboundedSender<String>,
}

impl OutputSink {
    /// Create a sink and the receiving end of its line stream
    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Sink that discards every line
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// Emit one output line
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_arrive_in_order() {
        let (sink, mut rx) = OutputSink::channel();
        sink.line("first");
        sink.line("second");

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[test]
    fn test_discard_does_not_panic() {
        let sink = OutputSink::discard();
        sink.line("into the void");
    }
}
