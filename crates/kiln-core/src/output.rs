//! Progress output sent back to the build caller.

use std::fmt::Display;
use std::io;

use tokio::sync::mpsc;

use crate::types::{BuildResponse, TsuruConfig};

/// Writes progress text onto the caller's response stream.
///
/// Cheap to clone; every clone feeds the same stream. A writer whose
/// stream has gone away silently drops output, since the build outcome
/// does not depend on the caller still listening.
#[derive(Debug, Clone, Default)]
pub struct OutputWriter {
    tx: Option<mpsc::UnboundedSender<BuildResponse>>,
}

impl OutputWriter {
    pub fn new(tx: mpsc::UnboundedSender<BuildResponse>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A writer that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Create a writer plus the receiving end, mostly for tests.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BuildResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Send one line of progress text.
    pub fn line(&self, msg: impl Display) {
        self.send(BuildResponse::Output(format!("{msg}\n")));
    }

    /// Send the final platform configuration.
    pub fn config(&self, config: TsuruConfig) -> bool {
        self.send(BuildResponse::TsuruConfig(config))
    }

    fn send(&self, msg: BuildResponse) -> bool {
        match &self.tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

impl io::Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send(BuildResponse::Output(
            String::from_utf8_lossy(buf).into_owned(),
        ));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lines_are_newline_terminated() {
        let (w, mut rx) = OutputWriter::channel();
        w.line("---> Starting container image build");
        assert_eq!(
            rx.try_recv().unwrap(),
            BuildResponse::Output("---> Starting container image build\n".to_string())
        );
    }

    #[test]
    fn io_write_skips_empty_chunks() {
        let (mut w, mut rx) = OutputWriter::channel();
        assert_eq!(w.write(b"").unwrap(), 0);
        write!(w, "step 1/3").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            BuildResponse::Output("step 1/3".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn discard_accepts_everything() {
        let w = OutputWriter::discard();
        w.line("ignored");
        assert!(!w.config(TsuruConfig::default()));
    }
}
