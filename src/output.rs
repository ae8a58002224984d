use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use owo_colors::{AnsiColors, OwoColorize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const PALETTE: [AnsiColors; 6] = [
    AnsiColors::BrightBlue,
    AnsiColors::BrightCyan,
    AnsiColors::BrightGreen,
    AnsiColors::BrightRed,
    AnsiColors::BrightMagenta,
    AnsiColors::BrightYellow,
];

/// Color for the process at `index` in configuration order.
pub fn pick_color(index: usize) -> AnsiColors {
    PALETTE[index % PALETTE.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A stream shared by many [`PrefixWriter`]s. The lock lives here, not in
/// the writers, so every write against the same stream is serialized.
#[derive(Clone)]
pub struct Destination {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl Destination {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Destination {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Destination::new(tokio::io::stdout())
    }

    pub fn stderr() -> Self {
        Destination::new(tokio::io::stderr())
    }

    /// Writes `buf` and flushes while holding the stream lock.
    pub async fn write_raw(&self, buf: &[u8]) -> io::Result<()> {
        let mut w = self.inner.lock().await;
        w.write_all(buf).await?;
        w.flush().await
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination").finish_non_exhaustive()
    }
}

/// In-memory destination; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<StdMutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        match self.bytes.lock() {
            Ok(b) => b.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.bytes.lock() {
            Ok(mut b) => b.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Builds `<name padded to width> (<stream>) | `, colored when asked.
pub fn format_prefix(
    name: &str,
    stream: Stream,
    width: usize,
    color: Option<AnsiColors>,
) -> String {
    let plain = format!("{:<width$} ({}) | ", name, stream, width = width);
    match color {
        Some(c) => plain.color(c).to_string(),
        None => plain,
    }
}

/// Tags everything written through it with the owning process and stream.
#[derive(Debug, Clone)]
pub struct PrefixWriter {
    name: String,
    stream: Stream,
    prefix: String,
    dest: Destination,
}

impl PrefixWriter {
    /*
        @@@
        @new();
        . `width` is the longest configured name so every prefix lines up in one column.
        . `index` is the process's position in the config; it picks the palette color when `colored` is set.
    */
    pub fn new(
        name: &str,
        stream: Stream,
        width: usize,
        index: usize,
        colored: bool,
        dest: Destination,
    ) -> Self {
        let color = colored.then(|| pick_color(index));
        PrefixWriter {
            name: name.to_string(),
            stream,
            prefix: format_prefix(name, stream, width, color),
            dest,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Emits prefix and payload as one write under the destination lock.
    /// Returns the payload length.
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut buf = Vec::with_capacity(self.prefix.len() + data.len());
        buf.extend_from_slice(self.prefix.as_bytes());
        buf.extend_from_slice(data);
        self.dest.write_raw(&buf).await?;
        Ok(data.len())
    }

    /// Writes one lifecycle line (`msg` plus newline) with the same prefix.
    pub async fn log(&self, msg: &str) -> io::Result<()> {
        let mut line = String::with_capacity(msg.len() + 1);
        line.push_str(msg);
        line.push('\n');
        self.write(line.as_bytes()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Accepts a few bytes per call and returns Pending every other call so
    // that unsynchronized writers would visibly interleave.
    struct Trickle {
        out: SharedBuffer,
        stall: bool,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.stall = !self.stall;
            if self.stall {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let n = buf.len().min(3);
            let mut out = self.out.clone();
            Pin::new(&mut out).poll_write(cx, &buf[..n])
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn palette_cycles_by_position() {
        assert_eq!(pick_color(0), AnsiColors::BrightBlue);
        assert_eq!(pick_color(5), AnsiColors::BrightYellow);
        assert_eq!(pick_color(6), pick_color(0));
        assert_ne!(pick_color(1), pick_color(2));
    }

    #[test]
    fn prefixes_are_padded_to_width() {
        assert_eq!(format_prefix("web", Stream::Stdout, 6, None), "web    (stdout) | ");
        assert_eq!(format_prefix("worker", Stream::Stderr, 6, None), "worker (stderr) | ");
    }

    #[test]
    fn colored_prefix_keeps_the_text() {
        let p = format_prefix("web", Stream::Stdout, 3, Some(AnsiColors::BrightRed));
        assert!(p.starts_with("\u{1b}["));
        assert!(p.contains("web (stdout) | "));
    }

    #[tokio::test]
    async fn write_returns_payload_length() {
        let buf = SharedBuffer::new();
        let w = PrefixWriter::new("a", Stream::Stdout, 3, 0, false, Destination::new(buf.clone()));
        let n = w.write(b"hello\n").await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(buf.to_string_lossy(), "a   (stdout) | hello\n");
    }

    #[tokio::test]
    async fn log_appends_newline() {
        let buf = SharedBuffer::new();
        let w = PrefixWriter::new("a", Stream::Stdout, 1, 0, false, Destination::new(buf.clone()));
        w.log("Starting...").await.unwrap();
        assert_eq!(buf.to_string_lossy(), "a (stdout) | Starting...\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_split_prefix_from_payload() {
        let buf = SharedBuffer::new();
        let dest = Destination::new(Trickle { out: buf.clone(), stall: false });
        let a = PrefixWriter::new("a", Stream::Stdout, 1, 0, false, dest.clone());
        let b = PrefixWriter::new("b", Stream::Stdout, 1, 1, false, dest);

        let ta = tokio::spawn(async move {
            for _ in 0..50 {
                a.write(b"AAAAAAAAAA\n").await.unwrap();
            }
        });
        let tb = tokio::spawn(async move {
            for _ in 0..50 {
                b.write(b"BBBBBBBBBB\n").await.unwrap();
            }
        });
        ta.await.unwrap();
        tb.await.unwrap();

        let text = buf.to_string_lossy();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 100);
        for line in lines {
            assert!(
                line == "a (stdout) | AAAAAAAAAA" || line == "b (stdout) | BBBBBBBBBB",
                "interleaved line: {:?}",
                line
            );
        }
    }
}
