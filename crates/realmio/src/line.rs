use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

/// Reads `\n`-terminated lines from a client socket.
///
/// Overlong lines are truncated rather than rejected: the tail up to
/// the next newline is discarded so one pasted blob cannot wedge the
/// connection.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line_len: usize,
    discarding: bool,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(2 * 1024),
            max_line_len: 2 * 1024,
            discarding: false,
        }
    }

    pub fn max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max.max(1);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, stripping the trailing `\n` and optional `\r`.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` for a line (may be empty),
    /// - `Ok(None)` on clean EOF with no buffered data.
    pub async fn read_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(i) = memchr(b'\n', &self.buf) {
                let raw = self.buf.split_to(i + 1).freeze();
                if self.discarding {
                    // Tail of a truncated line; swallow it.
                    self.discarding = false;
                    continue;
                }
                return Ok(Some(trim_crlf(raw)));
            }

            if self.buf.len() > self.max_line_len && !self.discarding {
                let head = self.buf.split_to(self.max_line_len).freeze();
                self.discarding = true;
                return Ok(Some(head));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading line",
                ));
            }
        }
    }
}

fn trim_crlf(mut b: Bytes) -> Bytes {
    let mut end = b.len();
    if end > 0 && b[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && b[end - 1] == b'\r' {
        end -= 1;
    }
    b.truncate(end);
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_crlf_and_lf() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"look\r\nsay hi\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        let l1 = lr.read_line().await.unwrap().unwrap();
        let l2 = lr.read_line().await.unwrap().unwrap();
        assert_eq!(&l1[..], b"look");
        assert_eq!(&l2[..], b"say hi");
    }

    #[tokio::test]
    async fn truncates_overlong_line_and_resyncs() {
        let (a, b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"abcdefghij\nnext\n").await.unwrap();
        });

        let mut lr = LineReader::new(a).max_line_len(4);
        let l1 = lr.read_line().await.unwrap().unwrap();
        assert_eq!(&l1[..], b"abcd");
        let l2 = lr.read_line().await.unwrap().unwrap();
        assert_eq!(&l2[..], b"next");
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut lr = LineReader::new(a);
        assert!(lr.read_line().await.unwrap().is_none());
    }
}
