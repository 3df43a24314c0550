use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Origin stream of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured log line, timestamped at capture time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub stream: StreamKind,
    pub content: String,
}

impl LogLine {
    pub fn now(service: impl Into<String>, stream: StreamKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.into(),
            stream,
            content: content.into(),
        }
    }
}

/// Reads a child's byte stream to EOF, emitting one [`LogLine`] per
/// `\n`-terminated fragment.
///
/// Bytes accumulate in a [`BytesMut`] and are only decoded once a full
/// line is present, so multi-byte UTF-8 sequences split across read
/// boundaries survive intact. A non-empty trailing fragment is emitted
/// as a final line when the stream closes. The reader is finite and not
/// restartable.
pub async fn read_lines<R, F>(mut reader: R, service: &str, stream: StreamKind, mut emit: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(LogLine),
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let raw = buf.split_to(pos + 1);
                    emit(decode(service, stream, &raw[..raw.len() - 1]));
                }
            }
            Err(_) => break,
        }
    }

    if !buf.is_empty() {
        emit(decode(service, stream, &buf));
    }
}

fn decode(service: &str, stream: StreamKind, bytes: &[u8]) -> LogLine {
    let mut content = String::from_utf8_lossy(bytes).into_owned();
    if content.ends_with('\r') {
        content.pop();
    }
    LogLine::now(service, stream, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8]) -> Vec<LogLine> {
        let mut lines = Vec::new();
        read_lines(input, "svc", StreamKind::Stdout, |l| lines.push(l)).await;
        lines
    }

    #[tokio::test]
    async fn test_splits_terminated_lines() {
        let lines = collect(b"one\ntwo\nthree\n").await;
        let contents: Vec<&str> = lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, ["one", "two", "three"]);
        assert!(lines.iter().all(|l| l.service == "svc"));
        assert!(lines.iter().all(|l| l.stream == StreamKind::Stdout));
    }

    #[tokio::test]
    async fn test_emits_trailing_fragment_at_eof() {
        let lines = collect(b"done\npartial").await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].content, "partial");
    }

    #[tokio::test]
    async fn test_strips_carriage_returns() {
        let lines = collect(b"windows line\r\n").await;
        assert_eq!(lines[0].content, "windows line");
    }

    #[tokio::test]
    async fn test_empty_stream_yields_nothing() {
        assert!(collect(b"").await.is_empty());
    }

    #[tokio::test]
    async fn test_preserves_multibyte_sequences_across_chunks() {
        // "héllo\n" with the two-byte é split across writes.
        let bytes = "héllo\n".as_bytes();
        let (split_at, _) = bytes
            .iter()
            .enumerate()
            .find(|(_, &b)| b == 0xc3)
            .map(|(i, b)| (i + 1, b))
            .unwrap();

        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = tokio::spawn({
            let head = bytes[..split_at].to_vec();
            let tail = bytes[split_at..].to_vec();
            async move {
                use tokio::io::AsyncWriteExt;
                tx.write_all(&head).await.unwrap();
                tx.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                tx.write_all(&tail).await.unwrap();
                drop(tx);
            }
        });

        let mut lines = Vec::new();
        read_lines(rx, "svc", StreamKind::Stderr, |l| lines.push(l)).await;
        writer.await.unwrap();

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].content, "héllo");
        assert_eq!(lines[0].stream, StreamKind::Stderr);
    }
}
