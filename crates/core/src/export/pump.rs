//! Byte and line pumps between the orchestrator and the child's stdio.
//!
//! Stdin and stdout copying are independent loops so that the caller can
//! poll them concurrently; a tool that emits output before it has consumed
//! all of its input would otherwise stall both pipes.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use super::events::{self, OutputLine, StreamKind};

/// Chunk size for copying the caller's input into the child (8 KiB).
pub const STDIN_CHUNK_SIZE: usize = 8 * 1024;

/// Chunk size for copying the child's output to the caller (32 KiB).
pub const STDOUT_CHUNK_SIZE: usize = 32 * 1024;

/// Copy `input` into the child's stdin until `input` is exhausted, then
/// close stdin so the tool sees a clean end-of-input.
///
/// Every chunk is flushed as soon as it is written. If the tool closes its
/// end early the copy stops quietly; the tool's exit code is what reports
/// the problem. Returns the number of bytes delivered.
pub async fn copy_to_stdin<R, W>(input: &mut R, mut stdin: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STDIN_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let written = async {
            stdin.write_all(&buf[..n]).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => total += n as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(bytes = total, "Tool closed stdin before input was exhausted");
                return Ok(total);
            }
            Err(e) => return Err(e),
        }
    }

    match stdin.shutdown().await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => return Err(e),
    }
    drop(stdin);
    Ok(total)
}

/// Copy the child's stdout into `output` until the child closes it.
///
/// Returns the number of bytes copied. `output` is flushed at the end.
pub async fn copy_stdout_to<R, W>(stdout: &mut R, output: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; STDOUT_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    output.flush().await?;
    Ok(total)
}

/// Read `reader` line by line, publishing each line on `tx`.
///
/// Lines are split on `\n`, a trailing `\r` is dropped, and invalid UTF-8
/// is replaced. When `collect` is set the lines are also returned in
/// arrival order. A read error ends the loop; whatever was read so far is
/// kept.
pub async fn read_lines<R>(
    reader: R,
    stream: StreamKind,
    tx: broadcast::Sender<OutputLine>,
    collect: bool,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut lines = Vec::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                if raw.last() == Some(&b'\n') {
                    raw.pop();
                }
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                let line = String::from_utf8_lossy(&raw).into_owned();
                events::publish(&tx, stream, &line);
                if collect {
                    lines.push(line);
                }
            }
            Err(e) => {
                tracing::warn!(?stream, error = %e, "Failed to read tool output line");
                break;
            }
        }
    }

    lines
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn stdin_copy_delivers_all_bytes_and_closes() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut input = Cursor::new(payload.clone());
        let (writer, mut reader) = tokio::io::duplex(4096);

        let copy = copy_to_stdin(&mut input, writer);
        let mut received = Vec::new();
        let read = reader.read_to_end(&mut received);
        let (copied, read) = tokio::join!(copy, read);

        assert_eq!(copied.expect("copy"), payload.len() as u64);
        read.expect("read to EOF");
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn stdin_copy_of_empty_input_just_closes() {
        let mut input = Cursor::new(Vec::<u8>::new());
        let (writer, mut reader) = tokio::io::duplex(64);
        let copied = copy_to_stdin(&mut input, writer).await.expect("copy");
        assert_eq!(copied, 0);
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.expect("EOF");
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn stdout_copy_preserves_bytes_in_order() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut stdout = Cursor::new(payload.clone());
        let mut output = Vec::new();
        let copied = copy_stdout_to(&mut stdout, &mut output).await.expect("copy");
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(output, payload);
    }

    #[tokio::test]
    async fn lines_are_published_and_collected_in_order() {
        let tx = events::channel();
        let mut rx = tx.subscribe();
        let data = Cursor::new(b"first\r\nsecond\n\nlast without newline".to_vec());

        let lines = read_lines(data, StreamKind::Stderr, tx, true).await;
        assert_eq!(lines, vec!["first", "second", "", "last without newline"]);

        for expected in &lines {
            let event = rx.recv().await.expect("event");
            assert_eq!(event.stream, StreamKind::Stderr);
            assert_eq!(&event.line, expected);
        }
    }

    #[tokio::test]
    async fn uncollected_lines_are_still_published() {
        let tx = events::channel();
        let mut rx = tx.subscribe();
        let lines = read_lines(Cursor::new(b"a\nb\n".to_vec()), StreamKind::Stdout, tx, false).await;
        assert!(lines.is_empty());
        assert_eq!(rx.recv().await.expect("event").line, "a");
        assert_eq!(rx.recv().await.expect("event").line, "b");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let tx = events::channel();
        let lines = read_lines(
            Cursor::new(vec![b'o', b'k', 0xff, b'\n']),
            StreamKind::Stderr,
            tx,
            true,
        )
        .await;
        assert_eq!(lines, vec!["ok\u{fffd}"]);
    }
}
