// Directional byte copying between a child's standard streams and caller streams

use spawnline_core::{CancellationToken, PipeSink, PipeSource, Result, SpawnlineError, TextEncoding};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Feed `source` into the child's stdin, then close it.
///
/// A child that exits without reading all of its input is not an error.
pub async fn pipe_input<W>(
    source: &PipeSource,
    mut stdin: W,
    encoding: TextEncoding,
    cancel: &CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let copy = async {
        let written = match source {
            PipeSource::Text(text) => {
                let bytes = encoding.encode(text);
                stdin.write_all(&bytes).await?;
                bytes.len() as u64
            }
            PipeSource::Reader(reader) => {
                let mut reader = reader.lock().await;
                tokio::io::copy(&mut *reader, &mut stdin).await?
            }
        };
        stdin.flush().await?;
        stdin.shutdown().await?;
        Ok::<u64, std::io::Error>(written)
    };

    tokio::select! {
        result = copy => match result {
            Ok(written) => Ok(written),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!("Child closed stdin before all input was written");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        },
        _ = cancel.cancelled() => Err(SpawnlineError::Cancelled),
    }
}

/// Copy a child output stream into `sink` until EOF.
///
/// The sink is flushed before the first byte so stale buffered data from an
/// earlier use of the same handle is written out first. The sink lock is
/// held per chunk, so stdout and stderr may share one sink.
pub async fn pipe_output<R>(mut stream: R, sink: &PipeSink, cancel: &CancellationToken) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let copy = async {
        sink.writer().lock().await.flush().await?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let read = stream.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            sink.writer().lock().await.write_all(&buffer[..read]).await?;
            copied += read as u64;
        }

        sink.writer().lock().await.flush().await?;
        Ok::<u64, std::io::Error>(copied)
    };

    tokio::select! {
        result = copy => Ok(result?),
        _ = cancel.cancelled() => Err(SpawnlineError::Cancelled),
    }
}

/// Read a child output stream to the end.
pub async fn capture_output<R>(mut stream: R, cancel: &CancellationToken) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    tokio::select! {
        result = stream.read_to_end(&mut bytes) => { result?; }
        _ = cancel.cancelled() => return Err(SpawnlineError::Cancelled),
    }
    Ok(bytes)
}

/// Read a child output stream to the end and decode it as text.
pub async fn buffer_output<R>(
    stream: R,
    encoding: TextEncoding,
    cancel: &CancellationToken,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let bytes = capture_output(stream, cancel).await?;
    Ok(encoding.decode(&bytes))
}
