//! LSP framing: length-prefixed JSON-RPC messages over byte streams.
//!
//! Wire format: header lines terminated by CRLF, a blank line, then exactly
//! `Content-Length` body bytes. Only `Content-Length` is interpreted; other
//! header lines are tolerated and ignored.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one framed message and return its body bytes.
///
/// Fails on a closed stream, a malformed or missing `Content-Length`
/// header, or a body shorter than the declared length.
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .context("read header line")?;
        if n == 0 {
            return Err(anyhow!("stream closed while reading headers"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|e| anyhow!("invalid Content-Length {:?}: {e}", value.trim()))?;
            }
        } else {
            return Err(anyhow!("malformed header line: {line:?}"));
        }
    }

    if content_length == 0 {
        return Err(anyhow!("missing or zero Content-Length"));
    }

    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .context("read message body")?;
    Ok(body)
}

/// Serialize `msg` as JSON and write it with a `Content-Length` header.
pub async fn write_message<W>(writer: &mut W, msg: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg).context("serialize message")?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
