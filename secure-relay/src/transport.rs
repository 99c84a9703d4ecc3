use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    crypto::{self, SessionKey},
    error::{RelayError, RelayResult},
};

/// Reads one line and strips its terminator. `None` means the peer closed the stream.
///
/// A line that is not valid UTF-8 is consumed and reported as a `Format` error,
/// so the next call starts at the following line.
pub async fn read_line<R>(reader: &mut R) -> RelayResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes = reader.read_until(b'\n', &mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(Some(String::from_utf8(line)?))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per frame, then flush so peers see lines as soon as they are produced.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Encrypts `plain` under `key` and renders it as a single base64 frame.
pub fn seal_line(plain: &str, key: &SessionKey) -> RelayResult<String> {
    let ciphertext = crypto::symmetric_encrypt(plain.as_bytes(), key)?;
    Ok(crypto::text_encode(&ciphertext))
}

/// Inverse of [`seal_line`].
pub fn open_line(frame: &str, key: &SessionKey) -> RelayResult<String> {
    let ciphertext = crypto::text_decode(frame)?;
    let plain = crypto::symmetric_decrypt(&ciphertext, key)?;
    Ok(String::from_utf8(plain)?)
}

pub async fn send_encrypted_line<W>(writer: &mut W, plain: &str, key: &SessionKey) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = seal_line(plain, key)?;
    write_line(writer, &frame).await?;
    Ok(())
}

/// Reads and decrypts the next frame.
///
/// `Ok(None)` is end of stream. `Integrity` and `Format` errors leave the stream
/// positioned after the bad line, so the caller may keep reading.
pub async fn receive_encrypted_line<R>(reader: &mut R, key: &SessionKey) -> RelayResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await? {
        Some(frame) => open_line(&frame, key).map(Some),
        None => Ok(None),
    }
}

/// Reads a line that must be present, naming `what` in the error otherwise.
pub(crate) async fn expect_line<R>(reader: &mut R, what: &str) -> RelayResult<String>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader)
        .await?
        .ok_or_else(|| RelayError::Handshake(format!("connection closed before {what}")))
}
