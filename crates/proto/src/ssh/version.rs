//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The connection opens with both sides sending an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Servers may precede their banner with free-form comment lines; those are
//! tolerated and skipped. The banner is retained verbatim (without CR LF)
//! because it is an input to every key-exchange hash.

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of a version line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of comment lines tolerated before the banner.
pub const MAX_BANNER_LINES: usize = 64;

/// Writes our version banner followed by CR LF and flushes.
pub async fn write_version<W: AsyncWrite + Unpin>(
    stream: &mut W,
    banner: &[u8],
) -> SkiffResult<()> {
    let mut line = Vec::with_capacity(banner.len() + 2);
    line.extend_from_slice(banner);
    line.extend_from_slice(b"\r\n");
    stream.write_all(&line).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the peer's version banner, skipping leading comment lines, and
/// returns it without the trailing CR LF.
pub async fn read_version<R: AsyncRead + Unpin>(stream: &mut R) -> SkiffResult<Vec<u8>> {
    for _ in 0..MAX_BANNER_LINES {
        let line = read_line(stream).await?;
        if line.starts_with(b"SSH-") {
            validate(&line)?;
            return Ok(line);
        }
        // A line without the SSH- prefix is a pre-banner comment.
    }
    Err(SkiffError::MalformedMessage(format!(
        "no version banner within {} lines",
        MAX_BANNER_LINES
    )))
}

/// Checks a banner for protocol version 2.0 (or the 1.99 compatibility
/// marker), embedded NUL bytes, and the length cap.
pub fn validate(banner: &[u8]) -> SkiffResult<()> {
    if banner.len() > MAX_VERSION_LENGTH {
        return Err(SkiffError::MalformedMessage(format!(
            "version banner of {} bytes exceeds {}",
            banner.len(),
            MAX_VERSION_LENGTH
        )));
    }
    if banner.contains(&0) {
        return Err(SkiffError::MalformedMessage(
            "version banner contains NUL".to_string(),
        ));
    }
    if !banner.starts_with(b"SSH-2.0-") && !banner.starts_with(b"SSH-1.99-") {
        return Err(SkiffError::MalformedMessage(
            "peer does not speak SSH 2.0".to_string(),
        ));
    }
    Ok(())
}

/// Reads one line byte-by-byte, stripping the terminating LF and an
/// optional preceding CR. Byte-wise reads keep us from consuming any bytes
/// of the first binary packet that follows the banner.
async fn read_line<R: AsyncRead + Unpin>(stream: &mut R) -> SkiffResult<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        line.push(byte[0]);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::MalformedMessage(
                "version line too long".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_version_plain() {
        let mut stream = Cursor::new(b"SSH-2.0-OpenSSH_8.9\r\n".to_vec());
        let banner = read_version(&mut stream).await.unwrap();
        assert_eq!(banner, b"SSH-2.0-OpenSSH_8.9");
    }

    #[tokio::test]
    async fn test_read_version_skips_comment_lines() {
        let mut stream =
            Cursor::new(b"welcome to the bastion\nplease behave\nSSH-2.0-Test\r\n".to_vec());
        let banner = read_version(&mut stream).await.unwrap();
        assert_eq!(banner, b"SSH-2.0-Test");
    }

    #[tokio::test]
    async fn test_read_version_lf_only() {
        let mut stream = Cursor::new(b"SSH-2.0-Test\n".to_vec());
        assert_eq!(read_version(&mut stream).await.unwrap(), b"SSH-2.0-Test");
    }

    #[tokio::test]
    async fn test_read_version_does_not_consume_following_bytes() {
        let mut stream = Cursor::new(b"SSH-2.0-Test\r\n\x00\x00\x00\x0c".to_vec());
        read_version(&mut stream).await.unwrap();
        assert_eq!(stream.position(), 14);
    }

    #[tokio::test]
    async fn test_read_version_rejects_old_protocol() {
        let mut stream = Cursor::new(b"SSH-1.5-Ancient\r\n".to_vec());
        assert!(read_version(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_read_version_accepts_199() {
        let mut stream = Cursor::new(b"SSH-1.99-Transitional\r\n".to_vec());
        assert!(read_version(&mut stream).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_version_line_too_long() {
        let mut data = vec![b'x'; 400];
        data.extend_from_slice(b"\n");
        let mut stream = Cursor::new(data);
        assert!(read_version(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_write_version_appends_crlf() {
        let mut out: Vec<u8> = Vec::new();
        write_version(&mut out, b"SSH-2.0-Skiff").await.unwrap();
        assert_eq!(out, b"SSH-2.0-Skiff\r\n");
    }
}
