//! Request framing.
//!
//! A request frame is whatever bytes a connection delivered, split at the
//! first blank line:
//!
//! ```text
//! Request:  <header section>\r\n\r\n<body>
//! Response: <body>
//!
//! Example:
//! Request:  GET / HTTP/1.1\r\nHost: x\r\n\r\nhello
//! Response: hello
//! ```
//!
//! Nothing in the header section is interpreted. There is no status line,
//! no content length and no chunking.
//!
//! By default a frame is a single bounded read. A body that spans several
//! reads, or a separator split across two segments, is not reassembled.
//! `ReadMode::UntilSeparator` lifts the second restriction up to `max_frame`
//! bytes.

use bytes::BytesMut;
use clap::ValueEnum;
use serde::Deserialize;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Marks the end of the header section.
pub const SEPARATOR: &[u8; 4] = b"\r\n\r\n";

/// What to do with a frame that contains no separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FramePolicy {
    /// Treat the frame as all header and echo an empty body.
    #[default]
    Lenient,
    /// Reject the frame and write nothing.
    Strict,
}

/// How many reads make up a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReadMode {
    /// Exactly one read of at most `read_size` bytes.
    #[default]
    Single,
    /// Keep reading until the separator arrives, the peer stops sending,
    /// or `max_frame` bytes are buffered.
    UntilSeparator,
}

/// Framing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("no header/body separator in {len} byte frame")]
    NoSeparator { len: usize },
}

/// A frame split into its two sections. Both borrow from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: &'a [u8],
    pub body: &'a [u8],
}

/// Framing parameters for one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub read_size: usize,
    pub read_mode: ReadMode,
    pub max_frame: usize,
    pub policy: FramePolicy,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            read_size: 4096,
            read_mode: ReadMode::Single,
            max_frame: 4096,
            policy: FramePolicy::Lenient,
        }
    }
}

impl Framing {
    /// Read one frame from `reader` into `buffer`.
    ///
    /// Returns the number of bytes read. Zero means the peer closed without
    /// sending anything.
    pub async fn read_frame<R>(&self, reader: &mut R, buffer: &mut BytesMut) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        buffer.clear();

        match self.read_mode {
            ReadMode::Single => {
                read_chunk(reader, buffer, self.read_size).await?;
            }
            ReadMode::UntilSeparator => {
                while buffer.len() < self.max_frame {
                    // A separator may straddle the previous chunk boundary
                    let search_from = buffer.len().saturating_sub(SEPARATOR.len() - 1);
                    let want = self.read_size.min(self.max_frame - buffer.len());

                    if read_chunk(reader, buffer, want).await? == 0 {
                        break;
                    }
                    if find_separator(&buffer[search_from..]).is_some() {
                        break;
                    }
                }
            }
        }

        Ok(buffer.len())
    }

    /// Split a frame at the first separator according to the policy.
    pub fn split<'a>(&self, input: &'a [u8]) -> Result<Frame<'a>, FramingError> {
        match find_separator(input) {
            Some(pos) => Ok(Frame {
                header: &input[..pos],
                body: &input[pos + SEPARATOR.len()..],
            }),
            None => match self.policy {
                FramePolicy::Lenient => Ok(Frame {
                    header: input,
                    body: &[],
                }),
                FramePolicy::Strict => Err(FramingError::NoSeparator { len: input.len() }),
            },
        }
    }
}

/// Append at most `max` bytes from a single read to `buffer`.
async fn read_chunk<R>(reader: &mut R, buffer: &mut BytesMut, max: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let start = buffer.len();
    buffer.resize(start + max, 0);

    match reader.read(&mut buffer[start..]).await {
        Ok(n) => {
            buffer.truncate(start + n);
            Ok(n)
        }
        Err(e) => {
            buffer.truncate(start);
            Err(e)
        }
    }
}

/// Find the first `\r\n\r\n`, returning the position of its `\r`.
pub fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(SEPARATOR.len())
        .position(|window| window == SEPARATOR)
}
