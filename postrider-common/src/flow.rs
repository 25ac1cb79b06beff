//! Flow-control tokens between mail producers and consumers.
//!
//! Tokens are plain bytes on a local stream pair. Receiving processes
//! consume a token before admitting a message; the queue manager produces
//! tokens when it falls idle. An empty pipe throttles producers without
//! losing mail. Tokens can leak (a producer dies holding one), so producers
//! wake periodically instead of blocking forever.

use std::{io, os::fd::OwnedFd};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::trace;

const BUFFER_SIZE: usize = 1024;

/// Consuming end: held by producers of new mail.
#[derive(Debug)]
pub struct FlowConsumer {
    reader: OwnedReadHalf,
}

/// Producing end: held by the queue manager.
#[derive(Debug)]
pub struct FlowProducer {
    writer: OwnedWriteHalf,
}

/// Create a connected token pipe.
pub fn token_pipe() -> io::Result<(FlowProducer, FlowConsumer)> {
    let (read_side, write_side) = UnixStream::pair()?;
    let (reader, _) = read_side.into_split();
    let (_, writer) = write_side.into_split();
    Ok((FlowProducer { writer }, FlowConsumer { reader }))
}

/// Create the pipe as a pair of plain descriptors that child processes can
/// inherit. The supervisor keeps the pair; each end converts into a
/// [`FlowConsumer`] or [`FlowProducer`] inside the process that inherited
/// it.
pub fn inheritable_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let (consumer_end, producer_end) = std::os::unix::net::UnixStream::pair()?;
    Ok((consumer_end.into(), producer_end.into()))
}

impl FlowConsumer {
    /// Adopt an inherited descriptor as the consuming end.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        let (reader, _) = UnixStream::from_std(std_stream)?.into_split();
        Ok(Self { reader })
    }
}

impl FlowProducer {
    /// Adopt an inherited descriptor as the producing end.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        let (_, writer) = UnixStream::from_std(std_stream)?.into_split();
        Ok(Self { writer })
    }
}

impl FlowConsumer {
    /// Take up to `count` tokens; returns how many were actually read.
    ///
    /// A partial read counts as that many tokens; zero means the producer
    /// is busy and the caller should slow down.
    pub async fn get(&mut self, count: usize) -> io::Result<usize> {
        let mut buf = [0u8; BUFFER_SIZE];
        let mut taken = 0;
        while taken < count {
            let want = (count - taken).min(BUFFER_SIZE);
            match self.reader.try_read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => taken += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        trace!(requested = count, taken, "flow tokens taken");
        Ok(taken)
    }

    /// Wait until at least one token is available, then take up to `count`.
    pub async fn get_blocking(&mut self, count: usize) -> io::Result<usize> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf).await?;
        Ok(1 + self.get(count.saturating_sub(1)).await?)
    }
}

impl FlowProducer {
    /// Put `count` tokens; partial writes report how many actually landed.
    pub async fn put(&mut self, count: usize) -> io::Result<usize> {
        let buf = [0u8; BUFFER_SIZE];
        let mut sent = 0;
        while sent < count {
            let want = (count - sent).min(BUFFER_SIZE);
            match self.writer.try_write(&buf[..want]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        trace!(requested = count, sent, "flow tokens produced");
        Ok(sent)
    }

    /// Blocking variant for the first token.
    pub async fn put_blocking(&mut self, count: usize) -> io::Result<usize> {
        self.writer.write_all(&[0u8]).await?;
        Ok(1 + self.put(count.saturating_sub(1)).await?)
    }
}
