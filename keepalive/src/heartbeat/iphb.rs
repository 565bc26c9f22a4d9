// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words dsme iphb

//! Production wakeup transport: the heartbeat daemon's Unix domain socket.
//!
//! The daemon contract is small: a connected client programs (or cancels)
//! its wakeup window by writing one 8-byte frame — `lo` and `hi` seconds as
//! little-endian `u32`s, `0, 0` to cancel — and the socket becomes readable
//! when the aligned wakeup is due. Whatever payload arrives is drained and
//! discarded; only the readiness carries information.

use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::net::UnixStream;

use super::{WakeupLink, WakeupService};

/// Default heartbeat daemon socket path.
pub const IPHB_SOCKET_PATH: &str = "/run/dsme/dsme.hb";

/// Opens [`WakeupLink`]s over the heartbeat daemon socket.
#[derive(Debug, Clone)]
pub struct IphbService {
    path: PathBuf,
}

impl Default for IphbService {
    fn default() -> Self { Self { path: IPHB_SOCKET_PATH.into() } }
}

impl IphbService {
    /// Service at a non-default socket path.
    pub fn at(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

#[async_trait]
impl WakeupService for IphbService {
    async fn open(&self) -> io::Result<Arc<dyn WakeupLink>> {
        let stream = UnixStream::connect(&self.path).await?;
        Ok(Arc::new(IphbLink { stream }))
    }
}

struct IphbLink {
    stream: UnixStream,
}

#[async_trait]
impl WakeupLink for IphbLink {
    async fn request_wakeup(&self, lo: u32, hi: u32) -> io::Result<()> {
        let mut frame = [0u8; 8];
        frame[..4].copy_from_slice(&lo.to_le_bytes());
        frame[4..].copy_from_slice(&hi.to_le_bytes());

        let mut written = 0;
        while written < frame.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&frame[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn recv_wakeup(&self) -> io::Result<()> {
        // Reprogramming flushes pending input daemon-side; by the time this
        // task gets to read, the socket may have nothing after all. Reads are
        // non-blocking and spurious readiness loops back to waiting.
        let mut buf = [0u8; 256];
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected eof"));
                }
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock
                          || e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frames_are_little_endian_pairs() {
        let (client, mut server) = UnixStream::pair().expect("socketpair");
        let link = IphbLink { stream: client };

        link.request_wakeup(30, 90).await.expect("write frame");
        let mut frame = [0u8; 8];
        server.read_exact(&mut frame).await.expect("read frame");
        assert_eq!(u32::from_le_bytes(frame[..4].try_into().unwrap()), 30);
        assert_eq!(u32::from_le_bytes(frame[4..].try_into().unwrap()), 90);
    }

    #[tokio::test]
    async fn recv_drains_payload_and_detects_eof() {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = UnixStream::pair().expect("socketpair");
        let link = IphbLink { stream: client };

        server.write_all(b"wake").await.expect("payload");
        link.recv_wakeup().await.expect("wakeup");

        drop(server);
        let err = link.recv_wakeup().await.expect_err("eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
