//! Framed channel between the monitor and a cooperative sandboxee
//!
//! Frames are a 4-byte big-endian length followed by a msgpack body. The
//! monitor sends a [`PolicyTransfer`] and the sandboxee answers with a
//! single [`Ack`] byte once its filter is active. After that the monitor
//! hands its end to the caller, and both sides exchange application
//! frames.

use crate::policy::bpf::SockFilter;
use crate::{Policy, Result, StockadeError};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Compiled filter handed to a cooperative sandboxee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTransfer {
    pub program: Vec<SockFilter>,
}

impl PolicyTransfer {
    #[must_use]
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            program: policy.program().to_vec(),
        }
    }
}

/// Sandboxee's reply after installing the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    AllThreads,
    SingleThread,
}

impl Ack {
    const fn to_byte(self) -> u8 {
        match self {
            Self::AllThreads => 1,
            Self::SingleThread => 2,
        }
    }

    const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::AllThreads),
            2 => Some(Self::SingleThread),
            _ => None,
        }
    }
}

/// One end of the comms socket
#[derive(Debug)]
pub struct Comms {
    stream: UnixStream,
}

impl Comms {
    #[must_use]
    pub const fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Send one length-prefixed frame
    pub fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_LEN {
            return Err(StockadeError::Comms(format!(
                "frame too large: {} bytes",
                body.len()
            )));
        }
        let len = u32::try_from(body.len())
            .map_err(|_| StockadeError::Comms("frame length overflow".into()))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(body)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one length-prefixed frame
    pub fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes)?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(StockadeError::Comms(format!("frame too large: {len} bytes")));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    /// Send any serializable message as one msgpack frame
    pub fn send_message<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let body = encode(msg)?;
        self.send_frame(&body)
    }

    pub fn recv_message<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let body = self.recv_frame()?;
        decode(&body)
    }

    pub fn send_policy(&mut self, transfer: &PolicyTransfer) -> Result<()> {
        let body = encode(transfer)?;
        self.send_frame(&body)
    }

    pub fn recv_policy(&mut self) -> Result<PolicyTransfer> {
        let body = self.recv_frame()?;
        decode(&body)
    }

    pub fn send_ack(&mut self, ack: Ack) -> Result<()> {
        self.stream.write_all(&[ack.to_byte()])?;
        Ok(())
    }

    /// Read an ack without blocking. `Ok(None)` if none has arrived yet.
    pub fn try_recv_ack(&mut self) -> Result<Option<Ack>> {
        self.stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let read = self.stream.read(&mut byte);
        self.stream.set_nonblocking(false)?;
        match read {
            Ok(0) => Err(StockadeError::Comms("peer closed the channel".into())),
            Ok(_) => Ack::from_byte(byte[0])
                .map(Some)
                .ok_or_else(|| StockadeError::Comms(format!("unexpected ack byte {}", byte[0]))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for Comms {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(msg).map_err(|e| StockadeError::Comms(format!("encode: {e}")))
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| StockadeError::Comms(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultAction;

    fn pair() -> (Comms, Comms) {
        let (a, b) = UnixStream::pair().unwrap();
        (Comms::new(a), Comms::new(b))
    }

    #[test]
    fn policy_crosses_the_channel() {
        let policy = Policy::builder()
            .allow_exit()
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap();
        let (mut monitor, mut sandboxee) = pair();

        monitor.send_policy(&PolicyTransfer::from_policy(&policy)).unwrap();
        let got = sandboxee.recv_policy().unwrap();
        assert_eq!(got.program, policy.program());
    }

    #[test]
    fn oversized_frame_is_rejected_on_receive() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut raw = a;
        raw.write_all(&u32::MAX.to_be_bytes()).unwrap();
        let mut rx = Comms::new(b);
        assert!(matches!(rx.recv_frame(), Err(StockadeError::Comms(_))));
    }

    #[test]
    fn ack_is_polled_without_blocking() {
        let (mut monitor, mut sandboxee) = pair();
        assert_eq!(monitor.try_recv_ack().unwrap(), None);
        sandboxee.send_ack(Ack::SingleThread).unwrap();
        assert_eq!(monitor.try_recv_ack().unwrap(), Some(Ack::SingleThread));
    }

    #[test]
    fn application_messages_follow_the_ack() {
        let (mut monitor, mut sandboxee) = pair();
        sandboxee.send_ack(Ack::AllThreads).unwrap();
        sandboxee.send_message(&(7u32, "port")).unwrap();
        assert_eq!(monitor.try_recv_ack().unwrap(), Some(Ack::AllThreads));
        let got: (u32, String) = monitor.recv_message().unwrap();
        assert_eq!(got, (7, "port".to_string()));
    }

    #[test]
    fn closed_peer_is_an_error() {
        let (mut monitor, sandboxee) = pair();
        drop(sandboxee);
        assert!(monitor.try_recv_ack().is_err());
    }
}
