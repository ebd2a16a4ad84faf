//! Bounded waiting for the monitor loop
//!
//! The loop sleeps in `poll` until SIGCHLD arrives, the sandbox pokes the
//! wake socket, the comms socket becomes readable, or the timeout expires.

use crate::Result;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use signal_hook::SigId;
use signal_hook::consts::SIGCHLD;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

pub(crate) struct Notifier {
    sigchld: UnixStream,
    sig_id: SigId,
    wake: UnixStream,
}

impl Notifier {
    /// `wake` is the reading half of the sandbox's wake socket
    pub(crate) fn new(wake: UnixStream) -> Result<Self> {
        let (sigchld, writer) = UnixStream::pair()?;
        sigchld.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        wake.set_nonblocking(true)?;
        let sig_id = signal_hook::low_level::pipe::register(SIGCHLD, writer)?;
        Ok(Self {
            sigchld,
            sig_id,
            wake,
        })
    }

    /// Sleep for at most `timeout`, returning early on any wake-up source
    pub(crate) fn wait(&mut self, timeout: Duration, extra: Option<BorrowedFd<'_>>) -> Result<()> {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = vec![
            PollFd::new(self.sigchld.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
        ];
        if let Some(fd) = extra {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
        drop(fds);

        drain(&mut self.sigchld);
        drain(&mut self.wake);
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.sig_id);
    }
}

fn drain(stream: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(n) if n > 0 => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn wake_socket_cuts_the_wait_short() {
        let (rx, mut tx) = UnixStream::pair().unwrap();
        let mut notifier = Notifier::new(rx).unwrap();
        tx.write_all(&[1]).unwrap();

        let start = Instant::now();
        notifier.wait(Duration::from_secs(5), None).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn times_out_without_events() {
        let (rx, _tx) = UnixStream::pair().unwrap();
        let mut notifier = Notifier::new(rx).unwrap();
        let start = Instant::now();
        notifier.wait(Duration::from_millis(20), None).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
