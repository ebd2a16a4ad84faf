//! Sandboxee side of cooperative mode
//!
//! A program started with [`crate::Executor::enable_sandbox_before_exec`]
//! set to false runs unfiltered (but traced) until it calls
//! [`Client::sandbox_me_here`]. From then on the policy applies to every
//! thread of the process, and the channel is free for application messages
//! with the caller (see [`crate::Sandbox::take_comms`]).
//!
//! ```no_run
//! let mut client = stockade_core::client::Client::from_env()?;
//! client.sandbox_me_here()?;
//! # Ok::<(), stockade_core::StockadeError>(())
//! ```

use crate::comms::{Ack, Comms};
use crate::isolation::{Installed, seccomp};
use crate::{Result, StockadeError};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Environment variable naming the comms descriptor
pub const COMMS_FD_ENV: &str = "STOCKADE_COMMS_FD";

/// Connection to the monitor from inside the sandboxee
#[derive(Debug)]
pub struct Client {
    comms: Comms,
}

impl Client {
    /// Attach to the descriptor announced in `STOCKADE_COMMS_FD`
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(COMMS_FD_ENV)
            .map_err(|_| StockadeError::Comms(format!("{COMMS_FD_ENV} is not set")))?;
        let fd: RawFd = value
            .parse()
            .map_err(|_| StockadeError::Comms(format!("{COMMS_FD_ENV}={value:?} is not a descriptor")))?;

        // SAFETY: F_GETFD only inspects the descriptor
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(StockadeError::Comms(format!("descriptor {fd} is not open")));
        }
        // SAFETY: the monitor handed this descriptor over for our exclusive use
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(Self::from_stream(stream))
    }

    #[must_use]
    pub const fn from_stream(stream: UnixStream) -> Self {
        Self {
            comms: Comms::new(stream),
        }
    }

    /// Receive the policy, install it on every thread and acknowledge.
    ///
    /// On error the process is still unfiltered; the monitor ends the run
    /// once the channel closes without an acknowledgement.
    pub fn sandbox_me_here(&mut self) -> Result<Installed> {
        let transfer = self.comms.recv_policy()?;
        let installed = seccomp::install_all_threads(&transfer.program)?;
        self.comms.send_ack(match installed {
            Installed::AllThreads => Ack::AllThreads,
            Installed::SingleThread => Ack::SingleThread,
        })?;
        Ok(installed)
    }

    /// The channel to the caller, for use after [`Self::sandbox_me_here`]
    pub const fn comms(&mut self) -> &mut Comms {
        &mut self.comms
    }
}
