//! Error types for stockade-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StockadeError {
    #[error("policy error: {0}")]
    Policy(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("landlock error: {0}")]
    Landlock(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("cannot open {}: {source}", path.display())]
    Program {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("comms error: {0}")]
    Comms(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StockadeError {
    /// The OS error behind this failure, if there is one
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) | Self::Program { source: e, .. } => e.raw_os_error(),
            Self::Nix(errno) => Some(*errno as i32),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_open_failure_keeps_errno() {
        let source = std::fs::File::open("/nonexistent/stockade-binary").unwrap_err();
        let err = StockadeError::Program {
            path: "/nonexistent/stockade-binary".into(),
            source,
        };
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(err.to_string().contains("/nonexistent/stockade-binary"));
    }

    #[test]
    fn string_variants_have_no_errno() {
        assert_eq!(StockadeError::Spawn("x".into()).raw_os_error(), None);
        assert_eq!(
            StockadeError::Nix(nix::errno::Errno::EACCES).raw_os_error(),
            Some(libc::EACCES)
        );
    }
}
