//! Linux isolation primitives
//!
//! This module contains the layers applied to the sandboxee before exec:
//! - `namespace` - Linux namespaces (user, pid, mount, net, ipc, uts)
//! - `mounts` - bind mounts and tmpfs inside the mount namespace
//! - `landlock` - filesystem access control
//! - `seccomp` - syscall filter installation

pub mod landlock;
pub mod mounts;
pub mod namespace;
pub mod seccomp;

pub use self::landlock::LandlockConfig;
pub use self::mounts::{MountConfig, MountPlan};
pub use self::namespace::NamespaceConfig;
pub use self::seccomp::Installed;
