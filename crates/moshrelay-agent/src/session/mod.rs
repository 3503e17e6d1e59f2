//! Mosh subprocesses: the local client, the remote server and the launcher
//! that starts the server role.

mod binary;
mod error;
mod handle;
mod launcher;
mod local;
mod remote;

pub use binary::SessionBinary;
pub use error::ProcessError;
pub use handle::ProcessHandle;
pub use launcher::RemoteLauncher;
pub use local::LocalSession;
pub use remote::RemoteSession;
