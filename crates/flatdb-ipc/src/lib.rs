//! Local byte channel over a pair of named pipes.
//!
//! Two FIFOs per channel, created on demand in a shared directory:
//!
//! ```text
//!   <prefix>server.pipe   client ──► server
//!   <prefix>client.pipe   server ──► client
//! ```
//!
//! Raw bytes only: no framing, no dispatch. Opening a FIFO blocks until
//! the other end opens it too, so both roles open the server pipe
//! first and the client pipe second.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("can't mkfifo {path}")]
    Mkfifo {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("can't open pipe {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't read from pipe")]
    Receive(#[source] io::Error),

    #[error("can't write to pipe")]
    Send(#[source] io::Error),

    #[error("can't close pipe {path}")]
    Close {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

/// Which end of the channel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub struct PipeChannel {
    role: Role,
    server_path: PathBuf,
    client_path: PathBuf,
    reader: File,
    writer: File,
}

impl PipeChannel {
    /// Create the pipes if needed and open this role's ends. Blocks
    /// until the peer opens the other ends.
    pub fn open(dir: impl AsRef<Path>, prefix: &str, role: Role) -> Result<Self, IpcError> {
        let dir = dir.as_ref();

        let server_path = make_pipe(&dir.join(format!("{prefix}server.pipe")))?;
        let server_end = open_end(&server_path, role == Role::Server)?;

        let client_path = make_pipe(&dir.join(format!("{prefix}client.pipe")))?;
        let client_end = open_end(&client_path, role == Role::Client)?;

        let (reader, writer) = match role {
            Role::Server => (server_end, client_end),
            Role::Client => (client_end, server_end),
        };
        debug!(?role, server = %server_path.display(), client = %client_path.display(), "pipe channel open");
        Ok(Self {
            role,
            server_path,
            client_path,
            reader,
            writer,
        })
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn server_path(&self) -> &Path {
        &self.server_path
    }

    pub fn client_path(&self) -> &Path {
        &self.client_path
    }

    /// Write all of `bytes` to the peer.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), IpcError> {
        self.writer.write_all(bytes).map_err(IpcError::Send)
    }

    /// Read whatever is available into `buf`, blocking until at least
    /// one byte arrives. `Ok(0)` means the peer closed its end.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, IpcError> {
        loop {
            match self.reader.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IpcError::Receive(e)),
            }
        }
    }

    /// Close both ends. Both are closed even if the first fails; the
    /// first error is returned.
    pub fn close(self) -> Result<(), IpcError> {
        let (read_path, write_path) = match self.role {
            Role::Server => (self.server_path, self.client_path),
            Role::Client => (self.client_path, self.server_path),
        };
        let first = unistd::close(self.reader.into_raw_fd()).map_err(|source| IpcError::Close {
            path: read_path,
            source,
        });
        let second = unistd::close(self.writer.into_raw_fd()).map_err(|source| IpcError::Close {
            path: write_path,
            source,
        });
        first.and(second)
    }
}

/// Create a FIFO at `path` unless something is already there. A peer
/// may create it concurrently, so a failed mkfifo is only an error if
/// the path still does not exist.
fn make_pipe(path: &Path) -> Result<PathBuf, IpcError> {
    if !path.exists() {
        if let Err(source) = unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
            if !path.exists() {
                return Err(IpcError::Mkfifo {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
    Ok(path.to_path_buf())
}

fn open_end(path: &Path, read: bool) -> Result<File, IpcError> {
    OpenOptions::new()
        .read(read)
        .write(!read)
        .open(path)
        .map_err(|source| IpcError::Open {
            path: path.to_path_buf(),
            source,
        })
}
