use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("cannot listen on {addr}:{port}")]
    Bind {
        addr: Ipv4Addr,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("poller setup failed")]
    Poll(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}
