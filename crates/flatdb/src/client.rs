//! Blocking client for tests and tools.
//!
//! Requests may be pipelined with [`Client::send`]; responses arrive in
//! completion order, not send order, and are matched by request id.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use flatdb_core::{Operation, PartitionId, Request, Response};

pub struct Client {
    stream: TcpStream,
    next_id: i32,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, next_id: 1 })
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    /// Send `request` without waiting for its response.
    pub fn send(&mut self, request: &Request) -> io::Result<()> {
        self.stream.write_all(&request.encode())
    }

    /// Send raw bytes, e.g. a frame split at an arbitrary offset.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    pub fn recv(&mut self) -> io::Result<Response> {
        Response::read_from(&mut self.stream)
    }

    /// Send one request with a fresh id and wait for its response.
    pub fn call(&mut self, op_code: u8, partition: PartitionId, body: &[u8]) -> io::Result<Response> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.send(&Request::with_op_code(id, op_code, partition, body))?;
        let response = self.recv()?;
        if response.request_id != id {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected response {id}, got {}", response.request_id),
            ));
        }
        Ok(response)
    }

    pub fn read(&mut self, partition: PartitionId, body: &[u8]) -> io::Result<Response> {
        self.call(Operation::Read as u8, partition, body)
    }

    pub fn write(&mut self, partition: PartitionId, body: &[u8]) -> io::Result<Response> {
        self.call(Operation::Write as u8, partition, body)
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}
