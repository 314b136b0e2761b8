mod error;
mod serial;
pub mod tcp;

pub use error::SocketError;
pub use serial::SerialPort;
pub use tcp::{ConnState, TcpAcceptor, TcpClient};

use mio::Token;

/// Hands out unique mio tokens for the lifetime of one poll registry.
#[derive(Debug, Default)]
pub struct TokenAlloc {
    next: usize,
}

impl TokenAlloc {
    #[inline]
    pub fn next(&mut self) -> Token {
        let t = Token(self.next);
        self.next += 1;
        t
    }
}
