mod acceptor;
mod client;

pub use acceptor::TcpAcceptor;
pub use client::{ConnState, TcpClient};
