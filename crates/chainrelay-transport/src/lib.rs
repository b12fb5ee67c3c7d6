//! chainrelay-transport: supervised connections to the relay.
//!
//! # Features
//! - [`TransportSupervisor`]: observer task with bounded linear backoff and
//!   forced close-and-redial after repeated failures
//! - [`Channel`] / [`Connector`] traits, so any transport can be supervised
//! - [`TcpConnector`]: TCP channel multiplexing the relay [`wire`] protocol,
//!   with its own reconnect backoff and a swappable proxy route
//! - [`RelayStub`]: the relay's auth and searcher services over a
//!   supervised [`Connection`]
//! - [`ProxyTunnel`]: HTTP `CONNECT` tunnel with basic proxy auth

pub mod proxy;
pub mod stub;
pub mod supervisor;
pub mod tcp;
pub mod wire;

pub use proxy::{ProxyConfig, ProxyTunnel};
pub use stub::RelayStub;
pub use supervisor::{
    Channel, Connection, ConnectivityState, Connector, SupervisorConfig, TransportSupervisor,
};
pub use tcp::{TcpChannel, TcpConfig, TcpConnector};
pub use wire::{FrameStream, ReplyFrame, RequestFrame};
