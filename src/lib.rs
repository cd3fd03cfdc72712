#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod transport;

pub use crate::channel::{Channel, ChannelState};
pub use crate::config::{BinaryType, Config};
pub use crate::error::Error;
pub use crate::transport::{Connection, Frame, Transport, WsTransport};

pub type Result<T> = std::result::Result<T, Error>;
