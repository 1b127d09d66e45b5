//! # XLink - Edge Media and Telemetry Transport
//!
//! XLink moves two kinds of payload across an unreliable local network:
//!
//! - **Media frames**: large, regenerated continuously, loss tolerant. Sent as
//!   CRC32-checked chunks over UDP and reassembled on the receiver.
//! - **Documents**: small telemetry/control mappings, BSON encoded and sent
//!   whole, either on the datagram socket or over topic pub/sub.
//!
//! Long-running streaming loops run under a [`Supervisor`] that retries
//! transient failures with exponential backoff and jitter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! │        media source / sink, telemetry, preview           │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Supervision Layer                     │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐    │
//! │  │ Supervisor  │ │   Backoff   │ │   Escalation    │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘    │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Channel Layer                         │
//! │  ┌──────────────────────────┐ ┌─────────────────────┐   │
//! │  │ DatagramChannel          │ │ PubSubChannel       │   │
//! │  │  → FrameReassembler      │ │  roles, topics,     │   │
//! │  │  → FrameSlot             │ │  templates          │   │
//! │  └──────────────────────────┘ └─────────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Wire Layer                            │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐    │
//! │  │ Chunk+CRC32 │ │ BSON docs   │ │ Length-prefixed │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘    │
//! ├─────────────────────────────────────────────────────────┤
//! │                 tokio UDP / TCP sockets                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use xlink::{Channel, DatagramChannel, Document, TransportConfig};
//!
//! # async fn run() -> xlink::Result<()> {
//! let mut channel = DatagramChannel::with_config(
//!     TransportConfig::new()
//!         .with("host", "192.168.1.20")
//!         .with("port", 9999)
//!         .with("bufferSize", 65535),
//! )?;
//! channel.connect().await?;
//!
//! let jpeg: Vec<u8> = vec![0xFF, 0xD8, 0xFF, 0xD9];
//! channel.send_frame(&jpeg).await?;
//! channel.send_document(&Document::new().with("sensor_id", "T1")).await?;
//!
//! channel.disconnect().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod reliable;

// Re-export commonly used types
pub use channel::{
    Channel, ChannelState, DatagramChannel, Delivery, HandlerResult, Message, PubSubChannel, Role,
};
pub use config::{ConfigFile, OptionValue, TransportConfig};
pub use core::{Crc32, Document, Framing};
pub use error::{Error, ErrorKind, Result};
pub use reliable::{
    Escalation, Frame, FrameReassembler, FrameSlot, Progress, Supervisor, SupervisorConfig,
};

/// Default receive buffer and maximum datagram size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Buffer size commonly configured for media streams.
pub const MEDIA_BUFFER_SIZE: usize = 65535;
