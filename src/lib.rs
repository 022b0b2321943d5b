//! rpiboot-core: USB-boot protocol engine
//!
//! Transforms Raspberry Pi Compute Modules (CM3 family) and Raspberry Pi
//! Zero/CM4 boards from their USB-boot ROM state into mounted USB
//! mass-storage devices, by serving the multi-stage boot protocol the
//! on-chip ROM expects over USB.
//!
//! [`scanner::Scanner`] is the entry point: it watches for boot-capable
//! devices, uploads `bootcode.bin`, then serves the stage-2 loader's file
//! requests until the device re-enumerates as mass storage, reporting
//! progress through an [`events::EventSink`].

pub mod blob;
pub mod boot;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod proto;
pub mod scanner;
pub mod transport;

pub use blob::{BlobLookup, BlobProvider, FilesystemBlobProvider};
pub use config::{Config, ConfigBuilder};
pub use error::{ProtocolError, Result};
pub use events::{CallbackSink, EventSink, Session, SessionInfo};
pub use identity::{classify, device_id, port_id, Classification, Family};
pub use scanner::Scanner;
