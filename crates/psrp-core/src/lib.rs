//! PSRP Core Protocol Implementation
//!
//! This crate is a sans-I/O implementation of the PowerShell Remoting
//! Protocol (MS-PSRP): the wire protocol by which a client creates a pool
//! of execution contexts (a *runspace pool*) on a server, submits ordered
//! chains of commands (*pipelines*), and streams back results, records
//! and host calls.
//!
//! ## Architecture Overview
//!
//! The crate deliberately performs no I/O, spawns no processes and runs
//! no PowerShell. It speaks bytes on one side and typed events on the
//! other; transports (WSMan, SSH, named pipes, in-process loops) live in
//! separate crates and drive it through three calls:
//!
//! * [`receive_data`](ClientRunspacePool::receive_data): feed bytes read
//!   from the transport.
//! * [`data_to_send`](ClientRunspacePool::data_to_send): drain bytes the
//!   pool wants written, fragmented to the transport's frame size.
//! * [`next_event`](ClientRunspacePool::next_event): pull the next typed
//!   [`PsrpEvent`].
//!
//! Internally three subsystems stack on each other:
//!
//! * **CLIXML codec** ([`clixml`]): bidirectional serialization between
//!   the tagged [`PsValue`] model and PowerShell's CLIXML dialect, with
//!   reference/type-name deduplication tables and SecureString
//!   encryption hooks.
//! * **Message layer and fragmenter** ([`protocol::message`],
//!   [`protocol::fragment`]): the 40-byte message framing and the
//!   21-byte fragment framing that chops messages into ordered,
//!   reassemblable chunks.
//! * **State machines** ([`protocol::client`], [`protocol::server`]):
//!   one per side of a pool and its pipelines, driving capability
//!   negotiation, the session key exchange, lifecycle transitions and
//!   inbound dispatch.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use psrp_core::{ClientRunspacePool, Command, PoolConfig, PowerShell};
//!
//! # fn main() -> psrp_core::Result<()> {
//! let mut pool = ClientRunspacePool::new(PoolConfig::default());
//! pool.open()?;
//!
//! // Hand the opening handshake to the transport.
//! while let Some(payload) = pool.data_to_send(Some(32_768)) {
//!     // transport.write(&payload.data)
//!     # let _ = payload;
//! }
//!
//! // Feed transport reads back and drain events.
//! // pool.receive_data(&bytes);
//! while let Some(event) = pool.next_event()? {
//!     println!("{event:?}");
//! }
//!
//! let handle = pool.create_pipeline(
//!     PowerShell::new().add_command(Command::new("Get-Process")),
//! )?;
//! pool.pipeline(handle)?.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! The core is single threaded and never blocks, yields or sleeps. A
//! pool and its pipelines are not safe for concurrent mutation; callers
//! serialize access with whatever concurrency structure suits their
//! transport.

// ----------------------------------------------------------------------------
// Module declarations
// ----------------------------------------------------------------------------

pub mod clixml;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod protocol;
pub mod registry;
pub mod types;
pub mod value;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use clixml::{
    deserialize_clixml, deserialize_clixml_with, serialize_clixml, serialize_clixml_with,
};
pub use config::{PoolConfig, ServerConfig};
pub use crypto::{CryptoProvider, SessionCrypto};
pub use errors::{
    CryptoError, FragmentError, ProtocolError, PsrpError, Result, SerializationError,
};
pub use protocol::client::{ClientPipeline, ClientRunspacePool, PipelineHandle};
pub use protocol::command::{Command, GetMetadata, PowerShell};
pub use protocol::enums::{
    ApartmentState, ErrorCategory, HostMethodIdentifier, PipelineResultTypes, ProgressRecordType,
    PsInvocationState, PsThreadOptions, RemoteStreamOptions, RunspacePoolState,
};
pub use protocol::events::{EventKind, PsrpEvent};
pub use protocol::host::{HostDefaultData, HostInfo};
pub use protocol::pool::{PsrpPayload, StreamType};
pub use protocol::records::{ErrorCategoryInfo, ErrorRecord, InformationalRecord, NetException};
pub use protocol::server::{ServerPipeline, ServerRunspacePool};
pub use registry::{Registration, TypeRegistry, TypeShape};
pub use types::{Destination, ProtocolVersion, PsVersion};
pub use value::{
    Container, DateTimeKind, PsDateTime, PsDuration, PsEnum, PsObject, PsSecureString, PsString,
    PsValue,
};

/// Create the client side of a runspace pool.
pub fn new_client_pool(config: PoolConfig) -> ClientRunspacePool {
    ClientRunspacePool::new(config)
}

/// Create the server side of a runspace pool.
pub fn new_server_pool(config: ServerConfig) -> ServerRunspacePool {
    ServerRunspacePool::new(config)
}
