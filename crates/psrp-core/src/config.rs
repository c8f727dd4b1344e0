//! Pool configuration
//!
//! Construction-time knobs for client and server runspace pools. The
//! defaults describe a single-runspace pool speaking protocolversion 2.3
//! with a null host, which is what headless automation wants.

use uuid::Uuid;

use crate::protocol::bodies::SessionCapability;
use crate::protocol::enums::{ApartmentState, PsThreadOptions};
use crate::protocol::host::HostInfo;
use crate::registry::TypeRegistry;
use crate::types::{ProtocolVersion, PsVersion};
use crate::value::PsValue;

// ----------------------------------------------------------------------------
// Client pool configuration
// ----------------------------------------------------------------------------

/// Configuration for a client runspace pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_runspaces: i32,
    pub max_runspaces: i32,
    pub apartment_state: ApartmentState,
    pub thread_options: PsThreadOptions,
    /// The hosting application's UI surface; `None` means a null host.
    pub host: Option<HostInfo>,
    /// Arbitrary data surfaced to server pipelines through
    /// `$PSSenderInfo.ApplicationArguments`.
    pub application_arguments: Vec<(PsValue, PsValue)>,
    pub ps_version: PsVersion,
    pub protocol_version: PsVersion,
    pub serialization_version: PsVersion,
    /// Fixed pool id, used when reconnecting to an existing pool.
    pub runspace_pool_id: Option<Uuid>,
    /// Type registry used to rehydrate inbound objects.
    pub registry: TypeRegistry,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_runspaces: 1,
            max_runspaces: 1,
            apartment_state: ApartmentState::Unknown,
            thread_options: PsThreadOptions::Default,
            host: None,
            application_arguments: Vec::new(),
            ps_version: PsVersion::new(2, 0),
            protocol_version: ProtocolVersion::Pwsh5.version(),
            serialization_version: PsVersion::full(1, 1, 0, 1),
            runspace_pool_id: None,
            registry: TypeRegistry::standard(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool sized to the given runspace bounds.
    pub fn with_runspaces(min_runspaces: i32, max_runspaces: i32) -> Self {
        Self {
            min_runspaces,
            max_runspaces,
            ..Self::default()
        }
    }

    pub(crate) fn capability(&self) -> SessionCapability {
        SessionCapability {
            ps_version: self.ps_version,
            protocol_version: self.protocol_version,
            serialization_version: self.serialization_version,
            time_zone: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Server pool configuration
// ----------------------------------------------------------------------------

/// Configuration for a server runspace pool.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Data handed to every client of this pool via
    /// APPLICATION_PRIVATE_DATA.
    pub application_private_data: Vec<(PsValue, PsValue)>,
    pub ps_version: PsVersion,
    pub protocol_version: PsVersion,
    pub serialization_version: PsVersion,
    pub registry: TypeRegistry,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            application_private_data: Vec::new(),
            ps_version: PsVersion::new(2, 0),
            protocol_version: ProtocolVersion::Pwsh5.version(),
            serialization_version: PsVersion::full(1, 1, 0, 1),
            registry: TypeRegistry::standard(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn capability(&self) -> SessionCapability {
        SessionCapability {
            ps_version: self.ps_version,
            protocol_version: self.protocol_version,
            serialization_version: self.serialization_version,
            time_zone: None,
        }
    }
}
