//! Events surfaced by the runspace pool state machines
//!
//! Inbound messages mutate pool/pipeline state and enqueue one of these;
//! callers drain them with `next_event()`. No callbacks fire from inside
//! the decoders.

use uuid::Uuid;

use crate::protocol::bodies::{
    ApplicationPrivateData, AvailabilityResponse, ConnectRunspacePool, InformationRecordMsg,
    ProgressRecordMsg, RunspacePoolInitData, SessionCapability, UserEvent,
};
use crate::protocol::command::{GetMetadata, PowerShell};
use crate::protocol::enums::{HostMethodIdentifier, PsInvocationState, RunspacePoolState};
use crate::protocol::records::{ErrorRecord, InformationalRecord};
use crate::value::PsValue;

/// An event produced by a pool or one of its pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct PsrpEvent {
    pub runspace_pool_id: Uuid,
    /// Set when the event belongs to a pipeline.
    pub pipeline_id: Option<Uuid>,
    pub kind: EventKind,
}

impl PsrpEvent {
    pub(crate) fn pool(runspace_pool_id: Uuid, kind: EventKind) -> Self {
        Self {
            runspace_pool_id,
            pipeline_id: None,
            kind,
        }
    }

    pub(crate) fn pipeline(runspace_pool_id: Uuid, pipeline_id: Uuid, kind: EventKind) -> Self {
        Self {
            runspace_pool_id,
            pipeline_id: Some(pipeline_id),
            kind,
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// The peer's SESSION_CAPABILITY arrived.
    SessionCapability(SessionCapability),
    /// The pool finished its opening handshake.
    PoolOpened,
    /// The pool changed state outside the opening handshake.
    PoolStateChanged {
        state: RunspacePoolState,
        error: Option<ErrorRecord>,
    },
    /// APPLICATION_PRIVATE_DATA arrived from the server.
    ApplicationPrivateData(ApplicationPrivateData),
    /// The server's encrypted session key was installed; SecureStrings
    /// may now be serialized.
    SessionKeyRegistered,
    /// The peer asked this side to start a key exchange.
    PublicKeyRequested,
    /// The client's public key arrived (server side; the response is
    /// queued automatically).
    PublicKeyReceived,
    /// The client asked to initialize the pool (server side).
    InitRunspacePool {
        min_runspaces: i32,
        max_runspaces: i32,
        application_arguments: Vec<(PsValue, PsValue)>,
    },
    /// The client asked to connect to a disconnected pool (server side).
    ConnectRunspacePool(ConnectRunspacePool),
    /// RUNSPACEPOOL_INIT_DATA arrived while reconnecting (client side).
    RunspacePoolInitData(RunspacePoolInitData),
    /// The peer requested a min/max/reset/availability operation that
    /// needs a RUNSPACE_AVAILABILITY answer (server side).
    SetMaxRunspaces { ci: i64, max_runspaces: i32 },
    SetMinRunspaces { ci: i64, min_runspaces: i32 },
    GetAvailableRunspaces { ci: i64 },
    ResetRunspaceState { ci: i64 },
    /// The server answered a ci-correlated pool operation.
    RunspaceAvailability {
        ci: i64,
        response: AvailabilityResponse,
    },
    /// A user-defined engine event.
    UserEvent(UserEvent),

    /// The client created a pipeline (server side).
    CreatePipeline(Box<PowerShell>),
    /// The client asked for command metadata (server side).
    GetCommandMetadata(GetMetadata),
    /// One unit of pipeline input (server side).
    PipelineInput(PsValue),
    /// The input stream was closed (server side).
    EndOfPipelineInput,
    /// One unit of pipeline output (client side).
    PipelineOutput(Option<PsValue>),
    /// A pipeline changed state (client side).
    PipelineStateChanged {
        state: PsInvocationState,
        error: Option<ErrorRecord>,
    },
    /// A record written to one of the side streams (client side).
    ErrorRecord(ErrorRecord),
    DebugRecord(InformationalRecord),
    VerboseRecord(InformationalRecord),
    WarningRecord(InformationalRecord),
    ProgressRecord(ProgressRecordMsg),
    InformationRecord(InformationRecordMsg),

    /// The server asked the client host to run a method.
    HostCall {
        ci: i64,
        method: HostMethodIdentifier,
        parameters: Vec<PsValue>,
    },
    /// The client answered a host call (server side).
    HostResponse {
        ci: i64,
        method: HostMethodIdentifier,
        result: Option<PsValue>,
        error: Option<ErrorRecord>,
    },

    /// A message type this implementation does not know. The raw body
    /// values ride along; the pool is unaffected.
    UnknownMessage {
        message_type: u32,
        data: Vec<PsValue>,
    },
}
