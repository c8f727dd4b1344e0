//! Client runspace pool and pipelines
//!
//! The client side of the protocol: opens pools, negotiates capability,
//! drives the session key exchange, creates pipelines and streams their
//! input, and answers host calls. All I/O happens through the byte-level
//! `receive_data` / `data_to_send` pair plus the `next_event` pull queue.

use std::collections::HashMap;

use rsa::RsaPrivateKey;
use tracing::debug;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::crypto::{self, CryptoProvider};
use crate::errors::{ProtocolError, PsrpError, Result};
use crate::protocol::bodies::{
    ApplicationPrivateData, AvailabilityResponse, ConnectRunspacePool, CreatePipeline,
    EncryptedSessionKey, GetAvailableRunspaces, HostCall, HostResponse, InformationRecordMsg,
    InitRunspacePool, PipelineStateMsg, ProgressRecordMsg, PublicKey, ResetRunspaceState,
    RunspaceAvailability, RunspacePoolInitData, RunspacePoolStateMsg, SessionCapability,
    SetMaxRunspaces, SetMinRunspaces, UserEvent,
};
use crate::protocol::command::{GetMetadata, PowerShell};
use crate::protocol::enums::{
    ApartmentState, HostMethodIdentifier, PsInvocationState, PsThreadOptions, RunspacePoolState,
};
use crate::protocol::events::{EventKind, PsrpEvent};
use crate::protocol::host::HostInfo;
use crate::protocol::message::{Message, MessageType};
use crate::protocol::pool::{PoolBase, PsrpPayload, StreamType};
use crate::protocol::records::{ErrorRecord, InformationalRecord};
use crate::value::{PsSecureString, PsValue};

/// A copyable reference to a pipeline owned by a pool. All pipeline
/// operations go through the owning pool with this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    id: Uuid,
}

impl PipelineHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// What kind of pipeline a handle refers to.
#[derive(Debug, Clone, PartialEq)]
enum PipelineKind {
    PowerShell(Box<PowerShell>),
    GetMetadata(GetMetadata),
}

#[derive(Debug)]
struct PipelineEntry {
    state: PsInvocationState,
    kind: PipelineKind,
    no_input: bool,
}

/// A pending ci-correlated pool request.
#[derive(Debug, Clone, Copy)]
enum PoolCall {
    SetMax(i32),
    SetMin(i32),
    GetAvailable,
    Reset,
}

// ----------------------------------------------------------------------------
// Client pool
// ----------------------------------------------------------------------------

/// The client side of a runspace pool.
pub struct ClientRunspacePool {
    base: PoolBase,
    apartment_state: ApartmentState,
    thread_options: PsThreadOptions,
    host: Option<HostInfo>,
    application_arguments: Vec<(PsValue, PsValue)>,
    application_private_data: Vec<(PsValue, PsValue)>,
    pipelines: HashMap<Uuid, PipelineEntry>,
    exchange_key: Option<RsaPrivateKey>,
    /// Host calls awaiting a response, by call id.
    host_calls: HashMap<i64, (HostMethodIdentifier, Option<Uuid>)>,
    /// Pool operations awaiting a RUNSPACE_AVAILABILITY answer.
    pool_calls: HashMap<i64, PoolCall>,
}

impl ClientRunspacePool {
    pub fn new(config: PoolConfig) -> Self {
        let capability = config.capability();
        let runspace_pool_id = config.runspace_pool_id.unwrap_or_else(Uuid::new_v4);
        let mut base = PoolBase::new(runspace_pool_id, capability, config.registry, true);
        base.min_runspaces = config.min_runspaces;
        base.max_runspaces = config.max_runspaces;

        Self {
            base,
            apartment_state: config.apartment_state,
            thread_options: config.thread_options,
            host: config.host,
            application_arguments: config.application_arguments,
            application_private_data: Vec::new(),
            pipelines: HashMap::new(),
            exchange_key: None,
            host_calls: HashMap::new(),
            pool_calls: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.base.runspace_pool_id
    }

    pub fn state(&self) -> RunspacePoolState {
        self.base.state
    }

    pub fn min_runspaces(&self) -> i32 {
        self.base.min_runspaces
    }

    pub fn max_runspaces(&self) -> i32 {
        self.base.max_runspaces
    }

    /// The server's APPLICATION_PRIVATE_DATA, populated once opened.
    pub fn application_private_data(&self) -> &[(PsValue, PsValue)] {
        &self.application_private_data
    }

    /// The peer capability, populated after negotiation.
    pub fn their_capability(&self) -> Option<&SessionCapability> {
        self.base.their_capability.as_ref()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the pool: emits SESSION_CAPABILITY then INIT_RUNSPACEPOOL and
    /// moves to `NegotiationSent`.
    pub fn open(&mut self) -> Result<()> {
        if self.base.state == RunspacePoolState::Opened {
            return Ok(());
        }
        if self.base.state != RunspacePoolState::BeforeOpen {
            return Err(PsrpError::invalid_transition("open the pool", self.base.state));
        }

        self.base.change_state(RunspacePoolState::NegotiationSent);
        let capability = self.base.our_capability.to_value();
        self.base.prepare(
            MessageType::SessionCapability,
            Some(&capability),
            None,
            StreamType::Default,
        )?;

        let init = InitRunspacePool {
            min_runspaces: self.base.min_runspaces,
            max_runspaces: self.base.max_runspaces,
            thread_options: self.thread_options,
            apartment_state: self.apartment_state,
            host_info: self.host.clone().unwrap_or_default(),
            application_arguments: self.application_arguments.clone(),
        };
        self.base.prepare(
            MessageType::InitRunspacePool,
            Some(&init.to_value()),
            None,
            StreamType::Default,
        )
    }

    /// Connect to a disconnected pool on the peer.
    pub fn connect(&mut self) -> Result<()> {
        if self.base.state == RunspacePoolState::Opened {
            return Ok(());
        }
        if !matches!(
            self.base.state,
            RunspacePoolState::BeforeOpen | RunspacePoolState::Disconnected
        ) {
            return Err(PsrpError::invalid_transition(
                "connect to the pool",
                self.base.state,
            ));
        }

        self.base.change_state(RunspacePoolState::Connecting);
        let capability = self.base.our_capability.to_value();
        self.base.prepare(
            MessageType::SessionCapability,
            Some(&capability),
            None,
            StreamType::Default,
        )?;
        self.base.prepare(
            MessageType::ConnectRunspacePool,
            Some(&ConnectRunspacePool::default().to_value()),
            None,
            StreamType::Default,
        )
    }

    /// Close the pool. Pipelines that are still live are forcibly moved
    /// to `Stopped` first.
    pub fn close(&mut self) -> Result<()> {
        if self.base.state == RunspacePoolState::Closed {
            return Ok(());
        }
        if self.base.state == RunspacePoolState::Broken {
            return Err(PsrpError::invalid_transition("close the pool", self.base.state));
        }

        self.base.change_state(RunspacePoolState::Closing);
        let pool_id = self.base.runspace_pool_id;
        for (pipeline_id, entry) in self.pipelines.iter_mut() {
            if !entry.state.is_terminal() {
                entry.state = PsInvocationState::Stopped;
                self.base.events.push_back(PsrpEvent::pipeline(
                    pool_id,
                    *pipeline_id,
                    EventKind::PipelineStateChanged {
                        state: PsInvocationState::Stopped,
                        error: None,
                    },
                ));
            }
        }

        self.base.change_state(RunspacePoolState::Closed);
        self.base.push_event(PsrpEvent::pool(
            pool_id,
            EventKind::PoolStateChanged {
                state: RunspacePoolState::Closed,
                error: None,
            },
        ));
        let abandoned = self.base.reset_receive_state();
        if !abandoned.is_empty() {
            debug!(?abandoned, "closed pool with unterminated inbound objects");
        }
        Ok(())
    }

    /// Mark the pool disconnected. Pure state tracking; the transport
    /// performs the actual disconnect.
    pub fn disconnect(&mut self) -> Result<()> {
        if !matches!(
            self.base.state,
            RunspacePoolState::Opened | RunspacePoolState::Disconnected
        ) {
            return Err(PsrpError::invalid_transition(
                "disconnect the pool",
                self.base.state,
            ));
        }
        self.base.change_state(RunspacePoolState::Disconnected);
        let pool_id = self.base.runspace_pool_id;
        self.base.push_event(PsrpEvent::pool(
            pool_id,
            EventKind::PoolStateChanged {
                state: RunspacePoolState::Disconnected,
                error: None,
            },
        ));
        Ok(())
    }

    /// Mark a disconnected pool opened again after the transport
    /// reconnects.
    pub fn reconnect(&mut self) -> Result<()> {
        if !matches!(
            self.base.state,
            RunspacePoolState::Disconnected | RunspacePoolState::Opened
        ) {
            return Err(PsrpError::invalid_transition(
                "reconnect the pool",
                self.base.state,
            ));
        }
        self.base.change_state(RunspacePoolState::Opened);
        let pool_id = self.base.runspace_pool_id;
        self.base.push_event(PsrpEvent::pool(
            pool_id,
            EventKind::PoolStateChanged {
                state: RunspacePoolState::Opened,
                error: None,
            },
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pool operations
    // ------------------------------------------------------------------

    /// Start the session key exchange. A no-op when already requested.
    pub fn exchange_key(&mut self) -> Result<()> {
        if self.base.key_requested {
            return Ok(());
        }
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition(
                "start the key exchange",
                self.base.state,
            ));
        }

        let (private, blob) = crypto::generate_exchange_key()?;
        self.exchange_key = Some(private);
        let public_key = PublicKey {
            public_key: {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine as _;
                STANDARD.encode(blob)
            },
        };
        self.base.prepare(
            MessageType::PublicKey,
            Some(&public_key.to_value()),
            None,
            StreamType::Default,
        )?;
        self.base.key_requested = true;
        Ok(())
    }

    /// Ask the server how many runspaces are free. Returns the call id
    /// answered by a `RunspaceAvailability` event.
    pub fn get_available_runspaces(&mut self) -> Result<i64> {
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition(
                "get available runspaces",
                self.base.state,
            ));
        }
        let ci = self.base.next_ci();
        self.pool_calls.insert(ci, PoolCall::GetAvailable);
        self.base.prepare(
            MessageType::GetAvailableRunspaces,
            Some(&GetAvailableRunspaces { ci }.to_value()),
            None,
            StreamType::Default,
        )?;
        Ok(ci)
    }

    /// Change the pool's maximum runspace count. Before the pool opens
    /// this applies locally; afterwards it round-trips to the server and
    /// the returned call id correlates the answer.
    pub fn set_max_runspaces(&mut self, value: i32) -> Result<Option<i64>> {
        if self.base.state == RunspacePoolState::BeforeOpen || self.base.max_runspaces == value {
            self.base.max_runspaces = value;
            return Ok(None);
        }
        let ci = self.base.next_ci();
        self.pool_calls.insert(ci, PoolCall::SetMax(value));
        self.base.prepare(
            MessageType::SetMaxRunspaces,
            Some(&SetMaxRunspaces { max_runspaces: value, ci }.to_value()),
            None,
            StreamType::Default,
        )?;
        Ok(Some(ci))
    }

    /// Change the pool's minimum runspace count; see
    /// [`set_max_runspaces`](Self::set_max_runspaces).
    pub fn set_min_runspaces(&mut self, value: i32) -> Result<Option<i64>> {
        if self.base.state == RunspacePoolState::BeforeOpen || self.base.min_runspaces == value {
            self.base.min_runspaces = value;
            return Ok(None);
        }
        let ci = self.base.next_ci();
        self.pool_calls.insert(ci, PoolCall::SetMin(value));
        self.base.prepare(
            MessageType::SetMinRunspaces,
            Some(&SetMinRunspaces { min_runspaces: value, ci }.to_value()),
            None,
            StreamType::Default,
        )?;
        Ok(Some(ci))
    }

    /// Reset the pool's runspace state. Requires a protocolversion 2.3
    /// peer.
    pub fn reset_runspace_state(&mut self) -> Result<i64> {
        self.base
            .require_peer_version(crate::types::ProtocolVersion::Pwsh5.version())?;
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition(
                "reset runspace state",
                self.base.state,
            ));
        }
        let ci = self.base.next_ci();
        self.pool_calls.insert(ci, PoolCall::Reset);
        self.base.prepare(
            MessageType::ResetRunspaceState,
            Some(&ResetRunspaceState { ci }.to_value()),
            None,
            StreamType::Default,
        )?;
        Ok(ci)
    }

    /// Answer a host call previously surfaced as a `HostCall` event.
    pub fn host_response(
        &mut self,
        ci: i64,
        result: Option<PsValue>,
        error: Option<ErrorRecord>,
    ) -> Result<()> {
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition(
                "respond to a host call",
                self.base.state,
            ));
        }
        let (method, pipeline_id) = self
            .host_calls
            .get(&ci)
            .copied()
            .ok_or(ProtocolError::UnknownHostCall { call_id: ci })?;

        let response = HostResponse {
            ci,
            method,
            result,
            error,
        };
        let message_type = if pipeline_id.is_some() {
            MessageType::PipelineHostResponse
        } else {
            MessageType::RunspacePoolHostResponse
        };
        self.base.prepare(
            message_type,
            Some(&response.to_value()),
            pipeline_id,
            StreamType::PromptResponse,
        )?;
        // Only drop the record once the response is queued; serialization
        // failures leave it answerable.
        self.host_calls.remove(&ci);
        Ok(())
    }

    /// Decrypt a SecureString received from the server.
    pub fn decrypt_secure_string(&self, value: &PsSecureString) -> Result<String> {
        match value {
            PsSecureString::Plaintext(plain) => Ok(plain.clone()),
            PsSecureString::Encrypted(cipher) => self.base.crypto.decrypt(cipher),
        }
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Register a new PowerShell pipeline. Nothing goes on the wire until
    /// the pipeline is started.
    pub fn create_pipeline(&mut self, powershell: PowerShell) -> Result<PipelineHandle> {
        let id = Uuid::new_v4();
        debug!(pipeline_id = %id, "creating pipeline");
        let no_input = powershell.no_input;
        self.pipelines.insert(
            id,
            PipelineEntry {
                state: PsInvocationState::NotStarted,
                kind: PipelineKind::PowerShell(Box::new(powershell)),
                no_input,
            },
        );
        Ok(PipelineHandle { id })
    }

    /// Register a command-metadata pipeline. Requires a peer that speaks
    /// GET_COMMAND_METADATA natively (protocolversion 2.1+).
    pub fn create_metadata_pipeline(&mut self, query: GetMetadata) -> Result<PipelineHandle> {
        self.base
            .require_peer_version(crate::types::ProtocolVersion::Win7Rtm.version())?;
        let id = Uuid::new_v4();
        self.pipelines.insert(
            id,
            PipelineEntry {
                state: PsInvocationState::NotStarted,
                kind: PipelineKind::GetMetadata(query),
                no_input: true,
            },
        );
        Ok(PipelineHandle { id })
    }

    /// Borrow a pipeline surface for the given handle.
    pub fn pipeline(&mut self, handle: PipelineHandle) -> Result<ClientPipeline<'_>> {
        if !self.pipelines.contains_key(&handle.id) {
            return Err(PsrpError::unknown_pipeline(handle.id));
        }
        Ok(ClientPipeline {
            pool: self,
            id: handle.id,
        })
    }

    /// The state of a pipeline owned by this pool.
    pub fn pipeline_state(&self, handle: PipelineHandle) -> Option<PsInvocationState> {
        self.pipelines.get(&handle.id).map(|entry| entry.state)
    }

    // ------------------------------------------------------------------
    // Byte pipeline
    // ------------------------------------------------------------------

    pub fn receive_data(&mut self, data: &[u8]) {
        self.base.receive_data(data);
    }

    pub fn data_to_send(&mut self, max_fragment_size: Option<usize>) -> Option<PsrpPayload> {
        self.base.data_to_send(max_fragment_size)
    }

    /// Process buffered data and return the next protocol event.
    ///
    /// A peer-driven protocol violation on a pool-scoped message moves
    /// the pool to `Broken`; codec and dispatch failures drop the
    /// offending message and leave the pool usable.
    pub fn next_event(&mut self) -> Result<Option<PsrpEvent>> {
        if let Some(event) = self.base.pop_event() {
            return Ok(Some(event));
        }
        while let Some(message) = self.base.next_message()? {
            match self.process_message(&message) {
                Ok(()) => {}
                Err(err) => {
                    if message.pipeline_id.is_none()
                        && matches!(
                            err,
                            PsrpError::Protocol(ProtocolError::ProtocolViolation { .. })
                        )
                    {
                        self.base.mark_broken(None);
                    }
                    return Err(err);
                }
            }
            if let Some(event) = self.base.pop_event() {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn process_message(&mut self, message: &Message) -> Result<()> {
        let pool_id = self.base.runspace_pool_id;

        let Some(message_type) = message.known_type() else {
            let data = self.base.decode_body(message)?;
            self.base.push_event(PsrpEvent {
                runspace_pool_id: pool_id,
                pipeline_id: message.pipeline_id,
                kind: EventKind::UnknownMessage {
                    message_type: message.message_type,
                    data,
                },
            });
            return Ok(());
        };

        match message_type {
            MessageType::SessionCapability => {
                let body = self.base.decode_single(message)?;
                let capability = SessionCapability::from_value(&body)?;
                self.base.check_peer_capability(&capability)?;
                if self.base.state == RunspacePoolState::NegotiationSent {
                    self.base
                        .change_state(RunspacePoolState::NegotiationSucceeded);
                }
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::SessionCapability(capability),
                ));
            }
            MessageType::RunspacePoolState => {
                let body = self.base.decode_single(message)?;
                let state_msg = RunspacePoolStateMsg::from_value(&body)?;
                let opening = matches!(
                    self.base.state,
                    RunspacePoolState::NegotiationSent
                        | RunspacePoolState::NegotiationSucceeded
                        | RunspacePoolState::Connecting
                );
                self.base.change_state(state_msg.state);
                let kind = if state_msg.state == RunspacePoolState::Opened && opening {
                    EventKind::PoolOpened
                } else {
                    EventKind::PoolStateChanged {
                        state: state_msg.state,
                        error: state_msg.error,
                    }
                };
                self.base.push_event(PsrpEvent::pool(pool_id, kind));
            }
            MessageType::ApplicationPrivateData => {
                let body = self.base.decode_single(message)?;
                let data = ApplicationPrivateData::from_value(&body)?;
                self.application_private_data = data.data.clone();
                if self.base.state == RunspacePoolState::Connecting {
                    // The connect handshake has no RUNSPACEPOOL_STATE; the
                    // private data message completes it.
                    self.base.change_state(RunspacePoolState::Opened);
                    self.base
                        .push_event(PsrpEvent::pool(pool_id, EventKind::PoolOpened));
                }
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::ApplicationPrivateData(data),
                ));
            }
            MessageType::RunspacePoolInitData => {
                let body = self.base.decode_single(message)?;
                let init = RunspacePoolInitData::from_value(&body)?;
                self.base.min_runspaces = init.min_runspaces;
                self.base.max_runspaces = init.max_runspaces;
                self.base
                    .push_event(PsrpEvent::pool(pool_id, EventKind::RunspacePoolInitData(init)));
            }
            MessageType::EncryptedSessionKey => {
                let body = self.base.decode_single(message)?;
                let encrypted = EncryptedSessionKey::from_value(&body)?;
                let private = self.exchange_key.as_ref().ok_or_else(|| {
                    ProtocolError::violation("ENCRYPTED_SESSION_KEY without a pending exchange")
                })?;
                let blob = {
                    use base64::engine::general_purpose::STANDARD;
                    use base64::Engine as _;
                    STANDARD
                        .decode(encrypted.encrypted_session_key.trim())
                        .map_err(|e| ProtocolError::violation(e.to_string()))?
                };
                let session_key = crypto::decrypt_session_key(private, &blob)?;
                self.base.crypto.register_session_key(&session_key)?;
                self.base
                    .push_event(PsrpEvent::pool(pool_id, EventKind::SessionKeyRegistered));
            }
            MessageType::PublicKeyRequest => {
                self.exchange_key()?;
                self.base
                    .push_event(PsrpEvent::pool(pool_id, EventKind::PublicKeyRequested));
            }
            MessageType::RunspaceAvailability => {
                let body = self.base.decode_single(message)?;
                let availability = RunspaceAvailability::from_value(&body)?;
                if let Some(call) = self.pool_calls.remove(&availability.ci) {
                    if availability.response == AvailabilityResponse::Success(true) {
                        match call {
                            PoolCall::SetMax(value) => self.base.max_runspaces = value,
                            PoolCall::SetMin(value) => self.base.min_runspaces = value,
                            PoolCall::GetAvailable | PoolCall::Reset => {}
                        }
                    }
                }
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::RunspaceAvailability {
                        ci: availability.ci,
                        response: availability.response,
                    },
                ));
            }
            MessageType::UserEvent => {
                let body = self.base.decode_single(message)?;
                let event = UserEvent::from_value(&body)?;
                self.base
                    .push_event(PsrpEvent::pool(pool_id, EventKind::UserEvent(event)));
            }
            MessageType::RunspacePoolHostCall | MessageType::PipelineHostCall => {
                let body = self.base.decode_single(message)?;
                let call = HostCall::from_value(&body)?;
                if message_type == MessageType::PipelineHostCall {
                    self.require_pipeline(message)?;
                }
                if call.ci != -100 {
                    // -100 marks a void method that never gets a response.
                    self.host_calls
                        .insert(call.ci, (call.method, message.pipeline_id));
                }
                self.base.push_event(PsrpEvent {
                    runspace_pool_id: pool_id,
                    pipeline_id: message.pipeline_id,
                    kind: EventKind::HostCall {
                        ci: call.ci,
                        method: call.method,
                        parameters: call.parameters,
                    },
                });
            }
            MessageType::PipelineOutput => {
                let pipeline_id = self.require_pipeline(message)?;
                let value = if message.data.is_empty() {
                    None
                } else {
                    Some(self.base.decode_single(message)?)
                };
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::PipelineOutput(value),
                ));
            }
            MessageType::PipelineState => {
                let pipeline_id = self.require_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let state_msg = PipelineStateMsg::from_value(&body)?;
                if let Some(entry) = self.pipelines.get_mut(&pipeline_id) {
                    entry.state = state_msg.state;
                }
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::PipelineStateChanged {
                        state: state_msg.state,
                        error: state_msg.error,
                    },
                ));
            }
            MessageType::ErrorRecord => {
                let pipeline_id = self.require_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let record = ErrorRecord::from_value(&body)?;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::ErrorRecord(record),
                ));
            }
            MessageType::DebugRecord | MessageType::VerboseRecord | MessageType::WarningRecord => {
                let pipeline_id = self.require_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let record = InformationalRecord::from_value(&body)?;
                let kind = match message_type {
                    MessageType::DebugRecord => EventKind::DebugRecord(record),
                    MessageType::VerboseRecord => EventKind::VerboseRecord(record),
                    _ => EventKind::WarningRecord(record),
                };
                self.base
                    .push_event(PsrpEvent::pipeline(pool_id, pipeline_id, kind));
            }
            MessageType::ProgressRecord => {
                let pipeline_id = self.require_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let record = ProgressRecordMsg::from_value(&body)?;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::ProgressRecord(record),
                ));
            }
            MessageType::InformationRecord => {
                let pipeline_id = self.require_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let record = InformationRecordMsg::from_value(&body)?;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::InformationRecord(record),
                ));
            }
            other => {
                return Err(ProtocolError::violation(format!(
                    "{other:?} is not valid on the client side"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn require_pipeline(&self, message: &Message) -> Result<Uuid> {
        let pipeline_id = message.pipeline_id.ok_or_else(|| {
            ProtocolError::violation("pipeline message without a pipeline id")
        })?;
        if !self.pipelines.contains_key(&pipeline_id) {
            return Err(PsrpError::unknown_pipeline(pipeline_id));
        }
        Ok(pipeline_id)
    }
}

// ----------------------------------------------------------------------------
// Client pipeline surface
// ----------------------------------------------------------------------------

/// A borrowed view of one client pipeline.
pub struct ClientPipeline<'a> {
    pool: &'a mut ClientRunspacePool,
    id: Uuid,
}

impl ClientPipeline<'_> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PsInvocationState {
        self.pool.pipelines[&self.id].state
    }

    /// Start the pipeline on the server: emits CREATE_PIPELINE (or
    /// GET_COMMAND_METADATA) and moves to `Running`.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            PsInvocationState::NotStarted
                | PsInvocationState::Stopped
                | PsInvocationState::Completed
        ) {
            return Err(PsrpError::invalid_transition("start the pipeline", state));
        }

        let their_version = self.pool.base.their_protocol_version();
        let apartment_state = self.pool.apartment_state;
        let (message_type, body) = {
            let entry = self.pool.pipelines.get(&self.id).expect("checked");
            match &entry.kind {
                PipelineKind::PowerShell(powershell) => {
                    let create = CreatePipeline {
                        powershell: (**powershell).clone(),
                    };
                    (
                        MessageType::CreatePipeline,
                        create.to_value(apartment_state, their_version)?,
                    )
                }
                PipelineKind::GetMetadata(query) => {
                    (MessageType::GetCommandMetadata, query.to_value())
                }
            }
        };

        self.pool.base.prepare(
            message_type,
            Some(&body),
            Some(self.id),
            StreamType::Default,
        )?;
        let entry = self.pool.pipelines.get_mut(&self.id).expect("checked");
        entry.state = PsInvocationState::Running;
        Ok(())
    }

    /// Stream one input value into the pipeline.
    pub fn send_input(&mut self, value: PsValue) -> Result<()> {
        let entry = self.pool.pipelines.get(&self.id).expect("checked");
        if entry.state != PsInvocationState::Running {
            return Err(PsrpError::invalid_transition("send pipeline input", entry.state));
        }
        if entry.no_input {
            return Err(ProtocolError::violation(
                "pipeline was created with no_input and accepts no input",
            )
            .into());
        }
        self.pool.base.prepare(
            MessageType::PipelineInput,
            Some(&value),
            Some(self.id),
            StreamType::Default,
        )
    }

    /// Mark the end of the input stream.
    pub fn close_input(&mut self) -> Result<()> {
        let entry = self.pool.pipelines.get(&self.id).expect("checked");
        if entry.state != PsInvocationState::Running {
            return Err(PsrpError::invalid_transition(
                "close pipeline input",
                entry.state,
            ));
        }
        // END_OF_PIPELINE_INPUT has no body at all.
        self.pool
            .base
            .prepare(MessageType::EndOfPipelineInput, None, Some(self.id), StreamType::Default)
    }

    /// Mark the pipeline as stopping. The stop itself travels out of
    /// band through the transport; the server still answers with
    /// PIPELINE_STATE=Stopped.
    pub fn begin_stop(&mut self) -> Result<()> {
        let entry = self.pool.pipelines.get_mut(&self.id).expect("checked");
        if !matches!(
            entry.state,
            PsInvocationState::Running | PsInvocationState::Stopping
        ) {
            return Err(PsrpError::invalid_transition("stop the pipeline", entry.state));
        }
        entry.state = PsInvocationState::Stopping;
        Ok(())
    }

    /// Answer a host call addressed to this pipeline.
    pub fn host_response(
        &mut self,
        ci: i64,
        result: Option<PsValue>,
        error: Option<ErrorRecord>,
    ) -> Result<()> {
        self.pool.host_response(ci, result, error)
    }

    /// Remove a finished pipeline from the pool.
    pub fn close(self) -> Result<()> {
        let entry = self.pool.pipelines.get(&self.id).expect("checked");
        if !matches!(
            entry.state,
            PsInvocationState::NotStarted
                | PsInvocationState::Stopping
                | PsInvocationState::Stopped
                | PsInvocationState::Completed
                | PsInvocationState::Failed
        ) {
            return Err(PsrpError::invalid_transition("close the pipeline", entry.state));
        }
        self.pool.pipelines.remove(&self.id);
        Ok(())
    }
}
