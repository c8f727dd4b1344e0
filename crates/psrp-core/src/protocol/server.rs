//! Server runspace pool and pipelines
//!
//! The server side of the protocol: answers capability negotiation,
//! holds the AES session key, instantiates pipelines requested by the
//! client and streams their output, records and host calls back.

use std::collections::HashMap;

use rand::RngCore;
use tracing::debug;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::crypto::{self, CryptoProvider, SESSION_KEY_LEN};
use crate::errors::{ProtocolError, PsrpError, Result};
use crate::protocol::bodies::{
    ApplicationPrivateData, AvailabilityResponse, ConnectRunspacePool, CreatePipeline,
    EncryptedSessionKey, GetAvailableRunspaces, HostCall, HostResponse, InformationRecordMsg,
    InitRunspacePool, PipelineStateMsg, ProgressRecordMsg, PublicKey, PublicKeyRequest,
    ResetRunspaceState, RunspaceAvailability, RunspacePoolInitData, RunspacePoolStateMsg,
    SessionCapability, SetMaxRunspaces, SetMinRunspaces, UserEvent,
};
use crate::protocol::command::GetMetadata;
use crate::protocol::enums::{
    ApartmentState, HostMethodIdentifier, ProgressRecordType, PsInvocationState, PsThreadOptions,
    RunspacePoolState,
};
use crate::protocol::events::{EventKind, PsrpEvent};
use crate::protocol::host::HostInfo;
use crate::protocol::message::{Message, MessageType};
use crate::protocol::pool::{PoolBase, PsrpPayload, StreamType};
use crate::protocol::records::{ErrorRecord, InformationalKind, InformationalRecord};
use crate::types::ProtocolVersion;
use crate::value::{PsDateTime, PsSecureString, PsValue};

/// What a pending ci on the server expects as its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAvailability {
    /// Set/reset requests answer with a bool.
    Flag,
    /// GET_AVAILABLE_RUNSPACES answers with a count.
    Count,
}

#[derive(Debug)]
struct ServerPipelineEntry {
    state: PsInvocationState,
    no_input: bool,
}

// ----------------------------------------------------------------------------
// Server pool
// ----------------------------------------------------------------------------

/// The server side of a runspace pool.
pub struct ServerRunspacePool {
    base: PoolBase,
    apartment_state: ApartmentState,
    thread_options: PsThreadOptions,
    host: Option<HostInfo>,
    application_arguments: Vec<(PsValue, PsValue)>,
    application_private_data: Vec<(PsValue, PsValue)>,
    pipelines: HashMap<Uuid, ServerPipelineEntry>,
    session_key: [u8; SESSION_KEY_LEN],
    /// ci values issued by this side's host calls, awaiting a response.
    host_calls: HashMap<i64, Option<Uuid>>,
    /// Client requests awaiting a RUNSPACE_AVAILABILITY answer.
    pending_availability: HashMap<i64, PendingAvailability>,
}

impl ServerRunspacePool {
    pub fn new(config: ServerConfig) -> Self {
        let capability = config.capability();
        // The pool id is adopted from the client's first message.
        let mut base = PoolBase::new(Uuid::nil(), capability, config.registry, false);

        let mut session_key = [0u8; SESSION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut session_key);
        base.crypto
            .register_session_key(&session_key)
            .expect("freshly generated key has the right length");

        Self {
            base,
            apartment_state: ApartmentState::Unknown,
            thread_options: PsThreadOptions::Default,
            host: None,
            application_arguments: Vec::new(),
            application_private_data: config.application_private_data,
            pipelines: HashMap::new(),
            session_key,
            host_calls: HashMap::new(),
            pending_availability: HashMap::new(),
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

    /// The client host description received with INIT_RUNSPACEPOOL.
    pub fn client_host(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }

    /// The client's `$PSSenderInfo.ApplicationArguments` payload.
    pub fn application_arguments(&self) -> &[(PsValue, PsValue)] {
        &self.application_arguments
    }

    pub fn their_capability(&self) -> Option<&SessionCapability> {
        self.base.their_capability.as_ref()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Accept a client reconnection to a disconnected pool.
    pub fn connect(&mut self) -> Result<()> {
        if self.base.state == RunspacePoolState::Opened {
            return Ok(());
        }
        if self.base.state != RunspacePoolState::Disconnected {
            return Err(PsrpError::invalid_transition(
                "accept pool connections",
                self.base.state,
            ));
        }
        // The reconnecting client restarts its object id sequence.
        self.base.reset_send_state();
        let abandoned = self.base.reset_receive_state();
        if !abandoned.is_empty() {
            debug!(?abandoned, "reconnect dropped unterminated inbound objects");
        }
        self.base.change_state(RunspacePoolState::Connecting);
        Ok(())
    }

    /// Mark the pool disconnected; pure state tracking for the transport.
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

    /// Close the pool, stopping any live pipelines, and notify the
    /// client.
    pub fn close(&mut self) -> Result<()> {
        if self.base.state == RunspacePoolState::Closed {
            return Ok(());
        }
        if self.base.state == RunspacePoolState::Broken {
            return Err(PsrpError::invalid_transition("close the pool", self.base.state));
        }

        self.change_state_and_notify(RunspacePoolState::Closing, None)?;
        let pipeline_ids: Vec<Uuid> = self
            .pipelines
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for pipeline_id in pipeline_ids {
            self.set_pipeline_state(
                pipeline_id,
                PsInvocationState::Stopped,
                Some(ErrorRecord::pipeline_stopped()),
            )?;
        }
        self.change_state_and_notify(RunspacePoolState::Closed, None)
    }

    /// Mark the pool broken, reporting the reason to the client.
    pub fn set_broken(&mut self, error: ErrorRecord) -> Result<()> {
        if !matches!(
            self.base.state,
            RunspacePoolState::Opened | RunspacePoolState::Broken
        ) {
            return Err(PsrpError::invalid_transition(
                "mark the pool broken",
                self.base.state,
            ));
        }
        self.change_state_and_notify(RunspacePoolState::Broken, Some(error))
    }

    // ------------------------------------------------------------------
    // Pool operations
    // ------------------------------------------------------------------

    /// Ask the client to begin a key exchange. Superseded by client-side
    /// initiation in protocolversion 2.2+, kept for older peers.
    pub fn request_key(&mut self) -> Result<()> {
        if self.base.key_requested {
            return Ok(());
        }
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition(
                "request a key exchange",
                self.base.state,
            ));
        }
        self.base.prepare(
            MessageType::PublicKeyRequest,
            Some(&PublicKeyRequest.to_value()),
            None,
            StreamType::Default,
        )?;
        self.base.key_requested = true;
        Ok(())
    }

    /// Invoke a method on the client host. Returns the call id; void
    /// methods use the sentinel -100 and never produce a response.
    pub fn host_call(
        &mut self,
        method: HostMethodIdentifier,
        parameters: Vec<PsValue>,
        pipeline_id: Option<Uuid>,
    ) -> Result<i64> {
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition("create a host call", self.base.state));
        }
        let ci = if method.is_void() {
            -100
        } else {
            let ci = self.base.next_ci();
            self.host_calls.insert(ci, pipeline_id);
            ci
        };

        let call = HostCall {
            ci,
            method,
            parameters,
        };
        let message_type = if pipeline_id.is_some() {
            MessageType::PipelineHostCall
        } else {
            MessageType::RunspacePoolHostCall
        };
        self.base.prepare(
            message_type,
            Some(&call.to_value()),
            pipeline_id,
            StreamType::PromptResponse,
        )?;
        Ok(ci)
    }

    /// Answer a client request surfaced as a `SetMaxRunspaces`,
    /// `SetMinRunspaces`, `ResetRunspaceState` (bool) or
    /// `GetAvailableRunspaces` (count) event.
    pub fn runspace_availability_response(
        &mut self,
        ci: i64,
        response: AvailabilityResponse,
    ) -> Result<()> {
        let expected = self
            .pending_availability
            .remove(&ci)
            .ok_or(ProtocolError::UnknownHostCall { call_id: ci })?;
        let matches_expectation = matches!(
            (expected, response),
            (PendingAvailability::Flag, AvailabilityResponse::Success(_))
                | (PendingAvailability::Count, AvailabilityResponse::Available(_))
        );
        if !matches_expectation {
            self.pending_availability.insert(ci, expected);
            return Err(ProtocolError::violation(format!(
                "call {ci} expects a {} response",
                match expected {
                    PendingAvailability::Flag => "boolean",
                    PendingAvailability::Count => "count",
                }
            ))
            .into());
        }

        self.base.prepare(
            MessageType::RunspaceAvailability,
            Some(&RunspaceAvailability { response, ci }.to_value()),
            None,
            StreamType::Default,
        )
    }

    /// Raise a user-defined engine event on the client.
    #[allow(clippy::too_many_arguments)]
    pub fn send_event(
        &mut self,
        event_identifier: i32,
        source_identifier: &str,
        sender: PsValue,
        source_args: Vec<PsValue>,
        message_data: PsValue,
        time_generated: Option<PsDateTime>,
        computer: &str,
    ) -> Result<()> {
        if self.base.state != RunspacePoolState::Opened {
            return Err(PsrpError::invalid_transition("send a user event", self.base.state));
        }
        let event = UserEvent {
            event_identifier,
            source_identifier: source_identifier.to_string(),
            time_generated,
            sender,
            source_args,
            message_data,
            computer: computer.to_string(),
            runspace_id: self.base.runspace_pool_id,
        };
        self.base.prepare(
            MessageType::UserEvent,
            Some(&event.to_value()),
            None,
            StreamType::Default,
        )
    }

    /// Decrypt a SecureString received from the client.
    pub fn decrypt_secure_string(&self, value: &PsSecureString) -> Result<String> {
        match value {
            PsSecureString::Plaintext(plain) => Ok(plain.clone()),
            PsSecureString::Encrypted(cipher) => self.base.crypto.decrypt(cipher),
        }
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Borrow a pipeline surface for a pipeline created by the client.
    pub fn pipeline(&mut self, pipeline_id: Uuid) -> Result<ServerPipeline<'_>> {
        if !self.pipelines.contains_key(&pipeline_id) {
            return Err(PsrpError::unknown_pipeline(pipeline_id));
        }
        Ok(ServerPipeline {
            pool: self,
            id: pipeline_id,
        })
    }

    pub fn pipeline_state(&self, pipeline_id: Uuid) -> Option<PsInvocationState> {
        self.pipelines.get(&pipeline_id).map(|entry| entry.state)
    }

    // ------------------------------------------------------------------
    // Byte pipeline
    // ------------------------------------------------------------------

    pub fn receive_data(&mut self, data: &[u8]) {
        if self.base.state == RunspacePoolState::BeforeOpen {
            self.base.change_state(RunspacePoolState::Opening);
        }
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
        let Some(message_type) = message.known_type() else {
            let data = self.base.decode_body(message)?;
            let pool_id = self.base.runspace_pool_id;
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

                if self.base.state == RunspacePoolState::Connecting {
                    if self.base.runspace_pool_id != message.runspace_pool_id {
                        return Err(ProtocolError::violation(
                            "connection targets a different runspace pool",
                        )
                        .into());
                    }
                } else {
                    // A fresh pool adopts the client's pool id and answers
                    // with its own capability.
                    self.base.runspace_pool_id = message.runspace_pool_id;
                    self.base.change_state(RunspacePoolState::NegotiationSucceeded);
                    let ours = self.base.our_capability.to_value();
                    self.base.prepare(
                        MessageType::SessionCapability,
                        Some(&ours),
                        None,
                        StreamType::Default,
                    )?;
                }
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::SessionCapability(capability),
                ));
            }
            MessageType::InitRunspacePool => {
                let body = self.base.decode_single(message)?;
                let init = InitRunspacePool::from_value(&body)?;
                self.apartment_state = init.apartment_state;
                self.thread_options = init.thread_options;
                self.host = Some(init.host_info.clone());
                self.application_arguments = init.application_arguments.clone();
                self.base.min_runspaces = init.min_runspaces;
                self.base.max_runspaces = init.max_runspaces;

                let private_data = ApplicationPrivateData {
                    data: self.application_private_data.clone(),
                };
                self.base.prepare(
                    MessageType::ApplicationPrivateData,
                    Some(&private_data.to_value()),
                    None,
                    StreamType::Default,
                )?;
                self.change_state_and_notify(RunspacePoolState::Opened, None)?;

                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::InitRunspacePool {
                        min_runspaces: init.min_runspaces,
                        max_runspaces: init.max_runspaces,
                        application_arguments: init.application_arguments,
                    },
                ));
            }
            MessageType::ConnectRunspacePool => {
                let body = self.base.decode_single(message)?;
                let connect = ConnectRunspacePool::from_value(&body)?;
                if let Some(min) = connect.min_runspaces {
                    self.base.min_runspaces = min;
                }
                if let Some(max) = connect.max_runspaces {
                    self.base.max_runspaces = max;
                }

                let init_data = RunspacePoolInitData {
                    min_runspaces: self.base.min_runspaces,
                    max_runspaces: self.base.max_runspaces,
                };
                self.base.prepare(
                    MessageType::RunspacePoolInitData,
                    Some(&init_data.to_value()),
                    None,
                    StreamType::Default,
                )?;
                let private_data = ApplicationPrivateData {
                    data: self.application_private_data.clone(),
                };
                self.base.prepare(
                    MessageType::ApplicationPrivateData,
                    Some(&private_data.to_value()),
                    None,
                    StreamType::Default,
                )?;
                self.base.change_state(RunspacePoolState::Opened);

                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::ConnectRunspacePool(connect),
                ));
            }
            MessageType::PublicKey => {
                let body = self.base.decode_single(message)?;
                let public_key = PublicKey::from_value(&body)?;
                let blob = {
                    use base64::engine::general_purpose::STANDARD;
                    use base64::Engine as _;
                    STANDARD
                        .decode(public_key.public_key.trim())
                        .map_err(|e| ProtocolError::violation(e.to_string()))?
                };
                let encrypted = crypto::encrypt_session_key(&blob, &self.session_key)?;
                let response = EncryptedSessionKey {
                    encrypted_session_key: {
                        use base64::engine::general_purpose::STANDARD;
                        use base64::Engine as _;
                        STANDARD.encode(encrypted)
                    },
                };
                self.base.prepare(
                    MessageType::EncryptedSessionKey,
                    Some(&response.to_value()),
                    None,
                    StreamType::Default,
                )?;
                self.base.key_requested = true;

                let pool_id = self.base.runspace_pool_id;
                self.base
                    .push_event(PsrpEvent::pool(pool_id, EventKind::PublicKeyReceived));
            }
            MessageType::SetMaxRunspaces => {
                let body = self.base.decode_single(message)?;
                let request = SetMaxRunspaces::from_value(&body)?;
                self.pending_availability
                    .insert(request.ci, PendingAvailability::Flag);
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::SetMaxRunspaces {
                        ci: request.ci,
                        max_runspaces: request.max_runspaces,
                    },
                ));
            }
            MessageType::SetMinRunspaces => {
                let body = self.base.decode_single(message)?;
                let request = SetMinRunspaces::from_value(&body)?;
                self.pending_availability
                    .insert(request.ci, PendingAvailability::Flag);
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::SetMinRunspaces {
                        ci: request.ci,
                        min_runspaces: request.min_runspaces,
                    },
                ));
            }
            MessageType::GetAvailableRunspaces => {
                let body = self.base.decode_single(message)?;
                let request = GetAvailableRunspaces::from_value(&body)?;
                self.pending_availability
                    .insert(request.ci, PendingAvailability::Count);
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::GetAvailableRunspaces { ci: request.ci },
                ));
            }
            MessageType::ResetRunspaceState => {
                let body = self.base.decode_single(message)?;
                let request = ResetRunspaceState::from_value(&body)?;
                self.pending_availability
                    .insert(request.ci, PendingAvailability::Flag);
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pool(
                    pool_id,
                    EventKind::ResetRunspaceState { ci: request.ci },
                ));
            }
            MessageType::CreatePipeline => {
                let pipeline_id = self.require_new_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let create = CreatePipeline::from_value(&body)?;
                self.pipelines.insert(
                    pipeline_id,
                    ServerPipelineEntry {
                        state: PsInvocationState::NotStarted,
                        no_input: create.powershell.no_input,
                    },
                );
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::CreatePipeline(Box::new(create.powershell)),
                ));
            }
            MessageType::GetCommandMetadata => {
                let pipeline_id = self.require_new_pipeline(message)?;
                let body = self.base.decode_single(message)?;
                let query = GetMetadata::from_value(&body)?;
                self.pipelines.insert(
                    pipeline_id,
                    ServerPipelineEntry {
                        state: PsInvocationState::NotStarted,
                        no_input: true,
                    },
                );
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::GetCommandMetadata(query),
                ));
            }
            MessageType::PipelineInput => {
                let pipeline_id = self.require_pipeline(message)?;
                let entry = self.pipelines.get_mut(&pipeline_id).expect("checked");
                if entry.no_input {
                    entry.state = PsInvocationState::Failed;
                    return Err(ProtocolError::violation(
                        "pipeline declared no_input but received input",
                    )
                    .into());
                }
                let value = self.base.decode_single(message)?;
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::PipelineInput(value),
                ));
            }
            MessageType::EndOfPipelineInput => {
                let pipeline_id = self.require_pipeline(message)?;
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent::pipeline(
                    pool_id,
                    pipeline_id,
                    EventKind::EndOfPipelineInput,
                ));
            }
            MessageType::RunspacePoolHostResponse | MessageType::PipelineHostResponse => {
                let body = self.base.decode_single(message)?;
                let response = HostResponse::from_value(&body)?;
                if self.host_calls.remove(&response.ci).is_none() {
                    return Err(ProtocolError::UnknownHostCall {
                        call_id: response.ci,
                    }
                    .into());
                }
                let pool_id = self.base.runspace_pool_id;
                self.base.push_event(PsrpEvent {
                    runspace_pool_id: pool_id,
                    pipeline_id: message.pipeline_id,
                    kind: EventKind::HostResponse {
                        ci: response.ci,
                        method: response.method,
                        result: response.result,
                        error: response.error,
                    },
                });
            }
            other => {
                return Err(ProtocolError::violation(format!(
                    "{other:?} is not valid on the server side"
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

    fn require_new_pipeline(&self, message: &Message) -> Result<Uuid> {
        let pipeline_id = message.pipeline_id.ok_or_else(|| {
            ProtocolError::violation("pipeline message without a pipeline id")
        })?;
        if self.pipelines.contains_key(&pipeline_id) {
            return Err(ProtocolError::violation(format!(
                "pipeline {pipeline_id} already exists"
            ))
            .into());
        }
        Ok(pipeline_id)
    }

    // ------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------

    /// Change pool state and tell the client, except for the transport
    /// level (dis)connection states which never go on the wire.
    fn change_state_and_notify(
        &mut self,
        state: RunspacePoolState,
        error: Option<ErrorRecord>,
    ) -> Result<()> {
        self.base.change_state(state);
        if !matches!(
            state,
            RunspacePoolState::Disconnected | RunspacePoolState::Connecting
        ) {
            let state_msg = RunspacePoolStateMsg { state, error };
            self.base.prepare(
                MessageType::RunspacePoolState,
                Some(&state_msg.to_value()),
                None,
                StreamType::Default,
            )?;
        }
        Ok(())
    }

    /// Move a pipeline to a new state and queue PIPELINE_STATE.
    fn set_pipeline_state(
        &mut self,
        pipeline_id: Uuid,
        state: PsInvocationState,
        error: Option<ErrorRecord>,
    ) -> Result<()> {
        let entry = self
            .pipelines
            .get_mut(&pipeline_id)
            .ok_or_else(|| PsrpError::unknown_pipeline(pipeline_id))?;
        debug!(%pipeline_id, from = %entry.state, to = %state, "pipeline state change");
        entry.state = state;

        let state_msg = PipelineStateMsg { state, error };
        self.base.prepare(
            MessageType::PipelineState,
            Some(&state_msg.to_value()),
            Some(pipeline_id),
            StreamType::Default,
        )
    }
}

// ----------------------------------------------------------------------------
// Server pipeline surface
// ----------------------------------------------------------------------------

/// A borrowed view of one server pipeline.
pub struct ServerPipeline<'a> {
    pool: &'a mut ServerRunspacePool,
    id: Uuid,
}

impl ServerPipeline<'_> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PsInvocationState {
        self.pool.pipelines[&self.id].state
    }

    fn require_running(&self, action: &str) -> Result<()> {
        let state = self.state();
        if state != PsInvocationState::Running {
            return Err(PsrpError::invalid_transition(action, state));
        }
        Ok(())
    }

    /// Mark the pipeline running and notify the client.
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
        self.pool
            .set_pipeline_state(self.id, PsInvocationState::Running, None)
    }

    /// Write one object to the output stream.
    pub fn write_output(&mut self, value: PsValue) -> Result<()> {
        self.require_running("write pipeline output")?;
        self.pool.base.prepare(
            MessageType::PipelineOutput,
            Some(&value),
            Some(self.id),
            StreamType::Default,
        )
    }

    /// Write an error record to the error stream.
    pub fn write_error(&mut self, record: ErrorRecord) -> Result<()> {
        self.require_running("write pipeline error")?;
        self.pool.base.prepare(
            MessageType::ErrorRecord,
            Some(&record.to_value()),
            Some(self.id),
            StreamType::Default,
        )
    }

    pub fn write_debug(&mut self, record: InformationalRecord) -> Result<()> {
        self.require_running("write pipeline debug")?;
        self.pool.base.prepare(
            MessageType::DebugRecord,
            Some(&record.to_value(InformationalKind::Debug)),
            Some(self.id),
            StreamType::Default,
        )
    }

    pub fn write_verbose(&mut self, record: InformationalRecord) -> Result<()> {
        self.require_running("write pipeline verbose")?;
        self.pool.base.prepare(
            MessageType::VerboseRecord,
            Some(&record.to_value(InformationalKind::Verbose)),
            Some(self.id),
            StreamType::Default,
        )
    }

    pub fn write_warning(&mut self, record: InformationalRecord) -> Result<()> {
        self.require_running("write pipeline warning")?;
        self.pool.base.prepare(
            MessageType::WarningRecord,
            Some(&record.to_value(InformationalKind::Warning)),
            Some(self.id),
            StreamType::Default,
        )
    }

    /// Report activity progress.
    #[allow(clippy::too_many_arguments)]
    pub fn write_progress(
        &mut self,
        activity: &str,
        activity_id: i32,
        status_description: &str,
        current_operation: Option<&str>,
        parent_activity_id: i32,
        percent_complete: i32,
        record_type: ProgressRecordType,
        seconds_remaining: i32,
    ) -> Result<()> {
        self.require_running("write pipeline progress")?;
        let record = ProgressRecordMsg {
            activity: activity.to_string(),
            activity_id,
            status_description: status_description.to_string(),
            current_operation: current_operation.map(str::to_string),
            parent_activity_id,
            percent_complete,
            record_type,
            seconds_remaining,
        };
        self.pool.base.prepare(
            MessageType::ProgressRecord,
            Some(&record.to_value()),
            Some(self.id),
            StreamType::Default,
        )
    }

    /// Write an information record. Requires a protocolversion 2.3 peer.
    pub fn write_information(&mut self, record: InformationRecordMsg) -> Result<()> {
        self.pool
            .base
            .require_peer_version(ProtocolVersion::Pwsh5.version())?;
        self.require_running("write pipeline information")?;
        self.pool.base.prepare(
            MessageType::InformationRecord,
            Some(&record.to_value()),
            Some(self.id),
            StreamType::Default,
        )
    }

    /// Invoke a host method scoped to this pipeline.
    pub fn host_call(
        &mut self,
        method: HostMethodIdentifier,
        parameters: Vec<PsValue>,
    ) -> Result<i64> {
        self.require_running("make a pipeline host call")?;
        self.pool.host_call(method, parameters, Some(self.id))
    }

    /// Finish the pipeline successfully.
    pub fn complete(&mut self) -> Result<()> {
        self.pool
            .set_pipeline_state(self.id, PsInvocationState::Completed, None)
    }

    /// Finish the pipeline with a failure.
    pub fn fail(&mut self, error: ErrorRecord) -> Result<()> {
        self.pool
            .set_pipeline_state(self.id, PsInvocationState::Failed, Some(error))
    }

    /// Stop the pipeline, reporting the standard pipeline-stopped error.
    pub fn stop(&mut self) -> Result<()> {
        let state = self.state();
        if state == PsInvocationState::Stopped {
            return Ok(());
        }
        if !matches!(
            state,
            PsInvocationState::Running | PsInvocationState::Stopping
        ) {
            return Err(PsrpError::invalid_transition("stop the pipeline", state));
        }
        self.pool.set_pipeline_state(
            self.id,
            PsInvocationState::Stopped,
            Some(ErrorRecord::pipeline_stopped()),
        )
    }

    /// Remove a finished pipeline from the pool.
    pub fn close(self) -> Result<()> {
        let state = self.state();
        if !state.is_terminal() && state != PsInvocationState::NotStarted {
            return Err(PsrpError::invalid_transition("close the pipeline", state));
        }
        self.pool.pipelines.remove(&self.id);
        Ok(())
    }
}
