//! Shared runspace pool plumbing
//!
//! Both sides of a pool share the same byte pipeline: outbound messages
//! are serialized, packed, assigned an object id and fragmented on demand
//! by `data_to_send`; inbound bytes are buffered, defragmented and
//! unpacked into messages that the side-specific state machines dispatch.
//!
//! Everything here is synchronous and non-blocking; the caller owns all
//! scheduling and I/O.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clixml::{Deserializer, Serializer};
use crate::crypto::SessionCrypto;
use crate::errors::{ProtocolError, Result};
use crate::protocol::bodies::SessionCapability;
use crate::protocol::enums::RunspacePoolState;
use crate::protocol::events::PsrpEvent;
use crate::protocol::fragment::{Defragmenter, Fragment, Fragmenter};
use crate::protocol::message::{Message, MessageType};
use crate::protocol::records::ErrorRecord;
use crate::registry::TypeRegistry;
use crate::types::Destination;
use crate::value::PsValue;

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

/// The relative priority of an outbound payload. Host call traffic jumps
/// the default queue on transports that distinguish streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamType {
    #[default]
    Default,
    PromptResponse,
}

/// Bytes ready for the transport, tagged with the pipeline they belong
/// to (if any) and their stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsrpPayload {
    pub data: Vec<u8>,
    pub stream_type: StreamType,
    pub pipeline_id: Option<Uuid>,
}

// ----------------------------------------------------------------------------
// Outbound queue entries
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct OutgoingMessage {
    object_id: u64,
    pipeline_id: Option<Uuid>,
    stream_type: StreamType,
    data: Vec<u8>,
    offset: usize,
    next_fragment_id: u64,
}

impl OutgoingMessage {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Cut the next fragment with at most `max_payload` payload bytes.
    fn next_fragment(&mut self, max_payload: Option<usize>) -> Fragment {
        let take = match max_payload {
            Some(limit) => limit.max(1).min(self.remaining()),
            None => self.remaining(),
        };
        let payload = self.data[self.offset..self.offset + take].to_vec();
        self.offset += take;

        let fragment_id = self.next_fragment_id;
        self.next_fragment_id += 1;
        Fragment::new(self.object_id, fragment_id, self.remaining() == 0, payload)
    }
}

// ----------------------------------------------------------------------------
// Pool base
// ----------------------------------------------------------------------------

/// State shared between the client and server pool variants.
pub(crate) struct PoolBase {
    pub runspace_pool_id: Uuid,
    pub state: RunspacePoolState,
    pub our_capability: SessionCapability,
    pub their_capability: Option<SessionCapability>,
    pub min_runspaces: i32,
    pub max_runspaces: i32,
    pub crypto: SessionCrypto,
    pub key_requested: bool,
    pub registry: TypeRegistry,
    pub events: VecDeque<PsrpEvent>,
    is_client: bool,
    ci_counter: i64,
    fragmenter: Fragmenter,
    defragmenter: Defragmenter,
    send_buffer: VecDeque<OutgoingMessage>,
    receive_buffer: Vec<u8>,
}

impl PoolBase {
    pub fn new(
        runspace_pool_id: Uuid,
        our_capability: SessionCapability,
        registry: TypeRegistry,
        is_client: bool,
    ) -> Self {
        debug!(%runspace_pool_id, is_client, "creating runspace pool");
        Self {
            runspace_pool_id,
            state: RunspacePoolState::BeforeOpen,
            our_capability,
            their_capability: None,
            min_runspaces: 1,
            max_runspaces: 1,
            crypto: SessionCrypto::new(),
            key_requested: false,
            registry,
            events: VecDeque::new(),
            is_client,
            ci_counter: 1,
            fragmenter: Fragmenter::new(),
            defragmenter: Defragmenter::new(),
            send_buffer: VecDeque::new(),
            receive_buffer: Vec::new(),
        }
    }

    /// The next call id for ci-correlated operations.
    pub fn next_ci(&mut self) -> i64 {
        let ci = self.ci_counter;
        self.ci_counter += 1;
        ci
    }

    /// The peer's negotiated protocol version, defaulting to the oldest
    /// revision until SESSION_CAPABILITY arrives.
    pub fn their_protocol_version(&self) -> crate::types::PsVersion {
        self.their_capability
            .as_ref()
            .map(|c| c.protocol_version)
            .unwrap_or_else(|| crate::types::ProtocolVersion::Win7Rc.version())
    }

    pub fn change_state(&mut self, state: RunspacePoolState) {
        debug!(from = %self.state, to = %state, "runspace pool state change");
        self.state = state;
    }

    pub fn push_event(&mut self, event: PsrpEvent) {
        self.events.push_back(event);
    }

    pub fn pop_event(&mut self) -> Option<PsrpEvent> {
        self.events.pop_front()
    }

    /// Serialize a body and queue the framed message for sending.
    pub fn prepare(
        &mut self,
        message_type: MessageType,
        body: Option<&PsValue>,
        pipeline_id: Option<Uuid>,
        stream_type: StreamType,
    ) -> Result<()> {
        let data = match body {
            Some(value) => Serializer::with_crypto(&self.crypto)
                .serialize(value)?
                .into_bytes(),
            None => Vec::new(),
        };

        let destination = if self.is_client {
            Destination::Server
        } else {
            Destination::Client
        };
        let message = Message::new(
            destination,
            message_type,
            self.runspace_pool_id,
            pipeline_id,
            data,
        );

        let object_id = self.fragmenter.next_object_id();
        debug!(
            ?message_type,
            object_id,
            pipeline_id = ?pipeline_id,
            "queueing message"
        );
        self.send_buffer.push_back(OutgoingMessage {
            object_id,
            pipeline_id,
            stream_type,
            data: message.pack(),
            offset: 0,
            next_fragment_id: 0,
        });
        Ok(())
    }

    /// Drain buffered fragments for the transport. Every emitted fragment
    /// carries at most `max_fragment_size` payload bytes; a single call
    /// only combines messages that target the same pipeline.
    pub fn data_to_send(&mut self, max_fragment_size: Option<usize>) -> Option<PsrpPayload> {
        let mut out = Vec::new();
        let mut stream_type = StreamType::Default;
        let mut pipeline_id = None;

        while let Some(front) = self.send_buffer.front_mut() {
            if out.is_empty() {
                stream_type = front.stream_type;
                pipeline_id = front.pipeline_id;
            } else if front.pipeline_id != pipeline_id {
                break;
            }

            loop {
                let fragment = front.next_fragment(max_fragment_size);
                debug!(
                    object_id = fragment.object_id,
                    fragment_id = fragment.fragment_id,
                    start = fragment.start,
                    end = fragment.end,
                    length = fragment.data.len(),
                    "packing fragment"
                );
                out.extend_from_slice(&fragment.to_bytes());
                if fragment.end {
                    break;
                }
            }
            self.send_buffer.pop_front();
        }

        if out.is_empty() {
            None
        } else {
            Some(PsrpPayload {
                data: out,
                stream_type,
                pipeline_id,
            })
        }
    }

    /// Whether anything is waiting to be sent.
    pub fn has_data_to_send(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    /// Buffer raw bytes received from the transport.
    pub fn receive_data(&mut self, data: &[u8]) {
        self.receive_buffer.extend_from_slice(data);
    }

    /// Pull the next complete message out of the receive buffer.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        while let Some((fragment, consumed)) = Fragment::parse(&self.receive_buffer) {
            self.receive_buffer.drain(..consumed);

            if let Some(object) = self.defragmenter.receive(fragment)? {
                let message = Message::unpack(&object)?;
                let ours = if self.is_client {
                    Destination::Client
                } else {
                    Destination::Server
                };
                if message.destination != ours {
                    return Err(ProtocolError::violation(format!(
                        "message addressed to the {} arrived at the {}",
                        message.destination, ours
                    ))
                    .into());
                }
                debug!(
                    message_type = format_args!("0x{:08X}", message.message_type),
                    pipeline_id = ?message.pipeline_id,
                    "unpacked message"
                );
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Decode a message body into its top-level values.
    pub fn decode_body(&self, message: &Message) -> Result<Vec<PsValue>> {
        if message.data.is_empty() {
            return Ok(Vec::new());
        }
        Deserializer::new(&self.registry).deserialize(message.body_text()?)
    }

    /// Decode a body that must hold exactly one value.
    pub fn decode_single(&self, message: &Message) -> Result<PsValue> {
        let mut values = self.decode_body(message)?;
        if values.len() != 1 {
            return Err(ProtocolError::violation(format!(
                "expected a single body value, found {}",
                values.len()
            ))
            .into());
        }
        Ok(values.remove(0))
    }

    /// Drop reassembly buffers, reporting abandoned object ids.
    pub fn reset_receive_state(&mut self) -> Vec<u64> {
        self.receive_buffer.clear();
        self.defragmenter.reset()
    }

    /// Restart the outbound conversation after a reconnect.
    pub fn reset_send_state(&mut self) {
        self.send_buffer.clear();
        self.fragmenter.reset();
        self.ci_counter = 1;
    }

    /// Negotiation guard shared by both sides: the peer must speak a 2.x
    /// protocol revision.
    pub fn check_peer_capability(&mut self, capability: &SessionCapability) -> Result<()> {
        if capability.protocol_version.major != 2 {
            self.change_state(RunspacePoolState::Broken);
            return Err(ProtocolError::CapabilityMismatch {
                required: "2.x".to_string(),
                actual: capability.protocol_version.to_string(),
            }
            .into());
        }
        self.their_capability = Some(capability.clone());
        Ok(())
    }

    /// Standard error for operations that need a newer peer.
    pub fn require_peer_version(
        &self,
        required: crate::types::PsVersion,
    ) -> Result<()> {
        let actual = self.their_protocol_version();
        if actual < required {
            return Err(ProtocolError::CapabilityMismatch {
                required: required.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Fold a fatal peer error into the pool state.
    pub fn mark_broken(&mut self, error: Option<ErrorRecord>) {
        self.change_state(RunspacePoolState::Broken);
        let event = PsrpEvent::pool(
            self.runspace_pool_id,
            crate::protocol::events::EventKind::PoolStateChanged {
                state: RunspacePoolState::Broken,
                error,
            },
        );
        self.push_event(event);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn client_base() -> PoolBase {
        PoolBase::new(
            Uuid::new_v4(),
            SessionCapability::default(),
            TypeRegistry::standard(),
            true,
        )
    }

    fn server_base(id: Uuid) -> PoolBase {
        PoolBase::new(id, SessionCapability::default(), TypeRegistry::standard(), false)
    }

    #[test]
    fn test_prepare_and_drain() {
        let mut pool = client_base();
        pool.prepare(
            MessageType::SessionCapability,
            Some(&SessionCapability::default().to_value()),
            None,
            StreamType::Default,
        )
        .unwrap();
        assert!(pool.has_data_to_send());

        let payload = pool.data_to_send(None).unwrap();
        assert!(!payload.data.is_empty());
        assert_eq!(payload.pipeline_id, None);
        assert!(pool.data_to_send(None).is_none());
    }

    #[test]
    fn test_loopback_message() {
        let mut client = client_base();
        let mut server = server_base(client.runspace_pool_id);

        client
            .prepare(
                MessageType::SessionCapability,
                Some(&SessionCapability::default().to_value()),
                None,
                StreamType::Default,
            )
            .unwrap();
        let payload = client.data_to_send(Some(11)).unwrap();

        server.receive_data(&payload.data);
        let message = server.next_message().unwrap().unwrap();
        assert_eq!(message.known_type(), Some(MessageType::SessionCapability));

        let body = server.decode_single(&message).unwrap();
        let capability = SessionCapability::from_value(&body).unwrap();
        assert_eq!(capability, SessionCapability::default());
        assert!(server.next_message().unwrap().is_none());
    }

    #[test]
    fn test_wrong_destination_rejected() {
        let mut client = client_base();
        client
            .prepare(MessageType::PublicKeyRequest, None, None, StreamType::Default)
            .unwrap();
        let payload = client.data_to_send(None).unwrap();

        // Feeding a client-originated payload back to a client must fail.
        let mut other = client_base();
        other.receive_data(&payload.data);
        assert!(other.next_message().is_err());
    }

    #[test]
    fn test_partial_delivery() {
        let mut client = client_base();
        let mut server = server_base(client.runspace_pool_id);

        client
            .prepare(
                MessageType::SessionCapability,
                Some(&SessionCapability::default().to_value()),
                None,
                StreamType::Default,
            )
            .unwrap();
        let payload = client.data_to_send(Some(16)).unwrap();

        let (first, second) = payload.data.split_at(payload.data.len() / 2);
        server.receive_data(first);
        assert!(server.next_message().unwrap().is_none());
        server.receive_data(second);
        assert!(server.next_message().unwrap().is_some());
    }
}
