//! PSRP message framing
//!
//! A PSRP message is a 40-byte header followed by a UTF-8 CLIXML body:
//! destination and message type as little-endian u32, then the runspace
//! pool and pipeline GUIDs in the .NET mixed-endian layout. A pipeline id
//! of all zeroes scopes the message to the pool. Decoding strips an
//! optional UTF-8 byte order mark from the body.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ProtocolError, Result};
use crate::types::{guid_from_net_bytes, guid_to_net_bytes, Destination};

pub const MESSAGE_HEADER_LEN: usize = 40;
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

// ----------------------------------------------------------------------------
// Message types
// ----------------------------------------------------------------------------

/// The PSRP message types (MS-PSRP 2.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    SessionCapability = 0x0001_0002,
    InitRunspacePool = 0x0001_0004,
    PublicKey = 0x0001_0005,
    EncryptedSessionKey = 0x0001_0006,
    PublicKeyRequest = 0x0001_0007,
    ConnectRunspacePool = 0x0001_0008,
    SetMaxRunspaces = 0x0002_1002,
    SetMinRunspaces = 0x0002_1003,
    RunspaceAvailability = 0x0002_1004,
    RunspacePoolState = 0x0002_1005,
    CreatePipeline = 0x0002_1006,
    GetAvailableRunspaces = 0x0002_1007,
    UserEvent = 0x0002_1008,
    ApplicationPrivateData = 0x0002_1009,
    GetCommandMetadata = 0x0002_100A,
    RunspacePoolInitData = 0x0002_100B,
    ResetRunspaceState = 0x0002_100C,
    RunspacePoolHostCall = 0x0002_1100,
    RunspacePoolHostResponse = 0x0002_1101,
    PipelineInput = 0x0004_1002,
    EndOfPipelineInput = 0x0004_1003,
    PipelineOutput = 0x0004_1004,
    ErrorRecord = 0x0004_1005,
    PipelineState = 0x0004_1006,
    DebugRecord = 0x0004_1007,
    VerboseRecord = 0x0004_1008,
    WarningRecord = 0x0004_1009,
    ProgressRecord = 0x0004_1010,
    InformationRecord = 0x0004_1011,
    PipelineHostCall = 0x0004_1100,
    PipelineHostResponse = 0x0004_1101,
}

impl MessageType {
    /// Convert from the raw wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use MessageType::*;
        let message_type = match value {
            0x0001_0002 => SessionCapability,
            0x0001_0004 => InitRunspacePool,
            0x0001_0005 => PublicKey,
            0x0001_0006 => EncryptedSessionKey,
            0x0001_0007 => PublicKeyRequest,
            0x0001_0008 => ConnectRunspacePool,
            0x0002_1002 => SetMaxRunspaces,
            0x0002_1003 => SetMinRunspaces,
            0x0002_1004 => RunspaceAvailability,
            0x0002_1005 => RunspacePoolState,
            0x0002_1006 => CreatePipeline,
            0x0002_1007 => GetAvailableRunspaces,
            0x0002_1008 => UserEvent,
            0x0002_1009 => ApplicationPrivateData,
            0x0002_100A => GetCommandMetadata,
            0x0002_100B => RunspacePoolInitData,
            0x0002_100C => ResetRunspaceState,
            0x0002_1100 => RunspacePoolHostCall,
            0x0002_1101 => RunspacePoolHostResponse,
            0x0004_1002 => PipelineInput,
            0x0004_1003 => EndOfPipelineInput,
            0x0004_1004 => PipelineOutput,
            0x0004_1005 => ErrorRecord,
            0x0004_1006 => PipelineState,
            0x0004_1007 => DebugRecord,
            0x0004_1008 => VerboseRecord,
            0x0004_1009 => WarningRecord,
            0x0004_1010 => ProgressRecord,
            0x0004_1011 => InformationRecord,
            0x0004_1100 => PipelineHostCall,
            0x0004_1101 => PipelineHostResponse,
            _ => return None,
        };
        Some(message_type)
    }

    /// Convert to the raw wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The endpoint this message type is addressed to.
    pub fn destination(self) -> Destination {
        use MessageType::*;
        match self {
            SessionCapability
            | EncryptedSessionKey
            | PublicKeyRequest
            | RunspaceAvailability
            | RunspacePoolState
            | UserEvent
            | ApplicationPrivateData
            | RunspacePoolInitData
            | RunspacePoolHostCall
            | PipelineOutput
            | ErrorRecord
            | PipelineState
            | DebugRecord
            | VerboseRecord
            | WarningRecord
            | ProgressRecord
            | InformationRecord
            | PipelineHostCall => Destination::Client,
            InitRunspacePool
            | PublicKey
            | ConnectRunspacePool
            | SetMaxRunspaces
            | SetMinRunspaces
            | CreatePipeline
            | GetAvailableRunspaces
            | GetCommandMetadata
            | ResetRunspaceState
            | RunspacePoolHostResponse
            | PipelineInput
            | EndOfPipelineInput
            | PipelineHostResponse => Destination::Server,
        }
    }

    /// `SessionCapability` is addressed to both sides; everything else has
    /// a single receiving endpoint.
    pub fn bidirectional(self) -> bool {
        matches!(self, MessageType::SessionCapability)
    }

    /// Whether this message may flow while a key exchange is pending.
    pub fn valid_during_key_exchange(self) -> bool {
        matches!(
            self,
            MessageType::PublicKey
                | MessageType::EncryptedSessionKey
                | MessageType::PublicKeyRequest
        )
    }
}

// ----------------------------------------------------------------------------
// Wire message
// ----------------------------------------------------------------------------

/// A framed PSRP message. The message type stays raw here so unknown
/// types survive to the dispatch layer instead of failing the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub destination: Destination,
    pub message_type: u32,
    pub runspace_pool_id: Uuid,
    /// `None` for pool-scoped messages (all-zero GUID on the wire).
    pub pipeline_id: Option<Uuid>,
    /// The UTF-8 CLIXML body, possibly empty.
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(
        destination: Destination,
        message_type: MessageType,
        runspace_pool_id: Uuid,
        pipeline_id: Option<Uuid>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            destination,
            message_type: message_type.as_u32(),
            runspace_pool_id,
            pipeline_id,
            data,
        }
    }

    /// The typed message type, when known.
    pub fn known_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.message_type)
    }

    /// Pack the message into its wire form.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.destination.as_u32().to_le_bytes());
        out.extend_from_slice(&self.message_type.to_le_bytes());
        out.extend_from_slice(&guid_to_net_bytes(self.runspace_pool_id));
        out.extend_from_slice(&guid_to_net_bytes(self.pipeline_id.unwrap_or_else(Uuid::nil)));
        out.extend_from_slice(&self.data);
        out
    }

    /// Unpack a reassembled object into a message, stripping an optional
    /// UTF-8 BOM from the body.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(ProtocolError::violation(format!(
                "message truncated at {} bytes",
                data.len()
            ))
            .into());
        }

        let destination = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let destination = Destination::from_u32(destination).ok_or_else(|| {
            ProtocolError::violation(format!("invalid message destination 0x{destination:08X}"))
        })?;
        let message_type = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&data[8..24]);
        let runspace_pool_id = guid_from_net_bytes(guid);
        guid.copy_from_slice(&data[24..40]);
        let pipeline_id = guid_from_net_bytes(guid);
        let pipeline_id = (!pipeline_id.is_nil()).then_some(pipeline_id);

        let mut body = &data[MESSAGE_HEADER_LEN..];
        if body.starts_with(&UTF8_BOM) {
            body = &body[UTF8_BOM.len()..];
        }

        Ok(Self {
            destination,
            message_type,
            runspace_pool_id,
            pipeline_id,
            data: body.to_vec(),
        })
    }

    /// The body as text for the CLIXML decoder.
    pub fn body_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| crate::errors::SerializationError::malformed(e.to_string()).into())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for message_type in [
            MessageType::SessionCapability,
            MessageType::CreatePipeline,
            MessageType::PipelineHostResponse,
            MessageType::ProgressRecord,
        ] {
            assert_eq!(MessageType::from_u32(message_type.as_u32()), Some(message_type));
        }
        assert_eq!(MessageType::from_u32(0xDEAD_BEEF), None);
        assert_eq!(MessageType::ProgressRecord.as_u32(), 0x0004_1010);
    }

    #[test]
    fn test_destinations() {
        assert_eq!(
            MessageType::CreatePipeline.destination(),
            Destination::Server
        );
        assert_eq!(
            MessageType::PipelineOutput.destination(),
            Destination::Client
        );
        assert!(MessageType::SessionCapability.bidirectional());
        assert!(MessageType::PublicKey.valid_during_key_exchange());
        assert!(!MessageType::PipelineInput.valid_during_key_exchange());
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let rpid = Uuid::new_v4();
        let pid = Uuid::new_v4();
        let message = Message::new(
            Destination::Server,
            MessageType::PipelineInput,
            rpid,
            Some(pid),
            b"<S>input</S>".to_vec(),
        );

        let packed = message.pack();
        assert_eq!(&packed[..4], &2u32.to_le_bytes());
        assert_eq!(&packed[4..8], &0x0004_1002u32.to_le_bytes());

        let unpacked = Message::unpack(&packed).unwrap();
        assert_eq!(unpacked, message);
    }

    #[test]
    fn test_unpack_strips_bom() {
        let message = Message::new(
            Destination::Client,
            MessageType::PipelineOutput,
            Uuid::new_v4(),
            None,
            vec![0xEF, 0xBB, 0xBF, b'<', b'S', b'/', b'>'],
        );
        let unpacked = Message::unpack(&message.pack()).unwrap();
        assert_eq!(unpacked.data, b"<S/>");
        assert_eq!(unpacked.pipeline_id, None);
    }

    #[test]
    fn test_unpack_rejects_truncated() {
        assert!(Message::unpack(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_nil_pipeline_id_is_pool_scoped() {
        let message = Message::new(
            Destination::Server,
            MessageType::SessionCapability,
            Uuid::new_v4(),
            None,
            Vec::new(),
        );
        let packed = message.pack();
        assert!(packed[24..40].iter().all(|b| *b == 0));
        assert_eq!(Message::unpack(&packed).unwrap().pipeline_id, None);
    }
}
