//! Typed PSRP message bodies
//!
//! One struct per MS-PSRP 2.2.2 message, each converting to and from its
//! CLIXML body shape. Field names on the wire match the protocol exactly
//! (`MinRunspaces`, `ci`, `mi`, `mp`, ...); parsing is tolerant of absent
//! optional fields so older peers interoperate.

use uuid::Uuid;

use crate::errors::Result;
use crate::protocol::command::{GetMetadata, PowerShell};
use crate::protocol::enums::{
    ApartmentState, HostMethodIdentifier, PsInvocationState, PsThreadOptions,
    RemoteStreamOptions, RunspacePoolState,
};
use crate::protocol::host::HostInfo;
use crate::protocol::records::ErrorRecord;
use crate::protocol::{
    missing_field, note_object, opt, opt_items, opt_str, req, req_i32, req_i64, req_str,
};
use crate::types::{ProtocolVersion, PsVersion};
use crate::value::{Container, PsDateTime, PsObject, PsValue};

fn req_version(value: &PsValue, message: &str, field: &str) -> Result<PsVersion> {
    match req(value, message, field)? {
        PsValue::Version(version) => Ok(*version),
        other => other
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| missing_field(message, field)),
    }
}

fn dict_value(entries: &[(PsValue, PsValue)], type_names: &[&str]) -> PsValue {
    let mut obj = PsObject::with_type_names(type_names.iter().map(|n| n.to_string()).collect());
    obj.container = Some(Container::Dict(entries.to_vec()));
    PsValue::object(obj)
}

const PRIMITIVE_DICTIONARY: [&str; 3] = [
    "System.Management.Automation.PSPrimitiveDictionary",
    "System.Collections.Hashtable",
    "System.Object",
];

// ----------------------------------------------------------------------------
// Session negotiation
// ----------------------------------------------------------------------------

/// SESSION_CAPABILITY (MS-PSRP 2.2.2.1).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCapability {
    pub ps_version: PsVersion,
    pub protocol_version: PsVersion,
    pub serialization_version: PsVersion,
    /// Serialized `CurrentSystemTimeZone` bytes, rarely sent.
    pub time_zone: Option<Vec<u8>>,
}

impl Default for SessionCapability {
    fn default() -> Self {
        Self {
            ps_version: PsVersion::new(2, 0),
            protocol_version: ProtocolVersion::Pwsh5.version(),
            serialization_version: PsVersion::full(1, 1, 0, 1),
            time_zone: None,
        }
    }
}

impl SessionCapability {
    pub fn to_value(&self) -> PsValue {
        let mut props = vec![
            ("PSVersion", PsValue::Version(self.ps_version)),
            ("protocolversion", PsValue::Version(self.protocol_version)),
            (
                "SerializationVersion",
                PsValue::Version(self.serialization_version),
            ),
        ];
        if let Some(time_zone) = &self.time_zone {
            props.push(("TimeZone", PsValue::ByteArray(time_zone.clone())));
        }
        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let time_zone = match opt(value, "TimeZone") {
            Some(PsValue::ByteArray(bytes)) => Some(bytes.clone()),
            _ => None,
        };
        Ok(Self {
            ps_version: req_version(value, "SessionCapability", "PSVersion")?,
            protocol_version: req_version(value, "SessionCapability", "protocolversion")?,
            serialization_version: req_version(value, "SessionCapability", "SerializationVersion")?,
            time_zone,
        })
    }
}

/// INIT_RUNSPACEPOOL (MS-PSRP 2.2.2.2).
#[derive(Debug, Clone, PartialEq)]
pub struct InitRunspacePool {
    pub min_runspaces: i32,
    pub max_runspaces: i32,
    pub thread_options: PsThreadOptions,
    pub apartment_state: ApartmentState,
    pub host_info: HostInfo,
    pub application_arguments: Vec<(PsValue, PsValue)>,
}

impl InitRunspacePool {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("MinRunspaces", self.min_runspaces.into()),
            ("MaxRunspaces", self.max_runspaces.into()),
            ("PSThreadOptions", self.thread_options.to_value()),
            ("ApartmentState", self.apartment_state.to_value()),
            ("HostInfo", self.host_info.to_value()),
            (
                "ApplicationArguments",
                dict_value(&self.application_arguments, &PRIMITIVE_DICTIONARY),
            ),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let thread_options = req_i64(value, "InitRunspacePool", "PSThreadOptions")
            .map(|v| PsThreadOptions::from_i64(v).unwrap_or(PsThreadOptions::Default))?;
        let apartment_state = req_i64(value, "InitRunspacePool", "ApartmentState")
            .map(|v| ApartmentState::from_i64(v).unwrap_or(ApartmentState::Unknown))?;

        Ok(Self {
            min_runspaces: req_i32(value, "InitRunspacePool", "MinRunspaces")?,
            max_runspaces: req_i32(value, "InitRunspacePool", "MaxRunspaces")?,
            thread_options,
            apartment_state,
            host_info: HostInfo::from_value(req(value, "InitRunspacePool", "HostInfo")?)?,
            application_arguments: opt(value, "ApplicationArguments")
                .and_then(PsValue::entries)
                .map(<[(PsValue, PsValue)]>::to_vec)
                .unwrap_or_default(),
        })
    }
}

/// CONNECT_RUNSPACEPOOL (MS-PSRP 2.2.2.29, protocolversion >= 2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectRunspacePool {
    pub min_runspaces: Option<i32>,
    pub max_runspaces: Option<i32>,
}

impl ConnectRunspacePool {
    pub fn to_value(&self) -> PsValue {
        let mut props = Vec::new();
        if let Some(min) = self.min_runspaces {
            props.push(("MinRunspaces", min.into()));
        }
        if let Some(max) = self.max_runspaces {
            props.push(("MaxRunspaces", max.into()));
        }
        if props.is_empty() {
            // With neither count the message degenerates to an empty
            // string body.
            return PsValue::from("");
        }
        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            min_runspaces: opt(value, "MinRunspaces")
                .and_then(PsValue::as_i64)
                .and_then(|v| i32::try_from(v).ok()),
            max_runspaces: opt(value, "MaxRunspaces")
                .and_then(PsValue::as_i64)
                .and_then(|v| i32::try_from(v).ok()),
        })
    }
}

/// RUNSPACEPOOL_INIT_DATA (MS-PSRP 2.2.2.30).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunspacePoolInitData {
    pub min_runspaces: i32,
    pub max_runspaces: i32,
}

impl RunspacePoolInitData {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("MinRunspaces", self.min_runspaces.into()),
            ("MaxRunspaces", self.max_runspaces.into()),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            min_runspaces: req_i32(value, "RunspacePoolInitData", "MinRunspaces")?,
            max_runspaces: req_i32(value, "RunspacePoolInitData", "MaxRunspaces")?,
        })
    }
}

// ----------------------------------------------------------------------------
// Key exchange
// ----------------------------------------------------------------------------

/// PUBLIC_KEY (MS-PSRP 2.2.2.3): base64 CAPI public key blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub public_key: String,
}

impl PublicKey {
    pub fn to_value(&self) -> PsValue {
        note_object([("PublicKey", self.public_key.as_str().into())])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            public_key: req_str(value, "PublicKey", "PublicKey")?,
        })
    }
}

/// ENCRYPTED_SESSION_KEY (MS-PSRP 2.2.2.4): base64 CAPI simple blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSessionKey {
    pub encrypted_session_key: String,
}

impl EncryptedSessionKey {
    pub fn to_value(&self) -> PsValue {
        note_object([(
            "EncryptedSessionKey",
            self.encrypted_session_key.as_str().into(),
        )])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            encrypted_session_key: req_str(
                value,
                "EncryptedSessionKey",
                "EncryptedSessionKey",
            )?,
        })
    }
}

/// PUBLIC_KEY_REQUEST (MS-PSRP 2.2.2.5): an empty string body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublicKeyRequest;

impl PublicKeyRequest {
    pub fn to_value(&self) -> PsValue {
        PsValue::from("")
    }
}

// ----------------------------------------------------------------------------
// Pool management
// ----------------------------------------------------------------------------

/// SET_MAX_RUNSPACES (MS-PSRP 2.2.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMaxRunspaces {
    pub max_runspaces: i32,
    pub ci: i64,
}

impl SetMaxRunspaces {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("MaxRunspaces", self.max_runspaces.into()),
            ("ci", PsValue::Int64(self.ci)),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            max_runspaces: req_i32(value, "SetMaxRunspaces", "MaxRunspaces")?,
            ci: req_i64(value, "SetMaxRunspaces", "ci")?,
        })
    }
}

/// SET_MIN_RUNSPACES (MS-PSRP 2.2.2.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMinRunspaces {
    pub min_runspaces: i32,
    pub ci: i64,
}

impl SetMinRunspaces {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("MinRunspaces", self.min_runspaces.into()),
            ("ci", PsValue::Int64(self.ci)),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            min_runspaces: req_i32(value, "SetMinRunspaces", "MinRunspaces")?,
            ci: req_i64(value, "SetMinRunspaces", "ci")?,
        })
    }
}

/// GET_AVAILABLE_RUNSPACES (MS-PSRP 2.2.2.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetAvailableRunspaces {
    pub ci: i64,
}

impl GetAvailableRunspaces {
    pub fn to_value(&self) -> PsValue {
        note_object([("ci", PsValue::Int64(self.ci))])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            ci: req_i64(value, "GetAvailableRunspaces", "ci")?,
        })
    }
}

/// RESET_RUNSPACE_STATE (MS-PSRP 2.2.2.31, protocolversion >= 2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRunspaceState {
    pub ci: i64,
}

impl ResetRunspaceState {
    pub fn to_value(&self) -> PsValue {
        note_object([("ci", PsValue::Int64(self.ci))])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            ci: req_i64(value, "ResetRunspaceState", "ci")?,
        })
    }
}

/// The payload of a RUNSPACE_AVAILABILITY response: a success flag for
/// set/reset requests, a count for get requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityResponse {
    Success(bool),
    Available(i64),
}

/// RUNSPACE_AVAILABILITY (MS-PSRP 2.2.2.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunspaceAvailability {
    pub response: AvailabilityResponse,
    pub ci: i64,
}

impl RunspaceAvailability {
    pub fn to_value(&self) -> PsValue {
        let response = match self.response {
            AvailabilityResponse::Success(success) => PsValue::Bool(success),
            AvailabilityResponse::Available(count) => PsValue::Int64(count),
        };
        note_object([
            ("SetMinMaxRunspacesResponse", response),
            ("ci", PsValue::Int64(self.ci)),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let raw = req(value, "RunspaceAvailability", "SetMinMaxRunspacesResponse")?;
        let response = match raw.as_bool() {
            Some(success) => AvailabilityResponse::Success(success),
            None => AvailabilityResponse::Available(
                raw.as_i64()
                    .ok_or_else(|| missing_field("RunspaceAvailability", "SetMinMaxRunspacesResponse"))?,
            ),
        };
        Ok(Self {
            response,
            ci: req_i64(value, "RunspaceAvailability", "ci")?,
        })
    }
}

/// RUNSPACEPOOL_STATE (MS-PSRP 2.2.2.9).
#[derive(Debug, Clone, PartialEq)]
pub struct RunspacePoolStateMsg {
    pub state: RunspacePoolState,
    pub error: Option<ErrorRecord>,
}

impl RunspacePoolStateMsg {
    pub fn new(state: RunspacePoolState) -> Self {
        Self { state, error: None }
    }

    pub fn to_value(&self) -> PsValue {
        let mut props = vec![("RunspaceState", PsValue::Int32(self.state.as_i64() as i32))];
        if let Some(error) = &self.error {
            props.push(("ExceptionAsErrorRecord", error.to_value()));
        }
        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let raw = req_i64(value, "RunspacePoolState", "RunspaceState")?;
        Ok(Self {
            state: RunspacePoolState::from_i64(raw)
                .ok_or_else(|| missing_field("RunspacePoolState", "RunspaceState"))?,
            error: opt(value, "ExceptionAsErrorRecord")
                .map(ErrorRecord::from_value)
                .transpose()?,
        })
    }
}

/// APPLICATION_PRIVATE_DATA (MS-PSRP 2.2.2.13).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplicationPrivateData {
    pub data: Vec<(PsValue, PsValue)>,
}

impl ApplicationPrivateData {
    pub fn to_value(&self) -> PsValue {
        note_object([(
            "ApplicationPrivateData",
            dict_value(&self.data, &PRIMITIVE_DICTIONARY),
        )])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            data: opt(value, "ApplicationPrivateData")
                .and_then(PsValue::entries)
                .map(<[(PsValue, PsValue)]>::to_vec)
                .unwrap_or_default(),
        })
    }
}

/// USER_EVENT (MS-PSRP 2.2.2.12).
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub event_identifier: i32,
    pub source_identifier: String,
    pub time_generated: Option<PsDateTime>,
    pub sender: PsValue,
    pub source_args: Vec<PsValue>,
    pub message_data: PsValue,
    pub computer: String,
    pub runspace_id: Uuid,
}

impl UserEvent {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("PSEventArgs.EventIdentifier", self.event_identifier.into()),
            (
                "PSEventArgs.SourceIdentifier",
                self.source_identifier.as_str().into(),
            ),
            ("PSEventArgs.TimeGenerated", self.time_generated.into()),
            ("PSEventArgs.Sender", self.sender.clone()),
            (
                "PSEventArgs.SourceArgs",
                PsValue::list(self.source_args.clone()),
            ),
            ("PSEventArgs.MessageData", self.message_data.clone()),
            ("PSEventArgs.ComputerName", self.computer.as_str().into()),
            ("PSEventArgs.RunspaceId", self.runspace_id.into()),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let time_generated = match opt(value, "PSEventArgs.TimeGenerated") {
            Some(PsValue::DateTime(dt)) => Some(*dt),
            _ => None,
        };
        let runspace_id = match opt(value, "PSEventArgs.RunspaceId") {
            Some(PsValue::Guid(id)) => *id,
            _ => Uuid::nil(),
        };
        Ok(Self {
            event_identifier: req_i32(value, "UserEvent", "PSEventArgs.EventIdentifier")?,
            source_identifier: req_str(value, "UserEvent", "PSEventArgs.SourceIdentifier")?,
            time_generated,
            sender: opt(value, "PSEventArgs.Sender").cloned().unwrap_or(PsValue::Null),
            source_args: opt_items(value, "PSEventArgs.SourceArgs"),
            message_data: opt(value, "PSEventArgs.MessageData")
                .cloned()
                .unwrap_or(PsValue::Null),
            computer: opt_str(value, "PSEventArgs.ComputerName").unwrap_or_default(),
            runspace_id,
        })
    }
}

// ----------------------------------------------------------------------------
// Pipelines
// ----------------------------------------------------------------------------

/// CREATE_PIPELINE (MS-PSRP 2.2.2.10).
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePipeline {
    pub powershell: PowerShell,
}

impl CreatePipeline {
    /// Serialize against the peer's protocol version; the pool's
    /// apartment state fills in when the pipeline does not set one.
    pub fn to_value(
        &self,
        default_apartment: ApartmentState,
        their_version: PsVersion,
    ) -> Result<PsValue> {
        let ps = &self.powershell;
        Ok(note_object([
            ("NoInput", PsValue::Bool(ps.no_input)),
            (
                "ApartmentState",
                ps.apartment_state.unwrap_or(default_apartment).to_value(),
            ),
            ("RemoteStreamOptions", ps.remote_stream_options.to_value()),
            ("AddToHistory", PsValue::Bool(ps.add_to_history)),
            (
                "HostInfo",
                ps.host.clone().unwrap_or_default().to_value(),
            ),
            ("PowerShell", ps.to_value(their_version)?),
            ("IsNested", PsValue::Bool(ps.is_nested)),
        ]))
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let no_input = req(value, "CreatePipeline", "NoInput")?
            .as_bool()
            .unwrap_or(true);
        let apartment_state = opt(value, "ApartmentState")
            .and_then(PsValue::as_i64)
            .and_then(ApartmentState::from_i64);
        let remote_stream_options = opt(value, "RemoteStreamOptions")
            .and_then(PsValue::as_i64)
            .map(RemoteStreamOptions::from_i64)
            .unwrap_or_default();
        let add_to_history = opt(value, "AddToHistory")
            .and_then(PsValue::as_bool)
            .unwrap_or(false);
        let is_nested = opt(value, "IsNested")
            .and_then(PsValue::as_bool)
            .unwrap_or(false);
        let host = opt(value, "HostInfo")
            .map(HostInfo::from_value)
            .transpose()?;

        let powershell = PowerShell::from_value(
            req(value, "CreatePipeline", "PowerShell")?,
            no_input,
            apartment_state,
            remote_stream_options,
            add_to_history,
            host,
            is_nested,
        )?;
        Ok(Self { powershell })
    }
}

/// GET_COMMAND_METADATA (MS-PSRP 2.2.2.14) reuses [`GetMetadata`].
pub type GetCommandMetadata = GetMetadata;

/// PIPELINE_STATE (MS-PSRP 2.2.2.21).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStateMsg {
    pub state: PsInvocationState,
    pub error: Option<ErrorRecord>,
}

impl PipelineStateMsg {
    pub fn new(state: PsInvocationState) -> Self {
        Self { state, error: None }
    }

    pub fn to_value(&self) -> PsValue {
        let mut props = vec![("PipelineState", PsValue::Int32(self.state.as_i64() as i32))];
        if let Some(error) = &self.error {
            props.push(("ExceptionAsErrorRecord", error.to_value()));
        }
        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let raw = req_i64(value, "PipelineState", "PipelineState")?;
        Ok(Self {
            state: PsInvocationState::from_i64(raw)
                .ok_or_else(|| missing_field("PipelineState", "PipelineState"))?,
            error: opt(value, "ExceptionAsErrorRecord")
                .map(ErrorRecord::from_value)
                .transpose()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Host calls
// ----------------------------------------------------------------------------

/// RUNSPACEPOOL_HOST_CALL / PIPELINE_HOST_CALL (MS-PSRP 2.2.2.15/27).
#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    pub ci: i64,
    pub method: HostMethodIdentifier,
    pub parameters: Vec<PsValue>,
}

impl HostCall {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("ci", PsValue::Int64(self.ci)),
            ("mi", self.method.to_value()),
            ("mp", PsValue::list(self.parameters.clone())),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let method = req_i64(value, "HostCall", "mi")?;
        Ok(Self {
            ci: req_i64(value, "HostCall", "ci")?,
            method: HostMethodIdentifier::from_i64(method)
                .ok_or_else(|| missing_field("HostCall", "mi"))?,
            parameters: opt_items(value, "mp"),
        })
    }
}

/// RUNSPACEPOOL_HOST_RESPONSE / PIPELINE_HOST_RESPONSE
/// (MS-PSRP 2.2.2.16/28).
#[derive(Debug, Clone, PartialEq)]
pub struct HostResponse {
    pub ci: i64,
    pub method: HostMethodIdentifier,
    pub result: Option<PsValue>,
    pub error: Option<ErrorRecord>,
}

impl HostResponse {
    pub fn to_value(&self) -> PsValue {
        let mut props = vec![
            ("ci", PsValue::Int64(self.ci)),
            ("mi", self.method.to_value()),
        ];
        if let Some(result) = &self.result {
            props.push(("mr", result.clone()));
        }
        if let Some(error) = &self.error {
            props.push(("me", error.to_value()));
        }
        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let method = req_i64(value, "HostResponse", "mi")?;
        Ok(Self {
            ci: req_i64(value, "HostResponse", "ci")?,
            method: HostMethodIdentifier::from_i64(method)
                .ok_or_else(|| missing_field("HostResponse", "mi"))?,
            result: opt(value, "mr").cloned(),
            error: opt(value, "me").map(ErrorRecord::from_value).transpose()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Stream records
// ----------------------------------------------------------------------------

/// PROGRESS_RECORD (MS-PSRP 2.2.2.25). The shape differs from the .NET
/// ProgressRecord type; the fields serialize flat.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecordMsg {
    pub activity: String,
    pub activity_id: i32,
    pub status_description: String,
    pub current_operation: Option<String>,
    pub parent_activity_id: i32,
    pub percent_complete: i32,
    pub record_type: crate::protocol::enums::ProgressRecordType,
    pub seconds_remaining: i32,
}

impl ProgressRecordMsg {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("Activity", self.activity.as_str().into()),
            ("ActivityId", self.activity_id.into()),
            ("StatusDescription", self.status_description.as_str().into()),
            ("CurrentOperation", self.current_operation.as_deref().into()),
            ("ParentActivityId", self.parent_activity_id.into()),
            ("PercentComplete", self.percent_complete.into()),
            ("Type", self.record_type.to_value()),
            ("SecondsRemaining", self.seconds_remaining.into()),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        use crate::protocol::enums::ProgressRecordType;
        let record_type = opt(value, "Type")
            .and_then(PsValue::as_i64)
            .and_then(ProgressRecordType::from_i64)
            .unwrap_or(ProgressRecordType::Processing);
        Ok(Self {
            activity: req_str(value, "ProgressRecord", "Activity")?,
            activity_id: req_i32(value, "ProgressRecord", "ActivityId")?,
            status_description: opt_str(value, "StatusDescription").unwrap_or_default(),
            current_operation: opt_str(value, "CurrentOperation"),
            parent_activity_id: opt(value, "ParentActivityId")
                .and_then(PsValue::as_i64)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(-1),
            percent_complete: opt(value, "PercentComplete")
                .and_then(PsValue::as_i64)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(-1),
            record_type,
            seconds_remaining: opt(value, "SecondsRemaining")
                .and_then(PsValue::as_i64)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(-1),
        })
    }
}

/// INFORMATION_RECORD (MS-PSRP 2.2.2.26, protocolversion >= 2.3).
#[derive(Debug, Clone, PartialEq)]
pub struct InformationRecordMsg {
    pub message_data: PsValue,
    pub source: String,
    pub time_generated: Option<PsDateTime>,
    pub tags: Vec<String>,
    pub user: String,
    pub computer: String,
    pub process_id: u32,
    pub native_thread_id: u32,
    pub managed_thread_id: u32,
}

impl InformationRecordMsg {
    pub fn to_value(&self) -> PsValue {
        note_object([
            ("MessageData", self.message_data.clone()),
            ("Source", self.source.as_str().into()),
            ("TimeGenerated", self.time_generated.into()),
            (
                "Tags",
                PsValue::list(self.tags.iter().map(|t| t.as_str().into()).collect()),
            ),
            ("User", self.user.as_str().into()),
            ("Computer", self.computer.as_str().into()),
            ("ProcessId", self.process_id.into()),
            ("NativeThreadId", self.native_thread_id.into()),
            ("ManagedThreadId", self.managed_thread_id.into()),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let time_generated = match opt(value, "TimeGenerated") {
            Some(PsValue::DateTime(dt)) => Some(*dt),
            _ => None,
        };
        let number = |field: &str| {
            opt(value, field)
                .and_then(PsValue::as_i64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };
        Ok(Self {
            message_data: opt(value, "MessageData").cloned().unwrap_or(PsValue::Null),
            source: opt_str(value, "Source").unwrap_or_default(),
            time_generated,
            tags: opt_items(value, "Tags")
                .iter()
                .filter_map(PsValue::as_str)
                .collect(),
            user: opt_str(value, "User").unwrap_or_default(),
            computer: opt_str(value, "Computer").unwrap_or_default(),
            process_id: number("ProcessId"),
            native_thread_id: number("NativeThreadId"),
            managed_thread_id: number("ManagedThreadId"),
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clixml::{deserialize_clixml, serialize_clixml};

    fn round_trip(value: &PsValue) -> PsValue {
        let xml = serialize_clixml(value).unwrap();
        deserialize_clixml(&xml).unwrap().remove(0)
    }

    #[test]
    fn test_session_capability_round_trip() {
        let capability = SessionCapability::default();
        let decoded = round_trip(&capability.to_value());
        assert_eq!(SessionCapability::from_value(&decoded).unwrap(), capability);
    }

    #[test]
    fn test_session_capability_wire_shape() {
        let xml = serialize_clixml(&SessionCapability::default().to_value()).unwrap();
        assert!(xml.contains("<Version N=\"protocolversion\">2.3</Version>"));
        assert!(xml.contains("<Version N=\"SerializationVersion\">1.1.0.1</Version>"));
        assert!(!xml.contains("TimeZone"));
    }

    #[test]
    fn test_init_runspace_pool_round_trip() {
        let init = InitRunspacePool {
            min_runspaces: 1,
            max_runspaces: 4,
            thread_options: PsThreadOptions::Default,
            apartment_state: ApartmentState::Unknown,
            host_info: HostInfo::default(),
            application_arguments: vec![(PsValue::from("env"), PsValue::from("prod"))],
        };
        let decoded = round_trip(&init.to_value());
        let parsed = InitRunspacePool::from_value(&decoded).unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn test_connect_runspace_pool_degenerate_body() {
        let empty = ConnectRunspacePool::default();
        assert_eq!(serialize_clixml(&empty.to_value()).unwrap(), "<S/>");

        let sized = ConnectRunspacePool {
            min_runspaces: Some(1),
            max_runspaces: Some(3),
        };
        let decoded = round_trip(&sized.to_value());
        assert_eq!(ConnectRunspacePool::from_value(&decoded).unwrap(), sized);
    }

    #[test]
    fn test_availability_response_polymorphism() {
        let success = RunspaceAvailability {
            response: AvailabilityResponse::Success(true),
            ci: 3,
        };
        let decoded = round_trip(&success.to_value());
        assert_eq!(RunspaceAvailability::from_value(&decoded).unwrap(), success);

        let count = RunspaceAvailability {
            response: AvailabilityResponse::Available(4),
            ci: 4,
        };
        let decoded = round_trip(&count.to_value());
        assert_eq!(RunspaceAvailability::from_value(&decoded).unwrap(), count);
    }

    #[test]
    fn test_pool_state_with_error() {
        let msg = RunspacePoolStateMsg {
            state: RunspacePoolState::Broken,
            error: Some(crate::protocol::records::ErrorRecord::pipeline_stopped()),
        };
        let decoded = round_trip(&msg.to_value());
        let parsed = RunspacePoolStateMsg::from_value(&decoded).unwrap();
        assert_eq!(parsed.state, RunspacePoolState::Broken);
        assert!(parsed.error.is_some());
    }

    #[test]
    fn test_create_pipeline_round_trip() {
        let pipeline = CreatePipeline {
            powershell: PowerShell::new()
                .add_command(Command::new("Get-Process").parameter("Name", "pwsh")),
        };
        let value = pipeline
            .to_value(ApartmentState::Unknown, ProtocolVersion::Pwsh5.version())
            .unwrap();
        let decoded = round_trip(&value);
        let parsed = CreatePipeline::from_value(&decoded).unwrap();
        assert_eq!(parsed.powershell.commands.len(), 1);
        assert_eq!(parsed.powershell.commands[0].command_text, "Get-Process");
        assert!(parsed.powershell.no_input);
    }

    use crate::protocol::command::Command;

    #[test]
    fn test_host_call_round_trip() {
        let call = HostCall {
            ci: 1,
            method: HostMethodIdentifier::WriteLine2,
            parameters: vec![PsValue::from("hello")],
        };
        let decoded = round_trip(&call.to_value());
        assert_eq!(HostCall::from_value(&decoded).unwrap(), call);
    }

    #[test]
    fn test_host_response_round_trip() {
        let response = HostResponse {
            ci: 7,
            method: HostMethodIdentifier::ReadLine,
            result: Some(PsValue::from("typed input")),
            error: None,
        };
        let decoded = round_trip(&response.to_value());
        assert_eq!(HostResponse::from_value(&decoded).unwrap(), response);
    }

    #[test]
    fn test_progress_record_round_trip() {
        let record = ProgressRecordMsg {
            activity: "Copying".to_string(),
            activity_id: 1,
            status_description: "3 of 5".to_string(),
            current_operation: None,
            parent_activity_id: -1,
            percent_complete: 60,
            record_type: crate::protocol::enums::ProgressRecordType::Processing,
            seconds_remaining: -1,
        };
        let decoded = round_trip(&record.to_value());
        assert_eq!(ProgressRecordMsg::from_value(&decoded).unwrap(), record);
    }

    #[test]
    fn test_user_event_round_trip() {
        let event = UserEvent {
            event_identifier: 1,
            source_identifier: "Timer".to_string(),
            time_generated: None,
            sender: PsValue::Null,
            source_args: vec![],
            message_data: PsValue::from("tick"),
            computer: "host01".to_string(),
            runspace_id: Uuid::nil(),
        };
        let decoded = round_trip(&event.to_value());
        assert_eq!(UserEvent::from_value(&decoded).unwrap(), event);
    }
}
