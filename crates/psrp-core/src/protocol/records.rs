//! Error and informational records
//!
//! The record shapes PSRP streams back from a running pipeline: error
//! records with their category metadata, and the shared informational
//! record carried by the debug, verbose and warning streams.

use crate::errors::Result;
use crate::protocol::enums::ErrorCategory;
use crate::protocol::{opt, opt_str, req_str};
use crate::value::{PsObject, PsValue};

// ----------------------------------------------------------------------------
// .NET exceptions
// ----------------------------------------------------------------------------

/// A serializable `System.Exception`, the minimum surface an error record
/// requires.
#[derive(Debug, Clone, PartialEq)]
pub struct NetException {
    pub message: String,
    pub hresult: Option<i32>,
    /// Most derived first; `System.Exception`/`System.Object` are always
    /// appended on serialization when absent.
    pub type_names: Vec<String>,
}

impl NetException {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            hresult: None,
            type_names: Vec::new(),
        }
    }

    /// The canonical pipeline-stopped exception the server reports when a
    /// running pipeline is interrupted.
    pub fn pipeline_stopped() -> Self {
        Self {
            message: "The pipeline has been stopped.".to_string(),
            hresult: Some(-2146233087),
            type_names: vec![
                "System.Management.Automation.PipelineStoppedException".to_string(),
                "System.Management.Automation.RuntimeException".to_string(),
                "System.SystemException".to_string(),
            ],
        }
    }

    pub fn to_value(&self) -> PsValue {
        let mut type_names = self.type_names.clone();
        for base in ["System.Exception", "System.Object"] {
            if !type_names.iter().any(|n| n == base) {
                type_names.push(base.to_string());
            }
        }

        let mut obj = PsObject::with_type_names(type_names);
        obj.to_string = Some(self.message.clone());
        obj.adapted.insert("Message", self.message.as_str());
        obj.adapted.insert("Data", PsValue::Null);
        obj.adapted.insert("HelpLink", PsValue::Null);
        obj.adapted
            .insert("HResult", self.hresult.map(PsValue::Int32).unwrap_or(PsValue::Null));
        obj.adapted.insert("InnerException", PsValue::Null);
        obj.adapted.insert("Source", PsValue::Null);
        obj.adapted.insert("StackTrace", PsValue::Null);
        obj.adapted.insert("TargetSite", PsValue::Null);
        PsValue::object(obj)
    }
}

// ----------------------------------------------------------------------------
// Error category info
// ----------------------------------------------------------------------------

/// The classification block on an error record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorCategoryInfo {
    pub category: ErrorCategory,
    pub activity: String,
    pub reason: String,
    pub target_name: String,
    pub target_type: String,
}

impl ErrorCategoryInfo {
    /// The `ErrorCategory_Message` rendering .NET produces.
    pub fn message(&self) -> String {
        format!(
            "{} ({}:{}) [{}], {}",
            self.category, self.target_name, self.target_type, self.activity, self.reason
        )
    }
}

// ----------------------------------------------------------------------------
// Error records
// ----------------------------------------------------------------------------

/// A pipeline error record (MS-PSRP 2.2.3.15).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorRecord {
    pub exception: Option<PsValue>,
    pub target_object: Option<PsValue>,
    pub fully_qualified_error_id: Option<String>,
    pub invocation_info: Option<PsValue>,
    pub category_info: ErrorCategoryInfo,
    pub error_details_message: Option<String>,
    pub error_details_recommended_action: Option<String>,
    pub script_stack_trace: Option<String>,
    pub pipeline_iteration_info: Vec<i32>,
    /// Whether the invocation info block is serialized in full.
    pub serialize_extended_info: bool,
}

impl ErrorRecord {
    pub fn new(exception: NetException, category_info: ErrorCategoryInfo) -> Self {
        Self {
            exception: Some(exception.to_value()),
            category_info,
            ..Self::default()
        }
    }

    /// The error record the server synthesizes for a stopped pipeline.
    pub fn pipeline_stopped() -> Self {
        Self {
            exception: Some(NetException::pipeline_stopped().to_value()),
            category_info: ErrorCategoryInfo {
                category: ErrorCategory::OperationStopped,
                reason: "PipelineStoppedException".to_string(),
                ..ErrorCategoryInfo::default()
            },
            fully_qualified_error_id: Some("PipelineStopped".to_string()),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> PsValue {
        let mut obj = PsObject::with_type_names(vec![
            "System.Management.Automation.ErrorRecord".to_string(),
            "System.Object".to_string(),
        ]);
        let extended = &mut obj.extended;
        extended.insert("Exception", self.exception.clone().unwrap_or(PsValue::Null));
        extended.insert(
            "TargetObject",
            self.target_object.clone().unwrap_or(PsValue::Null),
        );
        extended.insert(
            "FullyQualifiedErrorId",
            self.fully_qualified_error_id
                .as_deref()
                .map(PsValue::from)
                .unwrap_or(PsValue::Null),
        );
        extended.insert(
            "InvocationInfo",
            self.invocation_info.clone().unwrap_or(PsValue::Null),
        );
        extended.insert(
            "ErrorCategory_Category",
            PsValue::Int32(self.category_info.category.as_i64() as i32),
        );
        extended.insert("ErrorCategory_Activity", self.category_info.activity.as_str());
        extended.insert("ErrorCategory_Reason", self.category_info.reason.as_str());
        extended.insert(
            "ErrorCategory_TargetName",
            self.category_info.target_name.as_str(),
        );
        extended.insert(
            "ErrorCategory_TargetType",
            self.category_info.target_type.as_str(),
        );
        extended.insert("ErrorCategory_Message", self.category_info.message().as_str());

        if let Some(message) = &self.error_details_message {
            extended.insert("ErrorDetails_Message", message.as_str());
        }
        if let Some(action) = &self.error_details_recommended_action {
            extended.insert("ErrorDetails_RecommendedAction", action.as_str());
        }
        if let Some(trace) = &self.script_stack_trace {
            extended.insert("ErrorDetails_ScriptStackTrace", trace.as_str());
        }

        if self.serialize_extended_info {
            extended.insert("SerializeExtendedInfo", true);
            extended.insert(
                "PipelineIterationInfo",
                PsValue::list(
                    self.pipeline_iteration_info
                        .iter()
                        .map(|i| PsValue::Int32(*i))
                        .collect(),
                ),
            );
        } else {
            extended.insert("SerializeExtendedInfo", false);
        }

        PsValue::object(obj)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let category = opt(value, "ErrorCategory_Category")
            .and_then(PsValue::as_i64)
            .and_then(ErrorCategory::from_i64)
            .unwrap_or(ErrorCategory::NotSpecified);

        let pipeline_iteration_info = opt(value, "PipelineIterationInfo")
            .and_then(PsValue::items)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_i64().and_then(|v| i32::try_from(v).ok()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            exception: opt(value, "Exception").cloned(),
            target_object: opt(value, "TargetObject").cloned(),
            fully_qualified_error_id: opt_str(value, "FullyQualifiedErrorId"),
            invocation_info: opt(value, "InvocationInfo").cloned(),
            category_info: ErrorCategoryInfo {
                category,
                activity: opt_str(value, "ErrorCategory_Activity").unwrap_or_default(),
                reason: opt_str(value, "ErrorCategory_Reason").unwrap_or_default(),
                target_name: opt_str(value, "ErrorCategory_TargetName").unwrap_or_default(),
                target_type: opt_str(value, "ErrorCategory_TargetType").unwrap_or_default(),
            },
            error_details_message: opt_str(value, "ErrorDetails_Message"),
            error_details_recommended_action: opt_str(value, "ErrorDetails_RecommendedAction"),
            script_stack_trace: opt_str(value, "ErrorDetails_ScriptStackTrace"),
            pipeline_iteration_info,
            serialize_extended_info: opt(value, "SerializeExtendedInfo")
                .and_then(PsValue::as_bool)
                .unwrap_or(false),
        })
    }

    /// The headline message, taken from the exception when present.
    pub fn message(&self) -> Option<String> {
        self.exception
            .as_ref()
            .and_then(|e| e.property("Message"))
            .and_then(PsValue::as_str)
    }
}

// ----------------------------------------------------------------------------
// Informational records
// ----------------------------------------------------------------------------

/// Which stream an informational record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationalKind {
    Debug,
    Verbose,
    Warning,
}

impl InformationalKind {
    fn type_names(self) -> Vec<String> {
        let derived = match self {
            InformationalKind::Debug => "System.Management.Automation.DebugRecord",
            InformationalKind::Verbose => "System.Management.Automation.VerboseRecord",
            InformationalKind::Warning => "System.Management.Automation.WarningRecord",
        };
        vec![
            derived.to_string(),
            "System.Management.Automation.InformationalRecord".to_string(),
            "System.Object".to_string(),
        ]
    }
}

/// The shared record shape of the debug, verbose and warning streams
/// (MS-PSRP 2.2.3.16).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InformationalRecord {
    pub message: String,
    pub invocation_info: Option<PsValue>,
    pub pipeline_iteration_info: Vec<i32>,
}

impl InformationalRecord {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn to_value(&self, kind: InformationalKind) -> PsValue {
        let mut obj = PsObject::with_type_names(kind.type_names());
        obj.to_string = Some(self.message.clone());
        obj.extended
            .insert("InformationalRecord_Message", self.message.as_str());

        if let Some(invocation_info) = &self.invocation_info {
            obj.extended
                .insert("InformationalRecord_SerializeInvocationInfo", true);
            obj.extended.insert("InvocationInfo", invocation_info.clone());
            obj.extended.insert(
                "InformationalRecord_PipelineIterationInfo",
                PsValue::list(
                    self.pipeline_iteration_info
                        .iter()
                        .map(|i| PsValue::Int32(*i))
                        .collect(),
                ),
            );
        } else {
            obj.extended
                .insert("InformationalRecord_SerializeInvocationInfo", false);
        }

        PsValue::object(obj)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let message = req_str(value, "InformationalRecord", "InformationalRecord_Message")?;
        let pipeline_iteration_info = opt(value, "InformationalRecord_PipelineIterationInfo")
            .and_then(PsValue::items)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_i64().and_then(|v| i32::try_from(v).ok()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            message,
            invocation_info: opt(value, "InvocationInfo").cloned(),
            pipeline_iteration_info,
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

    #[test]
    fn test_error_record_round_trip() {
        let record = ErrorRecord::new(
            NetException::new("file not found"),
            ErrorCategoryInfo {
                category: ErrorCategory::ObjectNotFound,
                reason: "ItemNotFoundException".to_string(),
                target_name: "C:\\missing".to_string(),
                ..ErrorCategoryInfo::default()
            },
        );

        let xml = serialize_clixml(&record.to_value()).unwrap();
        assert!(xml.contains("<I32 N=\"ErrorCategory_Category\">13</I32>"));
        assert!(xml.contains("<B N=\"SerializeExtendedInfo\">false</B>"));

        let decoded = deserialize_clixml(&xml).unwrap().remove(0);
        let parsed = ErrorRecord::from_value(&decoded).unwrap();
        assert_eq!(parsed.category_info.category, ErrorCategory::ObjectNotFound);
        assert_eq!(parsed.message().as_deref(), Some("file not found"));
        assert!(!parsed.serialize_extended_info);
    }

    #[test]
    fn test_pipeline_stopped_record() {
        let record = ErrorRecord::pipeline_stopped();
        assert_eq!(
            record.fully_qualified_error_id.as_deref(),
            Some("PipelineStopped")
        );
        let exception = record.exception.as_ref().unwrap().as_object().unwrap();
        assert_eq!(
            exception.type_names[0],
            "System.Management.Automation.PipelineStoppedException"
        );
        assert!(exception
            .type_names
            .iter()
            .any(|n| n == "System.Exception"));
    }

    #[test]
    fn test_informational_record_round_trip() {
        let record = InformationalRecord::new("careful now");
        let xml = serialize_clixml(&record.to_value(InformationalKind::Warning)).unwrap();
        assert!(xml.contains("System.Management.Automation.WarningRecord"));
        assert!(xml.contains("<S N=\"InformationalRecord_Message\">careful now</S>"));

        let decoded = deserialize_clixml(&xml).unwrap().remove(0);
        assert_eq!(
            InformationalRecord::from_value(&decoded).unwrap(),
            record
        );
    }
}
