//! Pipeline commands and their wire form
//!
//! A pipeline is an ordered list of [`Command`] records, optionally split
//! into statements. Each command carries a merge policy describing where
//! its non-output streams land; the per-stream merge fields only go on
//! the wire for peers that understand them.

use crate::errors::{ProtocolError, Result};
use crate::protocol::enums::{ApartmentState, CommandTypes, PipelineResultTypes, RemoteStreamOptions};
use crate::protocol::host::HostInfo;
use crate::protocol::{note_object, opt, opt_items, opt_str, req, req_bool, req_str};
use crate::types::{ProtocolVersion, PsVersion};
use crate::value::PsValue;

// ----------------------------------------------------------------------------
// Command
// ----------------------------------------------------------------------------

/// One command (or script) within a pipeline statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The command name or the script text.
    pub command_text: String,
    pub is_script: bool,
    pub use_local_scope: Option<bool>,
    /// Positional arguments have no name.
    pub parameters: Vec<(Option<String>, PsValue)>,
    /// Whether this command ends the current statement.
    pub end_of_statement: bool,
    /// Merge point for unclaimed error records of earlier commands.
    pub merge_unclaimed: bool,
    merge_my: PipelineResultTypes,
    merge_to: PipelineResultTypes,
    merge_error: PipelineResultTypes,
    merge_warning: PipelineResultTypes,
    merge_verbose: PipelineResultTypes,
    merge_debug: PipelineResultTypes,
    merge_information: PipelineResultTypes,
}

impl Command {
    pub fn new<T: Into<String>>(command_text: T) -> Self {
        Self {
            command_text: command_text.into(),
            is_script: false,
            use_local_scope: None,
            parameters: Vec::new(),
            end_of_statement: false,
            merge_unclaimed: false,
            merge_my: PipelineResultTypes::none,
            merge_to: PipelineResultTypes::none,
            merge_error: PipelineResultTypes::none,
            merge_warning: PipelineResultTypes::none,
            merge_verbose: PipelineResultTypes::none,
            merge_debug: PipelineResultTypes::none,
            merge_information: PipelineResultTypes::none,
        }
    }

    pub fn script<T: Into<String>>(script: T) -> Self {
        Self {
            is_script: true,
            ..Self::new(script)
        }
    }

    /// Add a named parameter.
    pub fn parameter<N: Into<String>, V: Into<PsValue>>(mut self, name: N, value: V) -> Self {
        self.parameters.push((Some(name.into()), value.into()));
        self
    }

    /// Add a positional argument.
    pub fn argument<V: Into<PsValue>>(mut self, value: V) -> Self {
        self.parameters.push((None, value.into()));
        self
    }

    pub fn merge_error(&self) -> PipelineResultTypes {
        self.merge_error
    }

    /// Redirect every non-output stream to the target stream.
    pub fn redirect_all(&mut self, stream: PipelineResultTypes) -> Result<()> {
        self.redirect_error(stream)?;
        self.redirect_warning(stream)?;
        self.redirect_verbose(stream)?;
        self.redirect_debug(stream)?;
        self.redirect_information(stream)
    }

    pub fn redirect_error(&mut self, stream: PipelineResultTypes) -> Result<()> {
        validate_redirect_target(stream)?;
        if stream == PipelineResultTypes::none {
            self.merge_my = PipelineResultTypes::none;
            self.merge_to = PipelineResultTypes::none;
        } else if stream != PipelineResultTypes::Null {
            // The v2-era fields mirror the error redirect for old peers.
            self.merge_my = PipelineResultTypes::Error;
            self.merge_to = stream;
        }
        self.merge_error = stream;
        Ok(())
    }

    pub fn redirect_warning(&mut self, stream: PipelineResultTypes) -> Result<()> {
        validate_redirect_target(stream)?;
        self.merge_warning = stream;
        Ok(())
    }

    pub fn redirect_verbose(&mut self, stream: PipelineResultTypes) -> Result<()> {
        validate_redirect_target(stream)?;
        self.merge_verbose = stream;
        Ok(())
    }

    pub fn redirect_debug(&mut self, stream: PipelineResultTypes) -> Result<()> {
        validate_redirect_target(stream)?;
        self.merge_debug = stream;
        Ok(())
    }

    pub fn redirect_information(&mut self, stream: PipelineResultTypes) -> Result<()> {
        validate_redirect_target(stream)?;
        self.merge_information = stream;
        Ok(())
    }

    /// The wire object for this command. Older peers do not understand
    /// the per-stream merge fields, so they are gated on the negotiated
    /// protocol version.
    pub fn to_value(&self, their_version: PsVersion) -> PsValue {
        let merge_previous = if self.merge_unclaimed {
            PipelineResultTypes::Output | PipelineResultTypes::Error
        } else {
            PipelineResultTypes::none
        };

        let args: Vec<PsValue> = self
            .parameters
            .iter()
            .map(|(name, value)| {
                note_object([
                    (
                        "N",
                        name.as_deref().map(PsValue::from).unwrap_or(PsValue::Null),
                    ),
                    ("V", value.clone()),
                ])
            })
            .collect();

        let mut props = vec![
            ("Cmd", PsValue::from(self.command_text.as_str())),
            ("Args", PsValue::list(args)),
            ("IsScript", PsValue::Bool(self.is_script)),
            ("UseLocalScope", self.use_local_scope.into()),
            ("MergeMyResult", self.merge_my.to_value()),
            ("MergeToResult", self.merge_to.to_value()),
            ("MergePreviousResults", merge_previous.to_value()),
        ];

        if their_version >= ProtocolVersion::Pwsh3.version() {
            props.push(("MergeError", self.merge_error.to_value()));
            props.push(("MergeWarning", self.merge_warning.to_value()));
            props.push(("MergeVerbose", self.merge_verbose.to_value()));
            props.push(("MergeDebug", self.merge_debug.to_value()));
        }
        if their_version >= ProtocolVersion::Pwsh5.version() {
            props.push(("MergeInformation", self.merge_information.to_value()));
        }

        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let mut command = Command::new(req_str(value, "Command", "Cmd")?);
        command.is_script = req_bool(value, "Command", "IsScript")?;
        command.use_local_scope = opt(value, "UseLocalScope").and_then(PsValue::as_bool);

        for arg in opt_items(value, "Args") {
            let name = opt_str(&arg, "N");
            let arg_value = arg.property("V").cloned().unwrap_or(PsValue::Null);
            command.parameters.push((name, arg_value));
        }

        let flags = |field: &str| {
            opt(value, field)
                .and_then(PsValue::as_i64)
                .map(PipelineResultTypes::from_i64)
        };

        let merge_unclaimed = PipelineResultTypes::Output | PipelineResultTypes::Error;
        command.merge_unclaimed = flags("MergePreviousResults") == Some(merge_unclaimed);
        command.merge_my = flags("MergeMyResult").unwrap_or_default();
        command.merge_to = flags("MergeToResult").unwrap_or_default();
        // Peers below protocolversion 2.2 never send the per-stream merge
        // fields.
        command.merge_error = flags("MergeError").unwrap_or_default();
        command.merge_warning = flags("MergeWarning").unwrap_or_default();
        command.merge_verbose = flags("MergeVerbose").unwrap_or_default();
        command.merge_debug = flags("MergeDebug").unwrap_or_default();
        command.merge_information = flags("MergeInformation").unwrap_or_default();

        Ok(command)
    }
}

fn validate_redirect_target(stream: PipelineResultTypes) -> Result<()> {
    if stream == PipelineResultTypes::none
        || stream == PipelineResultTypes::Output
        || stream == PipelineResultTypes::Null
    {
        Ok(())
    } else {
        Err(ProtocolError::violation(
            "redirection target must be none, Output, or Null",
        )
        .into())
    }
}

// ----------------------------------------------------------------------------
// PowerShell pipeline metadata
// ----------------------------------------------------------------------------

/// The invocation settings CREATE_PIPELINE carries (MS-PSRP 2.2.3.11).
#[derive(Debug, Clone, PartialEq)]
pub struct PowerShell {
    pub commands: Vec<Command>,
    pub add_to_history: bool,
    pub apartment_state: Option<ApartmentState>,
    pub history: Option<String>,
    pub host: Option<HostInfo>,
    pub is_nested: bool,
    /// When set, the pipeline accepts no PIPELINE_INPUT messages.
    pub no_input: bool,
    pub remote_stream_options: RemoteStreamOptions,
    pub redirect_shell_error_to_out: bool,
}

impl Default for PowerShell {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            add_to_history: false,
            apartment_state: None,
            history: None,
            host: None,
            is_nested: false,
            no_input: true,
            remote_stream_options: RemoteStreamOptions::none,
            redirect_shell_error_to_out: true,
        }
    }
}

impl PowerShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command to the current statement.
    pub fn add_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Append a script to the current statement.
    pub fn add_script<T: Into<String>>(self, script: T) -> Self {
        self.add_command(Command::script(script))
    }

    /// Close the current statement; subsequent commands start a new one.
    pub fn add_statement(mut self) -> Self {
        if let Some(last) = self.commands.last_mut() {
            last.end_of_statement = true;
        }
        self
    }

    /// Split the command list into statements.
    fn statements(&self) -> Vec<&[Command]> {
        let mut out = Vec::new();
        let mut start = 0;
        for (index, command) in self.commands.iter().enumerate() {
            if command.end_of_statement {
                out.push(&self.commands[start..=index]);
                start = index + 1;
            }
        }
        if start < self.commands.len() {
            out.push(&self.commands[start..]);
        }
        out
    }

    /// The nested `PowerShell` wire object inside CREATE_PIPELINE.
    pub fn to_value(&self, their_version: PsVersion) -> Result<PsValue> {
        if self.commands.is_empty() {
            return Err(ProtocolError::violation(
                "a pipeline requires at least one command",
            )
            .into());
        }

        let statements = self.statements();
        let serialize_statement = |commands: &[Command]| {
            PsValue::list(
                commands
                    .iter()
                    .map(|c| c.to_value(their_version))
                    .collect(),
            )
        };

        let mut props = vec![
            ("Cmds", serialize_statement(statements[0])),
            ("IsNested", PsValue::Bool(self.is_nested)),
            (
                "History",
                self.history.as_deref().map(PsValue::from).unwrap_or(PsValue::Null),
            ),
            (
                "RedirectShellErrorOutputPipe",
                PsValue::Bool(self.redirect_shell_error_to_out),
            ),
        ];

        if statements.len() > 1 {
            // Multiple statements batch as ExtraCmds, one entry per
            // statement. Not in MS-PSRP, but it is what PowerShell sends.
            let extra: Vec<PsValue> = statements
                .iter()
                .map(|statement| note_object([("Cmds", serialize_statement(statement))]))
                .collect();
            props.push(("ExtraCmds", PsValue::list(extra)));
        }

        Ok(note_object(props))
    }

    /// Rebuild from the nested `PowerShell` object plus the surrounding
    /// CREATE_PIPELINE fields.
    pub fn from_value(
        powershell: &PsValue,
        no_input: bool,
        apartment_state: Option<ApartmentState>,
        remote_stream_options: RemoteStreamOptions,
        add_to_history: bool,
        host: Option<HostInfo>,
        is_nested: bool,
    ) -> Result<Self> {
        let mut pipeline = PowerShell {
            add_to_history,
            apartment_state,
            history: opt_str(powershell, "History"),
            host,
            is_nested,
            no_input,
            remote_stream_options,
            redirect_shell_error_to_out: opt(powershell, "RedirectShellErrorOutputPipe")
                .and_then(PsValue::as_bool)
                .unwrap_or(true),
            commands: Vec::new(),
        };

        let statements: Vec<Vec<PsValue>> = match opt(powershell, "ExtraCmds") {
            Some(extra) => extra
                .items()
                .map(<[PsValue]>::to_vec)
                .unwrap_or_default()
                .iter()
                .map(|statement| opt_items(statement, "Cmds"))
                .collect(),
            None => vec![opt_items(powershell, "Cmds")],
        };

        for statement in statements {
            if statement.is_empty() {
                continue;
            }
            for raw in &statement {
                pipeline.commands.push(Command::from_value(raw)?);
            }
            if let Some(last) = pipeline.commands.last_mut() {
                last.end_of_statement = true;
            }
        }

        if pipeline.commands.is_empty() {
            return Err(ProtocolError::violation("pipeline carries no commands").into());
        }
        Ok(pipeline)
    }
}

// ----------------------------------------------------------------------------
// Command metadata queries
// ----------------------------------------------------------------------------

/// The GET_COMMAND_METADATA pipeline payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMetadata {
    /// Wildcard patterns for command names.
    pub name: Vec<String>,
    pub command_type: CommandTypes,
    pub namespace: Vec<String>,
    pub arguments: Vec<PsValue>,
}

impl GetMetadata {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: vec![name.into()],
            command_type: CommandTypes::All,
            namespace: Vec::new(),
            arguments: Vec::new(),
        }
    }

    pub fn to_value(&self) -> PsValue {
        note_object([
            (
                "Name",
                PsValue::list(self.name.iter().map(|n| n.as_str().into()).collect()),
            ),
            ("CommandType", self.command_type.to_value()),
            (
                "Namespace",
                PsValue::list(self.namespace.iter().map(|n| n.as_str().into()).collect()),
            ),
            ("ArgumentList", PsValue::list(self.arguments.clone())),
        ])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let strings = |field: &str| -> Vec<String> {
            opt_items(value, field)
                .iter()
                .filter_map(PsValue::as_str)
                .collect()
        };

        Ok(Self {
            name: strings("Name"),
            command_type: req(value, "GetCommandMetadata", "CommandType")?
                .as_i64()
                .map(CommandTypes::from_i64)
                .unwrap_or(CommandTypes::All),
            namespace: strings("Namespace"),
            arguments: opt_items(value, "ArgumentList"),
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const V23: PsVersion = PsVersion::new(2, 3);
    const V21: PsVersion = PsVersion::new(2, 1);

    #[test]
    fn test_command_wire_round_trip() {
        let mut command = Command::new("Get-Item")
            .parameter("Path", "C:\\temp")
            .argument(1i32);
        command.redirect_error(PipelineResultTypes::Output).unwrap();

        let value = command.to_value(V23);
        assert_eq!(
            value.property("Cmd").and_then(PsValue::as_str).as_deref(),
            Some("Get-Item")
        );
        assert_eq!(value.property("MergeError").and_then(PsValue::as_i64), Some(1));

        let parsed = Command::from_value(&value).unwrap();
        assert_eq!(parsed.command_text, "Get-Item");
        assert_eq!(parsed.parameters.len(), 2);
        assert_eq!(parsed.parameters[0].0.as_deref(), Some("Path"));
        assert_eq!(parsed.parameters[1].0, None);
        assert_eq!(parsed.merge_error(), PipelineResultTypes::Output);
    }

    #[test]
    fn test_merge_fields_gated_by_version() {
        let command = Command::new("Get-Date");
        let old = command.to_value(V21);
        assert!(old.property("MergeError").is_none());
        assert!(old.property("MergeInformation").is_none());

        let v22 = command.to_value(PsVersion::new(2, 2));
        assert!(v22.property("MergeError").is_some());
        assert!(v22.property("MergeInformation").is_none());

        let new = command.to_value(V23);
        assert!(new.property("MergeInformation").is_some());
    }

    #[test]
    fn test_invalid_redirect_target() {
        let mut command = Command::new("x");
        assert!(command.redirect_error(PipelineResultTypes::Warning).is_err());
        assert!(command.redirect_all(PipelineResultTypes::Null).is_ok());
    }

    #[test]
    fn test_statement_batching() {
        let pipeline = PowerShell::new()
            .add_script("Get-Process")
            .add_statement()
            .add_script("Get-Service");

        let value = pipeline.to_value(V23).unwrap();
        assert!(value.property("ExtraCmds").is_some());
        let extra = value.property("ExtraCmds").unwrap().items().unwrap();
        assert_eq!(extra.len(), 2);

        let parsed = PowerShell::from_value(
            &value,
            true,
            None,
            RemoteStreamOptions::none,
            false,
            None,
            false,
        )
        .unwrap();
        assert_eq!(parsed.commands.len(), 2);
        assert!(parsed.commands[0].end_of_statement);
        assert!(parsed.commands[1].end_of_statement);
    }

    #[test]
    fn test_single_statement_has_no_extra_cmds() {
        let pipeline = PowerShell::new().add_script("Get-Process");
        let value = pipeline.to_value(V23).unwrap();
        assert!(value.property("ExtraCmds").is_none());
        assert_eq!(value.property("Cmds").unwrap().items().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(PowerShell::new().to_value(V23).is_err());
    }

    #[test]
    fn test_get_metadata_round_trip() {
        let query = GetMetadata::new("Get-*");
        let value = query.to_value();
        let parsed = GetMetadata::from_value(&value).unwrap();
        assert_eq!(parsed, query);
    }
}
