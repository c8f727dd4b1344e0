//! Protocol enums carried inside PSRP message bodies
//!
//! These mirror the .NET enums MS-PSRP serializes by value: pool and
//! pipeline states, thread/apartment options, stream merge flags and the
//! host method identifiers. Each exposes its CLIXML form via `to_value`
//! and a registry entry so inbound objects rehydrate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::Registration;
use crate::value::{NumericTag, PsEnum, PsValue};

/// Generate a unit enum with MS-PSRP numeric values, label lookup, and a
/// registry entry rehydrating it from CLIXML.
macro_rules! ps_enum {
    (
        $(#[$meta:meta])*
        $name:ident [$($type_name:literal),+ $(,)?] {
            $($variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(i32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_i64(value: i64) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn as_i64(self) -> i64 {
                self as i64
            }

            pub fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }

            /// The full .NET type-name list, most derived first.
            pub fn type_names() -> Vec<String> {
                vec![$($type_name.to_string()),+]
            }

            /// The CLIXML enum object for this value.
            pub fn to_value(self) -> PsValue {
                PsValue::enumeration(PsEnum {
                    type_names: Self::type_names(),
                    value: self.as_i64(),
                    tag: NumericTag::Int32,
                    labels: vec![self.label().to_string()],
                })
            }

            /// Registry entry used to rehydrate incoming values.
            pub fn registration() -> Registration {
                Registration::enumeration(
                    &[$($type_name),+],
                    NumericTag::Int32,
                    false,
                    vec![$((stringify!($variant), $value)),+],
                )
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

/// Generate a flags newtype with MS-PSRP bit values and a registry entry.
macro_rules! ps_flags {
    (
        $(#[$meta:meta])*
        $name:ident [$($type_name:literal),+ $(,)?] {
            $($flag:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl $name {
            $(#[allow(non_upper_case_globals)]
              pub const $flag: Self = Self($value);)+

            pub fn from_i64(value: i64) -> Self {
                Self(value)
            }

            pub fn as_i64(self) -> i64 {
                self.0
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn type_names() -> Vec<String> {
                vec![$($type_name.to_string()),+]
            }

            pub fn to_value(self) -> PsValue {
                let registration = Self::registration();
                PsValue::enumeration(PsEnum {
                    type_names: Self::type_names(),
                    value: self.0,
                    tag: NumericTag::Int32,
                    labels: registration.labels_for(self.0),
                })
            }

            pub fn registration() -> Registration {
                Registration::enumeration(
                    &[$($type_name),+],
                    NumericTag::Int32,
                    true,
                    vec![$((stringify!($flag), $value)),+],
                )
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

// ----------------------------------------------------------------------------
// Pool and pipeline lifecycle states
// ----------------------------------------------------------------------------

ps_enum! {
    /// Runspace pool lifecycle states (MS-PSRP 2.2.3.4, .NET values).
    RunspacePoolState [
        "System.Management.Automation.Runspaces.RunspacePoolState",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        BeforeOpen = 0,
        Opening = 1,
        Opened = 2,
        Closed = 3,
        Closing = 4,
        Broken = 5,
        NegotiationSent = 6,
        NegotiationSucceeded = 7,
        Connecting = 8,
        Disconnected = 9,
    }
}

impl RunspacePoolState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunspacePoolState::Closed | RunspacePoolState::Broken)
    }
}

ps_enum! {
    /// Pipeline invocation states (MS-PSRP 2.2.3.5).
    PsInvocationState [
        "System.Management.Automation.PSInvocationState",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        NotStarted = 0,
        Running = 1,
        Stopping = 2,
        Stopped = 3,
        Completed = 4,
        Failed = 5,
        Disconnected = 6,
    }
}

impl PsInvocationState {
    /// Whether the pipeline has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PsInvocationState::Stopped | PsInvocationState::Completed | PsInvocationState::Failed
        )
    }
}

// ----------------------------------------------------------------------------
// Invocation options
// ----------------------------------------------------------------------------

ps_enum! {
    /// Thread reuse policy for pipeline invocations (MS-PSRP 2.2.3.6).
    PsThreadOptions [
        "System.Management.Automation.Runspaces.PSThreadOptions",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        Default = 0,
        UseNewThread = 1,
        ReuseThread = 2,
        UseCurrentThread = 3,
    }
}

ps_enum! {
    /// COM apartment state of the executing thread (MS-PSRP 2.2.3.7).
    #[allow(clippy::upper_case_acronyms)]
    ApartmentState [
        "System.Threading.ApartmentState",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        STA = 0,
        MTA = 1,
        Unknown = 2,
    }
}

ps_enum! {
    /// Whether a progress record marks progress or completion.
    ProgressRecordType [
        "System.Management.Automation.ProgressRecordType",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        Processing = 0,
        Completed = 1,
    }
}

ps_enum! {
    /// Categories an error record is classified under (MS-PSRP 2.2.3.9).
    ErrorCategory [
        "System.Management.Automation.ErrorCategory",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        NotSpecified = 0,
        OpenError = 1,
        CloseError = 2,
        DeviceError = 3,
        DeadlockDetected = 4,
        InvalidArgument = 5,
        InvalidData = 6,
        InvalidOperation = 7,
        InvalidResult = 8,
        InvalidType = 9,
        MetadataError = 10,
        NotImplemented = 11,
        NotInstalled = 12,
        ObjectNotFound = 13,
        OperationStopped = 14,
        OperationTimeout = 15,
        SyntaxError = 16,
        ParserError = 17,
        PermissionDenied = 18,
        ResourceBusy = 19,
        ResourceExists = 20,
        ResourceUnavailable = 21,
        ReadError = 22,
        WriteError = 23,
        FromStdErr = 24,
        SecurityError = 25,
        ProtocolError = 26,
        ConnectionError = 27,
        AuthenticationError = 28,
        LimitsExceeded = 29,
        QuotaExceeded = 30,
        NotEnabled = 31,
    }
}

impl Default for ErrorCategory {
    fn default() -> Self {
        ErrorCategory::NotSpecified
    }
}

ps_flags! {
    /// Controls which stream records get InvocationInfo attached
    /// (MS-PSRP 2.2.3.8).
    RemoteStreamOptions [
        "System.Management.Automation.RemoteStreamOptions",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        none = 0,
        AddInvocationInfoToErrorRecord = 1,
        AddInvocationInfoToWarningRecord = 2,
        AddInvocationInfoToDebugRecord = 4,
        AddInvocationInfoToVerboseRecord = 8,
        AddInvocationInfo = 15,
    }
}

ps_flags! {
    /// Where a command's non-output streams merge to.
    PipelineResultTypes [
        "System.Management.Automation.Runspaces.PipelineResultTypes",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        none = 0,
        Output = 1,
        Error = 2,
        Warning = 3,
        Verbose = 4,
        Debug = 5,
        Information = 6,
        All = 7,
        Null = 8,
    }
}

ps_flags! {
    /// Command kinds GET_COMMAND_METADATA may filter by.
    CommandTypes [
        "System.Management.Automation.CommandTypes",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        Alias = 1,
        Function = 2,
        Filter = 4,
        Cmdlet = 8,
        ExternalScript = 16,
        Application = 32,
        Script = 64,
        Configuration = 256,
        All = 383,
    }
}

ps_enum! {
    /// Console colors used by host default data.
    ConsoleColor [
        "System.ConsoleColor",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        Black = 0,
        DarkBlue = 1,
        DarkGreen = 2,
        DarkCyan = 3,
        DarkRed = 4,
        DarkMagenta = 5,
        DarkYellow = 6,
        Gray = 7,
        DarkGray = 8,
        Blue = 9,
        Green = 10,
        Cyan = 11,
        Red = 12,
        Magenta = 13,
        Yellow = 14,
        White = 15,
    }
}

ps_enum! {
    /// Host methods a server may invoke on the client (MS-PSRP 2.2.3.17).
    HostMethodIdentifier [
        "System.Management.Automation.Remoting.RemoteHostMethodId",
        "System.Enum",
        "System.ValueType",
        "System.Object",
    ] {
        GetName = 1,
        GetVersion = 2,
        GetInstanceId = 3,
        GetCurrentCulture = 4,
        GetCurrentUICulture = 5,
        SetShouldExit = 6,
        EnterNestedPrompt = 7,
        ExitNestedPrompt = 8,
        NotifyBeginApplication = 9,
        NotifyEndApplication = 10,
        ReadLine = 11,
        ReadLineAsSecureString = 12,
        Write1 = 13,
        Write2 = 14,
        WriteLine1 = 15,
        WriteLine2 = 16,
        WriteLine3 = 17,
        WriteErrorLine = 18,
        WriteDebugLine = 19,
        WriteProgress = 20,
        WriteVerboseLine = 21,
        WriteWarningLine = 22,
        Prompt = 23,
        PromptForCredential1 = 24,
        PromptForCredential2 = 25,
        PromptForChoice = 26,
        GetForegroundColor = 27,
        SetForegroundColor = 28,
        GetBackgroundColor = 29,
        SetBackgroundColor = 30,
        GetCursorPosition = 31,
        SetCursorPosition = 32,
        GetWindowPosition = 33,
        SetWindowPosition = 34,
        GetCursorSize = 35,
        SetCursorSize = 36,
        GetBufferSize = 37,
        SetBufferSize = 38,
        GetWindowSize = 39,
        SetWindowSize = 40,
        GetWindowTitle = 41,
        SetWindowTitle = 42,
        GetMaxWindowSize = 43,
        GetMaxPhysicalWindowSize = 44,
        GetKeyAvailable = 45,
        ReadKey = 46,
        FlushInputBuffer = 47,
        SetBufferContents1 = 48,
        SetBufferContents2 = 49,
        GetBufferContents = 50,
        ScrollBufferContents = 51,
        PushRunspace = 52,
        PopRunspace = 53,
        GetIsRunspacePushed = 54,
        GetRunspace = 55,
        PromptForChoiceMultipleSelection = 56,
    }
}

impl HostMethodIdentifier {
    /// Whether the method returns nothing. Void methods are fired with the
    /// sentinel call id -100 and never get a response.
    pub fn is_void(self) -> bool {
        use HostMethodIdentifier::*;
        matches!(
            self,
            SetShouldExit
                | EnterNestedPrompt
                | ExitNestedPrompt
                | NotifyBeginApplication
                | NotifyEndApplication
                | PushRunspace
                | PopRunspace
                | Write1
                | Write2
                | WriteLine1
                | WriteLine2
                | WriteLine3
                | WriteErrorLine
                | WriteDebugLine
                | WriteProgress
                | WriteVerboseLine
                | WriteWarningLine
                | SetForegroundColor
                | SetBackgroundColor
                | SetCursorPosition
                | SetWindowPosition
                | SetCursorSize
                | SetBufferSize
                | SetWindowSize
                | SetWindowTitle
                | FlushInputBuffer
                | SetBufferContents1
                | SetBufferContents2
                | ScrollBufferContents
        )
    }
}

// ----------------------------------------------------------------------------
// Standard registry seed
// ----------------------------------------------------------------------------

/// The registrations every standard registry starts with: the protocol
/// enums above plus the rehydratable object shells PSRP round-trips.
pub fn standard_registrations() -> Vec<Registration> {
    vec![
        RunspacePoolState::registration(),
        PsInvocationState::registration(),
        PsThreadOptions::registration(),
        ApartmentState::registration(),
        ProgressRecordType::registration(),
        ErrorCategory::registration(),
        RemoteStreamOptions::registration(),
        PipelineResultTypes::registration(),
        CommandTypes::registration(),
        ConsoleColor::registration(),
        HostMethodIdentifier::registration(),
        Registration::object(&[
            "System.Management.Automation.PSCustomObject",
            "System.Object",
        ]),
        Registration::object(&["System.Collections.Hashtable", "System.Object"]),
        Registration::object(&["System.Collections.ArrayList", "System.Object"]),
        Registration::object(&["System.Collections.Stack", "System.Object"]),
        Registration::object(&["System.Collections.Queue", "System.Object"]),
        Registration::object(&[
            "System.Management.Automation.PSPrimitiveDictionary",
            "System.Collections.Hashtable",
            "System.Object",
        ]),
    ]
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
