//! Core identifier and version types for the PSRP protocol
//!
//! This module defines the fundamental wire-adjacent types used throughout
//! the core: .NET-style versions, the known protocol revisions, message
//! destinations, and the GUID byte layout used by .NET serialization.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PsrpError, SerializationError};

// ----------------------------------------------------------------------------
// .NET version
// ----------------------------------------------------------------------------

/// A .NET `System.Version` value.
///
/// Two to four dot-separated numeric parts; the build and revision parts
/// are optional and an absent part sorts below zero, matching .NET
/// comparison semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PsVersion {
    pub major: i32,
    pub minor: i32,
    pub build: Option<i32>,
    pub revision: Option<i32>,
}

impl PsVersion {
    /// Create a two-part version.
    pub const fn new(major: i32, minor: i32) -> Self {
        Self {
            major,
            minor,
            build: None,
            revision: None,
        }
    }

    /// Create a four-part version.
    pub const fn full(major: i32, minor: i32, build: i32, revision: i32) -> Self {
        Self {
            major,
            minor,
            build: Some(build),
            revision: Some(revision),
        }
    }
}

impl fmt::Display for PsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(build) = self.build {
            write!(f, ".{build}")?;
        }
        if let Some(revision) = self.revision {
            write!(f, ".{revision}")?;
        }
        Ok(())
    }
}

impl FromStr for PsVersion {
    type Err = PsrpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(SerializationError::malformed(format!("invalid version '{s}'")).into());
        }

        let parse = |part: &str| {
            part.parse::<i32>()
                .map_err(|_| SerializationError::malformed(format!("invalid version '{s}'")))
        };

        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            build: parts.get(2).map(|p| parse(p)).transpose()?,
            revision: parts.get(3).map(|p| parse(p)).transpose()?,
        })
    }
}

impl PartialOrd for PsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let key = |v: &PsVersion| {
            (
                v.major,
                v.minor,
                v.build.unwrap_or(-1),
                v.revision.unwrap_or(-1),
            )
        };
        key(self).cmp(&key(other))
    }
}

// ----------------------------------------------------------------------------
// Protocol revisions
// ----------------------------------------------------------------------------

/// The known PSRP protocol revisions.
///
/// This implementation speaks 2.3 and therefore understands everything the
/// PowerShell side does. The notable differences between revisions:
///
/// * `Win7Rc` (2.0) has no native GET_COMMAND_METADATA support.
/// * `Pwsh3` (2.2) adds CONNECT_RUNSPACEPOOL and per-stream merge options
///   on serialized commands.
/// * `Pwsh5` (2.3) adds INFORMATION_RECORD, RESET_RUNSPACE_STATE and the
///   information-stream merge option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Windows 7 release candidate (PowerShell 2.0 beta).
    Win7Rc,
    /// Windows 7 RTM (PowerShell 2.0).
    Win7Rtm,
    /// PowerShell 3.0.
    Pwsh3,
    /// PowerShell 5.1 and newer.
    Pwsh5,
}

impl ProtocolVersion {
    /// The wire version number for this revision.
    pub const fn version(self) -> PsVersion {
        match self {
            ProtocolVersion::Win7Rc => PsVersion::new(2, 0),
            ProtocolVersion::Win7Rtm => PsVersion::new(2, 1),
            ProtocolVersion::Pwsh3 => PsVersion::new(2, 2),
            ProtocolVersion::Pwsh5 => PsVersion::new(2, 3),
        }
    }
}

// ----------------------------------------------------------------------------
// Message destination
// ----------------------------------------------------------------------------

/// The endpoint a PSRP message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Destination {
    Client = 0x0000_0001,
    Server = 0x0000_0002,
}

impl Destination {
    /// Convert from the raw wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x0000_0001 => Some(Destination::Client),
            0x0000_0002 => Some(Destination::Server),
            _ => None,
        }
    }

    /// Convert to the raw wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Client => write!(f, "client"),
            Destination::Server => write!(f, "server"),
        }
    }
}

// ----------------------------------------------------------------------------
// GUID wire layout
// ----------------------------------------------------------------------------

/// Encode a GUID in the .NET mixed-endian byte layout (the first three
/// fields little-endian, the rest big-endian).
pub fn guid_to_net_bytes(id: Uuid) -> [u8; 16] {
    id.to_bytes_le()
}

/// Decode a GUID from the .NET mixed-endian byte layout.
pub fn guid_from_net_bytes(bytes: [u8; 16]) -> Uuid {
    Uuid::from_bytes_le(bytes)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_display() {
        let v: PsVersion = "2.3".parse().unwrap();
        assert_eq!(v, PsVersion::new(2, 3));
        assert_eq!(v.to_string(), "2.3");

        let v: PsVersion = "1.1.0.1".parse().unwrap();
        assert_eq!(v, PsVersion::full(1, 1, 0, 1));
        assert_eq!(v.to_string(), "1.1.0.1");

        assert!("1".parse::<PsVersion>().is_err());
        assert!("1.a".parse::<PsVersion>().is_err());
        assert!("1.2.3.4.5".parse::<PsVersion>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        let v20 = PsVersion::new(2, 0);
        let v22 = PsVersion::new(2, 2);
        let v23 = PsVersion::new(2, 3);
        assert!(v20 < v22);
        assert!(v22 < v23);
        assert!(PsVersion::new(2, 2) < PsVersion::full(2, 2, 0, 0));
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(ProtocolVersion::Win7Rc.version(), PsVersion::new(2, 0));
        assert_eq!(ProtocolVersion::Pwsh5.version(), PsVersion::new(2, 3));
        assert!(ProtocolVersion::Pwsh3.version() < ProtocolVersion::Pwsh5.version());
    }

    #[test]
    fn test_guid_net_layout() {
        let id = Uuid::parse_str("00010203-0405-0607-0809-0a0b0c0d0e0f").unwrap();
        let bytes = guid_to_net_bytes(id);
        // The first three fields flip to little-endian.
        assert_eq!(
            bytes,
            [
                0x03, 0x02, 0x01, 0x00, 0x05, 0x04, 0x07, 0x06, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
                0x0d, 0x0e, 0x0f
            ]
        );
        assert_eq!(guid_from_net_bytes(bytes), id);
    }

    #[test]
    fn test_destination_round_trip() {
        assert_eq!(Destination::from_u32(1), Some(Destination::Client));
        assert_eq!(Destination::from_u32(2), Some(Destination::Server));
        assert_eq!(Destination::from_u32(3), None);
        assert_eq!(Destination::Server.as_u32(), 2);
    }
}
