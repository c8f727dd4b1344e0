//! Host information carried by INIT_RUNSPACEPOOL and CREATE_PIPELINE
//!
//! MS-PSRP 2.2.3.14 HostInfo: four null-ness booleans plus, for a real
//! host, a `_hostDefaultData` bundle of console state keyed by property
//! index. The default value describes a null host, which is what headless
//! automation normally sends.

use crate::errors::Result;
use crate::protocol::enums::ConsoleColor;
use crate::protocol::{missing_field, note_object, opt, req, req_bool, req_i32};
use crate::value::{Container, PsObject, PsValue};

// ----------------------------------------------------------------------------
// Console geometry
// ----------------------------------------------------------------------------

/// A screen-buffer coordinate pair (MS-PSRP 2.2.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
}

impl Coordinates {
    fn to_value(self) -> PsValue {
        note_object([("x", self.x.into()), ("y", self.y.into())])
    }

    fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            x: req_i32(value, "HostDefaultData", "x")?,
            y: req_i32(value, "HostDefaultData", "y")?,
        })
    }
}

/// A width/height pair measured in character cells (MS-PSRP 2.2.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    fn to_value(self) -> PsValue {
        note_object([
            ("width", self.width.into()),
            ("height", self.height.into()),
        ])
    }

    fn from_value(value: &PsValue) -> Result<Self> {
        Ok(Self {
            width: req_i32(value, "HostDefaultData", "width")?,
            height: req_i32(value, "HostDefaultData", "height")?,
        })
    }
}

// ----------------------------------------------------------------------------
// Host default data
// ----------------------------------------------------------------------------

/// Console state snapshot a hosted UI presents to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDefaultData {
    pub foreground_color: ConsoleColor,
    pub background_color: ConsoleColor,
    pub cursor_position: Coordinates,
    pub window_position: Coordinates,
    /// Cursor size as a percentage, 0..=100.
    pub cursor_size: i32,
    pub buffer_size: Size,
    pub window_size: Size,
    pub max_window_size: Size,
    pub max_physical_window_size: Size,
    pub window_title: String,
}

impl Default for HostDefaultData {
    fn default() -> Self {
        Self {
            foreground_color: ConsoleColor::Gray,
            background_color: ConsoleColor::Black,
            cursor_position: Coordinates::default(),
            window_position: Coordinates::default(),
            cursor_size: 25,
            buffer_size: Size {
                width: 120,
                height: 3000,
            },
            window_size: Size {
                width: 120,
                height: 50,
            },
            max_window_size: Size {
                width: 120,
                height: 50,
            },
            max_physical_window_size: Size {
                width: 120,
                height: 50,
            },
            window_title: String::new(),
        }
    }
}

/// Wrap an entry of the `data` dict: `{ T: type name, V: value }`.
fn typed_entry(type_name: &str, value: PsValue) -> PsValue {
    note_object([("T", type_name.into()), ("V", value)])
}

impl HostDefaultData {
    pub fn to_value(&self) -> PsValue {
        let entries: Vec<(PsValue, PsValue)> = [
            typed_entry("System.ConsoleColor", (self.foreground_color.as_i64() as i32).into()),
            typed_entry("System.ConsoleColor", (self.background_color.as_i64() as i32).into()),
            typed_entry(
                "System.Management.Automation.Host.Coordinates",
                self.cursor_position.to_value(),
            ),
            typed_entry(
                "System.Management.Automation.Host.Coordinates",
                self.window_position.to_value(),
            ),
            typed_entry("System.Int32", self.cursor_size.into()),
            typed_entry(
                "System.Management.Automation.Host.Size",
                self.buffer_size.to_value(),
            ),
            typed_entry(
                "System.Management.Automation.Host.Size",
                self.window_size.to_value(),
            ),
            typed_entry(
                "System.Management.Automation.Host.Size",
                self.max_window_size.to_value(),
            ),
            typed_entry(
                "System.Management.Automation.Host.Size",
                self.max_physical_window_size.to_value(),
            ),
            typed_entry("System.String", self.window_title.as_str().into()),
        ]
        .into_iter()
        .enumerate()
        .map(|(index, value)| (PsValue::Int32(index as i32), value))
        .collect();

        let mut data = PsObject::new();
        data.container = Some(Container::Dict(entries));

        note_object([("data", PsValue::object(data))])
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let data = req(value, "HostDefaultData", "data")?;
        let entries = data
            .entries()
            .ok_or_else(|| missing_field("HostDefaultData", "data"))?;

        let slot = |index: i32| -> Result<&PsValue> {
            entries
                .iter()
                .find(|(key, _)| key.as_i64() == Some(i64::from(index)))
                .map(|(_, entry)| entry)
                .and_then(|entry| entry.property("V"))
                .ok_or_else(|| missing_field("HostDefaultData", "data"))
        };

        let color = |index: i32| -> Result<ConsoleColor> {
            let raw = slot(index)?
                .as_i64()
                .ok_or_else(|| missing_field("HostDefaultData", "data"))?;
            Ok(ConsoleColor::from_i64(raw).unwrap_or(ConsoleColor::Gray))
        };

        Ok(Self {
            foreground_color: color(0)?,
            background_color: color(1)?,
            cursor_position: Coordinates::from_value(slot(2)?)?,
            window_position: Coordinates::from_value(slot(3)?)?,
            cursor_size: slot(4)?
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| missing_field("HostDefaultData", "data"))?,
            buffer_size: Size::from_value(slot(5)?)?,
            window_size: Size::from_value(slot(6)?)?,
            max_window_size: Size::from_value(slot(7)?)?,
            max_physical_window_size: Size::from_value(slot(8)?)?,
            window_title: slot(9)?
                .as_str()
                .ok_or_else(|| missing_field("HostDefaultData", "data"))?,
        })
    }
}

// ----------------------------------------------------------------------------
// Host info
// ----------------------------------------------------------------------------

/// Whether (and how much of) a PSHost exists on the sending side.
#[derive(Debug, Clone, PartialEq)]
pub struct HostInfo {
    pub is_host_null: bool,
    pub is_host_ui_null: bool,
    pub is_host_raw_ui_null: bool,
    /// When creating a pipeline, reuse the runspace pool's host.
    pub use_runspace_host: bool,
    pub default_data: Option<HostDefaultData>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            is_host_null: true,
            is_host_ui_null: true,
            is_host_raw_ui_null: true,
            use_runspace_host: true,
            default_data: None,
        }
    }
}

impl HostInfo {
    /// A host with a full console UI and the given default data.
    pub fn with_default_data(default_data: HostDefaultData) -> Self {
        Self {
            is_host_null: false,
            is_host_ui_null: false,
            is_host_raw_ui_null: false,
            use_runspace_host: false,
            default_data: Some(default_data),
        }
    }

    pub fn to_value(&self) -> PsValue {
        let mut props = vec![
            ("_isHostNull", PsValue::Bool(self.is_host_null)),
            ("_isHostUINull", PsValue::Bool(self.is_host_ui_null)),
            ("_isHostRawUINull", PsValue::Bool(self.is_host_raw_ui_null)),
            ("_useRunspaceHost", PsValue::Bool(self.use_runspace_host)),
        ];
        if let Some(default_data) = &self.default_data {
            props.push(("_hostDefaultData", default_data.to_value()));
        }
        note_object(props)
    }

    pub fn from_value(value: &PsValue) -> Result<Self> {
        let default_data = opt(value, "_hostDefaultData")
            .map(HostDefaultData::from_value)
            .transpose()?;

        Ok(Self {
            is_host_null: req_bool(value, "HostInfo", "_isHostNull")?,
            is_host_ui_null: req_bool(value, "HostInfo", "_isHostUINull")?,
            is_host_raw_ui_null: req_bool(value, "HostInfo", "_isHostRawUINull")?,
            use_runspace_host: req_bool(value, "HostInfo", "_useRunspaceHost")?,
            default_data,
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
    fn test_null_host_round_trip() {
        let host = HostInfo::default();
        let value = host.to_value();
        let xml = serialize_clixml(&value).unwrap();
        assert!(xml.contains("<B N=\"_isHostNull\">true</B>"));
        assert!(!xml.contains("_hostDefaultData"));

        let decoded = deserialize_clixml(&xml).unwrap().remove(0);
        assert_eq!(HostInfo::from_value(&decoded).unwrap(), host);
    }

    #[test]
    fn test_host_with_console_round_trip() {
        let host = HostInfo::with_default_data(HostDefaultData {
            window_title: "psrp".to_string(),
            cursor_position: Coordinates { x: 3, y: 14 },
            ..HostDefaultData::default()
        });

        let value = host.to_value();
        let xml = serialize_clixml(&value).unwrap();
        let decoded = deserialize_clixml(&xml).unwrap().remove(0);
        let parsed = HostInfo::from_value(&decoded).unwrap();
        assert_eq!(parsed, host);
        let default_data = parsed.default_data.unwrap();
        assert_eq!(default_data.cursor_position, Coordinates { x: 3, y: 14 });
        assert_eq!(default_data.window_title, "psrp");
    }

    #[test]
    fn test_missing_required_flag_rejected() {
        let value = note_object([("_isHostNull", PsValue::Bool(true))]);
        assert!(HostInfo::from_value(&value).is_err());
    }
}
