//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS frames and parameters
//! as defined in RFC 7540 Section 6.5.
//!
//! Settings keep the order they were added in, since the order of the
//! initial SETTINGS frame is part of a client's fingerprint.

use super::error::{Error, ErrorCode, Result};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,

    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,

    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x8) - RFC 8441
    EnableConnectProtocol = 0x8,

    /// SETTINGS_NO_RFC7540_PRIORITIES (0x9) - RFC 9218
    NoRfc7540Priorities = 0x9,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0x8 => Some(SettingsParameter::EnableConnectProtocol),
            0x9 => Some(SettingsParameter::NoRfc7540Priorities),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
            SettingsParameter::NoRfc7540Priorities => "NO_RFC7540_PRIORITIES",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// Smallest legal SETTINGS_MAX_FRAME_SIZE
pub const MIN_MAX_FRAME_SIZE: u32 = 1 << 14;

/// Largest legal SETTINGS_MAX_FRAME_SIZE
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Largest legal flow-control window
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// One setting; `id` may name a parameter this crate does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: u16,
    pub value: u32,
}

impl Setting {
    /// Known parameter, if any
    pub fn parameter(&self) -> Option<SettingsParameter> {
        SettingsParameter::from_u16(self.id)
    }
}

/// Ordered HTTP/2 settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    params: Vec<Setting>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings { params: Vec::new() }
    }

    /// Settings from (parameter, value) pairs, in order
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (SettingsParameter, u32)>,
    {
        let mut settings = Settings::new();
        for (param, value) in pairs {
            settings.set(param, value);
        }
        settings
    }

    /// Set a parameter; an existing entry keeps its position
    pub fn set(&mut self, param: SettingsParameter, value: u32) {
        self.set_raw(param.as_u16(), value);
    }

    /// Set a parameter by raw identifier
    pub fn set_raw(&mut self, id: u16, value: u32) {
        match self.params.iter_mut().find(|s| s.id == id) {
            Some(existing) => existing.value = value,
            None => self.params.push(Setting { id, value }),
        }
    }

    /// Value of a parameter, if present
    pub fn get(&self, param: SettingsParameter) -> Option<u32> {
        let id = param.as_u16();
        // Later duplicates win, as when applied in order
        self.params.iter().rev().find(|s| s.id == id).map(|s| s.value)
    }

    /// Parameters in wire order
    pub fn iter(&self) -> impl Iterator<Item = &Setting> {
        self.params.iter()
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters are set
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Get header table size
    pub fn header_table_size(&self) -> Option<u32> {
        self.get(SettingsParameter::HeaderTableSize)
    }

    /// Get max concurrent streams
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.get(SettingsParameter::MaxConcurrentStreams)
    }

    /// Get initial window size
    pub fn initial_window_size(&self) -> Option<u32> {
        self.get(SettingsParameter::InitialWindowSize)
    }

    /// Get max frame size
    pub fn max_frame_size(&self) -> Option<u32> {
        self.get(SettingsParameter::MaxFrameSize)
    }

    /// Get max header list size
    pub fn max_header_list_size(&self) -> Option<u32> {
        self.get(SettingsParameter::MaxHeaderListSize)
    }

    /// Validate settings values (RFC 7540 Section 6.5.2)
    pub fn validate(&self) -> Result<()> {
        for setting in &self.params {
            match setting.parameter() {
                Some(SettingsParameter::EnablePush) if setting.value > 1 => {
                    return Err(Error::connection(
                        ErrorCode::ProtocolError,
                        format!("invalid ENABLE_PUSH value {}", setting.value),
                    ));
                }
                Some(SettingsParameter::InitialWindowSize) if setting.value > MAX_WINDOW_SIZE => {
                    return Err(Error::connection(
                        ErrorCode::FlowControlError,
                        format!("initial window size {} exceeds maximum (2^31-1)", setting.value),
                    ));
                }
                Some(SettingsParameter::MaxFrameSize)
                    if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&setting.value) =>
                {
                    return Err(Error::connection(
                        ErrorCode::ProtocolError,
                        format!("max frame size {} outside valid range (16384-16777215)", setting.value),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Append the wire payload (6 bytes per parameter)
    pub fn encode(&self, dst: &mut BytesMut) {
        for setting in &self.params {
            dst.put_u16(setting.id);
            dst.put_u32(setting.value);
        }
    }

    /// Parse a SETTINGS payload; values are not validated here
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() % 6 != 0 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                format!("SETTINGS payload length {} not a multiple of 6", payload.len()),
            ));
        }
        let params = payload
            .chunks_exact(6)
            .map(|chunk| Setting {
                id: u16::from_be_bytes([chunk[0], chunk[1]]),
                value: u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
            })
            .collect();
        Ok(Settings { params })
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for setting in &self.params {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match setting.parameter() {
                Some(param) => write!(f, "{}={}", param.name(), setting.value)?,
                None => write!(f, "0x{:x}={}", setting.id, setting.value)?,
            }
        }
        Ok(())
    }
}

/// Builder for HTTP/2 settings
///
/// Parameters are emitted in the order the builder methods are called.
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsParameter::HeaderTableSize, size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.set(SettingsParameter::EnablePush, enable as u32);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.set(SettingsParameter::MaxConcurrentStreams, max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsParameter::InitialWindowSize, size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsParameter::MaxFrameSize, size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.set(SettingsParameter::MaxHeaderListSize, size);
        self
    }

    /// Set enable CONNECT protocol
    pub fn enable_connect_protocol(mut self, enable: bool) -> Self {
        self.settings.set(SettingsParameter::EnableConnectProtocol, enable as u32);
        self
    }

    /// Set no RFC 7540 priorities
    pub fn no_rfc7540_priorities(mut self, disable: bool) -> Self {
        self.settings.set(SettingsParameter::NoRfc7540Priorities, disable as u32);
        self
    }

    /// Set a parameter by raw identifier (e.g. GREASE values)
    pub fn raw(mut self, id: u16, value: u32) -> Self {
        self.settings.set_raw(id, value);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_parameter_conversion() {
        assert_eq!(SettingsParameter::HeaderTableSize.as_u16(), 0x1);
        assert_eq!(SettingsParameter::from_u16(0x2), Some(SettingsParameter::EnablePush));
        assert_eq!(SettingsParameter::from_u16(0xff), None);
    }

    #[test]
    fn test_builder_keeps_call_order() {
        let settings = SettingsBuilder::new()
            .header_table_size(65536)
            .enable_push(false)
            .initial_window_size(6291456)
            .max_header_list_size(262144)
            .build()
            .unwrap();

        let ids: Vec<u16> = settings.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0x1, 0x2, 0x4, 0x6]);
        assert_eq!(settings.initial_window_size(), Some(6291456));
        assert_eq!(settings.max_concurrent_streams(), None);
    }

    #[test]
    fn test_set_existing_keeps_position() {
        let mut settings = Settings::new();
        settings.set(SettingsParameter::MaxFrameSize, 16384);
        settings.set(SettingsParameter::EnablePush, 0);
        settings.set(SettingsParameter::MaxFrameSize, 32768);
        assert_eq!(settings.len(), 2);
        assert_eq!(settings.iter().next().map(|s| s.value), Some(32768));
    }

    #[test]
    fn test_settings_validation() {
        assert!(SettingsBuilder::new().initial_window_size(65535).max_frame_size(16384).build().is_ok());

        let err = SettingsBuilder::new().initial_window_size(0x80000000).build().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FlowControlError));

        let err = SettingsBuilder::new().max_frame_size(1024).build().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ProtocolError));

        assert!(SettingsBuilder::new().max_frame_size(16777216).build().is_err());
        assert!(SettingsBuilder::new().raw(0x2, 2).build().is_err());
    }

    #[test]
    fn test_decode_payload() {
        let mut buf = BytesMut::new();
        SettingsBuilder::new()
            .max_concurrent_streams(100)
            .raw(0x0a0a, 7)
            .build()
            .unwrap()
            .encode(&mut buf);
        assert_eq!(buf.len(), 12);

        let decoded = Settings::decode(&buf).unwrap();
        assert_eq!(decoded.max_concurrent_streams(), Some(100));
        assert_eq!(decoded.iter().nth(1).and_then(|s| s.parameter()), None);

        let err = Settings::decode(&buf[..7]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameSizeError));
    }

    #[test]
    fn test_display() {
        let settings = SettingsBuilder::new().enable_push(false).raw(0x0a0a, 1).build().unwrap();
        assert_eq!(settings.to_string(), "ENABLE_PUSH=0, 0xa0a=1");
    }
}
