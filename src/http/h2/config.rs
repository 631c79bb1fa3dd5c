//! Connection configuration and HTTP/2 fingerprints
//!
//! What a server sees of an HTTP/2 client before the first request is the
//! initial SETTINGS frame (which parameters, in which order), the first
//! connection WINDOW_UPDATE, and how HEADERS frames are laid out. An
//! `H2Fingerprint` fixes all of these; `ConnConfig` carries it together
//! with the local limits and timers of one connection.

use super::error::{Error, Result};
use super::frames::PrioritySpec;
use super::header_block::PseudoHeaderOrder;
use super::settings::{Settings, SettingsBuilder, SettingsParameter, MAX_WINDOW_SIZE};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;
use std::time::Duration;

/// Stream receive window announced by default
pub const DEFAULT_STREAM_WINDOW: u32 = 4 << 20;

/// Connection receive window grows to 1 GiB with the first WINDOW_UPDATE
pub const DEFAULT_CONN_WINDOW_INCREMENT: u32 = (1 << 30) - DEFAULT_INITIAL_WINDOW_SIZE;

/// Largest response header list accepted by default
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 10 << 20;

/// How long to wait for a health-check PING ack
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP/2 client fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Fingerprint {
    /// Name used in logs
    pub name: String,
    /// Initial SETTINGS, in wire order
    pub settings: Settings,
    /// Increment of the connection WINDOW_UPDATE sent after SETTINGS (0 = none)
    pub window_update: u32,
    /// Pseudo-header order for requests
    pub pseudo_order: PseudoHeaderOrder,
    /// Regular header order for requests (unlisted names follow sorted)
    pub header_order: Option<Vec<String>>,
    /// Priority attached to every request HEADERS frame
    pub headers_priority: Option<PrioritySpec>,
}

impl H2Fingerprint {
    /// Chrome-like client
    pub fn chrome() -> Self {
        H2Fingerprint {
            name: "chrome".to_string(),
            settings: Settings::from_pairs([
                (SettingsParameter::HeaderTableSize, 65536),
                (SettingsParameter::EnablePush, 0),
                (SettingsParameter::InitialWindowSize, 6291456),
                (SettingsParameter::MaxHeaderListSize, 262144),
            ]),
            window_update: 15663105,
            pseudo_order: PseudoHeaderOrder::chrome(),
            header_order: Some(
                [
                    "cache-control",
                    "sec-ch-ua",
                    "sec-ch-ua-mobile",
                    "sec-ch-ua-platform",
                    "upgrade-insecure-requests",
                    "user-agent",
                    "accept",
                    "sec-fetch-site",
                    "sec-fetch-mode",
                    "sec-fetch-user",
                    "sec-fetch-dest",
                    "accept-encoding",
                    "accept-language",
                    "cookie",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            headers_priority: Some(PrioritySpec::new(0, true, 255)),
        }
    }

    /// Firefox-like client
    pub fn firefox() -> Self {
        H2Fingerprint {
            name: "firefox".to_string(),
            settings: Settings::from_pairs([
                (SettingsParameter::HeaderTableSize, 65536),
                (SettingsParameter::InitialWindowSize, 131072),
                (SettingsParameter::MaxFrameSize, 16384),
            ]),
            window_update: 12517377,
            pseudo_order: PseudoHeaderOrder::firefox(),
            header_order: Some(
                [
                    "user-agent",
                    "accept",
                    "accept-language",
                    "accept-encoding",
                    "referer",
                    "cookie",
                    "upgrade-insecure-requests",
                    "sec-fetch-dest",
                    "sec-fetch-mode",
                    "sec-fetch-site",
                    "sec-fetch-user",
                    "te",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            headers_priority: Some(PrioritySpec::new(0, false, 41)),
        }
    }

    /// Parse the common text form
    /// `SETTINGS|WINDOW_UPDATE|PRIORITY|PSEUDO_ORDER`, for example
    /// `1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p`
    ///
    /// The PRIORITY field only distinguishes `0` (no priority frames) and
    /// is otherwise ignored.
    pub fn parse(name: &str, text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split('|').collect();
        if parts.len() != 4 {
            return Err(Error::InvalidConfig(format!(
                "fingerprint {:?} must have four |-separated fields",
                text
            )));
        }

        let mut builder = SettingsBuilder::new();
        for pair in parts[0].split(';').filter(|p| !p.is_empty()) {
            let (id, value) = pair
                .split_once(':')
                .ok_or_else(|| Error::InvalidConfig(format!("malformed setting {:?}", pair)))?;
            let id: u16 = id
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("malformed setting id {:?}", id)))?;
            let value: u32 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("malformed setting value {:?}", value)))?;
            builder = builder.raw(id, value);
        }
        let settings = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("fingerprint settings: {}", e)))?;

        let window_update: u32 = parts[1]
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("malformed window update {:?}", parts[1])))?;
        if window_update > MAX_WINDOW_SIZE - DEFAULT_INITIAL_WINDOW_SIZE {
            return Err(Error::InvalidConfig(format!("window update {} too large", window_update)));
        }

        Ok(H2Fingerprint {
            name: name.to_string(),
            settings,
            window_update,
            pseudo_order: PseudoHeaderOrder::parse(parts[3])?,
            header_order: None,
            headers_priority: None,
        })
    }
}

impl fmt::Display for H2Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings: Vec<String> = self
            .settings
            .iter()
            .map(|s| format!("{}:{}", s.id, s.value))
            .collect();
        let pseudo: Vec<&str> = self
            .pseudo_order
            .iter()
            .map(|p| &p.name()[1..2])
            .collect();
        write!(
            f,
            "{}|{}|0|{}",
            settings.join(";"),
            self.window_update,
            pseudo.join(",")
        )
    }
}

/// Per-connection configuration
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Local SETTINGS_MAX_CONCURRENT_STREAMS to announce, if any
    pub max_concurrent_streams: Option<u32>,
    /// Never exceed the peer's limit, even for reserved requests
    pub strict_max_concurrent_streams: bool,
    /// Send a health-check PING after this long without frames
    pub read_idle_timeout: Option<Duration>,
    /// Close the connection if a health-check PING is not answered in time
    pub ping_timeout: Duration,
    /// Bound on a single blocking write
    pub write_byte_timeout: Option<Duration>,
    /// Close the connection after this long without streams
    pub idle_timeout: Option<Duration>,
    /// HPACK dynamic table size we allow the server to use
    pub max_decoder_header_table_size: u32,
    /// Upper bound on the HPACK dynamic table we use
    pub max_encoder_header_table_size: u32,
    /// Largest frame payload we accept
    pub max_read_frame_size: u32,
    /// Largest response header list we accept
    pub max_header_list_size: u32,
    /// Stream receive window
    pub stream_window_size: u32,
    /// Connection WINDOW_UPDATE increment sent after the preface
    pub conn_window_increment: u32,
    /// Replaces the SETTINGS, WINDOW_UPDATE and header layout derived
    /// from the fields above
    pub fingerprint: Option<H2Fingerprint>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            max_concurrent_streams: None,
            strict_max_concurrent_streams: false,
            read_idle_timeout: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            write_byte_timeout: None,
            idle_timeout: None,
            max_decoder_header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_encoder_header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_read_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            stream_window_size: DEFAULT_STREAM_WINDOW,
            conn_window_increment: DEFAULT_CONN_WINDOW_INCREMENT,
            fingerprint: None,
        }
    }
}

/// Limits that follow from what we announced to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLimits {
    pub stream_window: u32,
    pub max_read_frame_size: u32,
    pub max_header_list_size: u32,
    pub header_table_size: u32,
}

impl ConnConfig {
    /// Initial SETTINGS sent after the preface
    pub fn initial_settings(&self) -> Settings {
        if let Some(fp) = &self.fingerprint {
            return fp.settings.clone();
        }
        let mut settings = Settings::new();
        settings.set(SettingsParameter::EnablePush, 0);
        if let Some(max) = self.max_concurrent_streams {
            settings.set(SettingsParameter::MaxConcurrentStreams, max);
        }
        settings.set(SettingsParameter::InitialWindowSize, self.stream_window_size);
        settings.set(SettingsParameter::MaxFrameSize, self.max_read_frame_size);
        settings.set(SettingsParameter::MaxHeaderListSize, self.max_header_list_size);
        if self.max_decoder_header_table_size != DEFAULT_HEADER_TABLE_SIZE {
            settings.set(SettingsParameter::HeaderTableSize, self.max_decoder_header_table_size);
        }
        settings
    }

    /// Connection WINDOW_UPDATE increment sent after SETTINGS
    pub fn initial_window_update(&self) -> u32 {
        match &self.fingerprint {
            Some(fp) => fp.window_update,
            None => self.conn_window_increment,
        }
    }

    /// Local limits as implied by `initial_settings`
    ///
    /// A parameter we did not announce has its protocol default, except the
    /// header list size, which falls back to our own limit.
    pub fn local_limits(&self) -> LocalLimits {
        let settings = self.initial_settings();
        LocalLimits {
            stream_window: settings.initial_window_size().unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE),
            max_read_frame_size: settings.max_frame_size().unwrap_or(DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: settings.max_header_list_size().unwrap_or(self.max_header_list_size),
            header_table_size: settings.header_table_size().unwrap_or(DEFAULT_HEADER_TABLE_SIZE),
        }
    }

    /// Pseudo-header order for requests without their own
    pub fn pseudo_order(&self) -> PseudoHeaderOrder {
        self.fingerprint
            .as_ref()
            .map(|fp| fp.pseudo_order)
            .unwrap_or_default()
    }

    /// Regular header order for requests without their own
    pub fn header_order(&self) -> Option<&[String]> {
        self.fingerprint.as_ref().and_then(|fp| fp.header_order.as_deref())
    }

    /// Priority attached to request HEADERS frames
    pub fn headers_priority(&self) -> Option<PrioritySpec> {
        self.fingerprint.as_ref().and_then(|fp| fp.headers_priority)
    }

    /// Name for logs
    pub fn fingerprint_name(&self) -> &str {
        self.fingerprint.as_ref().map(|fp| fp.name.as_str()).unwrap_or("default")
    }
}
