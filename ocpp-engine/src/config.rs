//! Configuration for sessions, the central system and simulated stations

use std::net::SocketAddr;
use std::time::Duration;

use crate::registry::DuplicatePolicy;

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on waiting for a CALL's reply
    pub call_timeout: Duration,

    /// Subprotocols this side accepts, in preference order
    pub subprotocols: Vec<String>,
}

/// Central system (server role) settings
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: SocketAddr,

    /// Subprotocols offered during the handshake, in preference order
    pub subprotocols: Vec<String>,

    /// Heartbeat interval handed out in BootNotification responses
    pub heartbeat_interval: Duration,

    /// Request timeout for CSMS-initiated calls
    pub call_timeout: Duration,

    /// What to do when an identity connects while already connected
    pub duplicate_policy: DuplicatePolicy,

    /// Maximum inbound message size
    pub max_message_size: usize,

    /// Maximum inbound frame size
    pub max_frame_size: usize,
}

/// Charging station (client role) settings
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// CSMS WebSocket URL (without station ID)
    pub csms_url: String,

    /// Station ID (appended to URL)
    pub station_id: String,

    /// Subprotocol requested during the handshake
    pub subprotocol: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Serial number (optional)
    pub serial_number: Option<String>,

    /// Firmware version (optional)
    pub firmware_version: Option<String>,

    /// Request timeout
    pub call_timeout: Duration,

    /// BootNotification retry delay when the CSMS answers with interval 0
    pub boot_retry_interval: Duration,

    /// Maximum inbound message size
    pub max_message_size: usize,

    /// Maximum inbound frame size
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            subprotocols: vec![OCPP_SUBPROTOCOL.to_string()],
        }
    }
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            subprotocols: vec![OCPP_SUBPROTOCOL.to_string()],
            heartbeat_interval: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            duplicate_policy: DuplicatePolicy::default(),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:9000".to_string(),
            station_id: "CP_1".to_string(),
            subprotocol: OCPP_SUBPROTOCOL.to_string(),
            vendor: "anewone".to_string(),
            model: "Wallbox XYZ".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            call_timeout: Duration::from_secs(30),
            boot_retry_interval: Duration::from_secs(10),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }
}

impl CsmsConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set heartbeat interval handed to stations
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set request timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set duplicate identity policy
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Replace the offered subprotocols
    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    /// Session settings for each accepted connection
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            call_timeout: self.call_timeout,
            subprotocols: self.subprotocols.clone(),
        }
    }
}

impl StationConfig {
    /// Create config with basic parameters
    pub fn new(station_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            csms_url: csms_url.into(),
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    /// Set serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    /// Set requested subprotocol
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    /// Set request timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Full WebSocket URL including the station ID path segment
    pub fn url(&self) -> String {
        format!("{}/{}", self.csms_url.trim_end_matches('/'), self.station_id)
    }

    /// Session settings for the station's connection
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            call_timeout: self.call_timeout,
            subprotocols: vec![self.subprotocol.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_config_builder() {
        let config = StationConfig::new("CP_1", "ws://localhost:9000/")
            .with_vendor("EK", "EK3")
            .with_serial("SN001")
            .with_call_timeout(Duration::from_secs(5));

        assert_eq!(config.station_id, "CP_1");
        assert_eq!(config.vendor, "EK");
        assert_eq!(config.serial_number.as_deref(), Some("SN001"));
        assert_eq!(config.url(), "ws://localhost:9000/CP_1");
        assert_eq!(config.session_config().call_timeout, Duration::from_secs(5));
        assert_eq!(config.session_config().subprotocols, vec![OCPP_SUBPROTOCOL]);
    }

    #[test]
    fn test_csms_config_builder() {
        let config = CsmsConfig::new(SocketAddr::from(([127, 0, 0, 1], 9100)))
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_duplicate_policy(DuplicatePolicy::Reject);

        assert_eq!(config.listen_addr.port(), 9100);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.session_config().subprotocols, vec![OCPP_SUBPROTOCOL]);
    }
}
