//! Charging station client
//!
//! Connects to a CSMS, runs the boot handshake and keeps the station alive
//! with heartbeats:
//!
//! ```text
//! connect ──► BootNotification ──Accepted──► heartbeat every `interval`
//!                   ▲      │
//!                   └──────┘ Pending / Rejected: retry after `interval`
//! ```
//!
//! The heartbeat loop is a child task of the session and stops with it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};

use crate::command::OperatorCommand;
use crate::config::StationConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OcppError;
use crate::observer::{SessionObserver, TracingObserver};
use crate::ocpp::messages::Action;
use crate::ocpp::types::*;
use crate::session::Session;
use crate::transport::WsTransport;

/// BootNotification payload describing this station
pub fn boot_request(config: &StationConfig) -> BootNotificationRequest {
    BootNotificationRequest {
        charging_station: ChargingStationInfo {
            model: config.model.clone(),
            vendor_name: config.vendor.clone(),
            serial_number: config.serial_number.clone(),
            firmware_version: config.firmware_version.clone(),
        },
        reason: BootReason::PowerUp,
    }
}

fn secs(interval: i32) -> Option<Duration> {
    u64::try_from(interval)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

/// Send Heartbeat every `interval` until the session closes.
///
/// The first heartbeat goes out immediately.
pub fn spawn_heartbeat(session: &Arc<Session>, interval: Duration) -> JoinHandle<()> {
    let heartbeat_session = Arc::clone(session);

    session.spawn_task("heartbeat", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let outcome: Result<HeartbeatResponse, OcppError> = heartbeat_session
                .call_typed(Action::Heartbeat, &HeartbeatRequest::default())
                .await;

            match outcome {
                Ok(response) => debug!("Heartbeat acknowledged at {}", response.current_time),
                Err(e) if e.is_closed() => break,
                Err(e) => warn!("Heartbeat failed: {}", e),
            }
        }
    })
}

/// Run the boot handshake on an open session.
///
/// Retries while the CSMS answers Pending or Rejected, waiting the interval
/// it hands out (or `boot_retry_interval` when that is 0). On Accepted the
/// heartbeat loop is started and the response returned.
pub async fn boot(
    session: &Arc<Session>,
    config: &StationConfig,
) -> Result<BootNotificationResponse, OcppError> {
    let request = boot_request(config);

    loop {
        let response: BootNotificationResponse = session
            .call_typed(Action::BootNotification, &request)
            .await?;

        let interval = secs(response.interval);

        match response.status {
            RegistrationStatus::Accepted => {
                info!("Connected to central system.");
                if let Some(interval) = interval {
                    spawn_heartbeat(session, interval);
                } else {
                    warn!("CSMS accepted boot without a heartbeat interval");
                }
                return Ok(response);
            }
            status => {
                let retry = interval.unwrap_or(config.boot_retry_interval);
                warn!("BootNotification {:?}, retrying in {:?}", status, retry);
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// A connected charging station
pub struct Station {
    config: StationConfig,
    session: Arc<Session>,
    registration: Arc<Mutex<Option<RegistrationStatus>>>,
}

impl Station {
    /// Open the WebSocket to `config.url()` and start the session's read loop
    pub async fn connect(config: StationConfig, dispatcher: Dispatcher) -> Result<Self, OcppError> {
        Self::connect_with_observer(config, dispatcher, Arc::new(TracingObserver)).await
    }

    pub async fn connect_with_observer(
        config: StationConfig,
        dispatcher: Dispatcher,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, OcppError> {
        let url = config.url();
        info!("Connecting to CSMS: {}", url);

        let mut request = url.as_str().into_client_request()?;
        let protocol = HeaderValue::from_str(&config.subprotocol)
            .map_err(|e| OcppError::Transport(format!("invalid subprotocol: {}", e)))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let ws_config = WebSocketConfig {
            max_message_size: Some(config.max_message_size),
            max_frame_size: Some(config.max_frame_size),
            ..Default::default()
        };

        let (ws, response) = match connect_async_with_config(request, Some(ws_config), false).await
        {
            Ok(connected) => connected,
            // The CSMS agreed on no subprotocol
            Err(WsError::Protocol(ProtocolError::SecWebSocketSubProtocolError(e))) => {
                warn!("CSMS refused subprotocol {}: {}", config.subprotocol, e);
                return Err(OcppError::SubprotocolMismatch {
                    requested: None,
                    supported: vec![config.subprotocol.clone()],
                });
            }
            Err(e) => {
                error!("WebSocket connection failed: {}", e);
                return Err(e.into());
            }
        };

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let session = Session::builder(config.station_id.clone(), Arc::new(WsTransport::new(ws)))
            .dispatcher(dispatcher)
            .observer(observer)
            .config(config.session_config())
            .build();

        session.open(accepted.as_deref()).await?;
        session.start();
        info!("WebSocket connected to {}", url);

        Ok(Self {
            config,
            session,
            registration: Arc::default(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Last registration status the CSMS answered with
    pub fn registration_status(&self) -> Option<RegistrationStatus> {
        *self.registration.lock()
    }

    /// Run the boot handshake as a session child task
    pub fn start_boot(&self) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        let registration = Arc::clone(&self.registration);

        self.session.spawn_task("boot", async move {
            match boot(&session, &config).await {
                Ok(response) => *registration.lock() = Some(response.status),
                Err(e) => warn!("Boot sequence aborted: {}", e),
            }
        })
    }

    /// Send the CALL an operator command maps to and wait for the reply
    pub async fn execute(&self, command: OperatorCommand) -> Result<Value, OcppError> {
        let payload = command.payload()?;
        self.session.call(command.action(), payload).await
    }

    /// Fire an operator command in the background; the reply is only logged
    pub fn trigger(&self, command: OperatorCommand) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);

        self.session.spawn_task("command", async move {
            let action = command.action();
            let outcome = match command.payload() {
                Ok(payload) => session.call(action, payload).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(reply) => info!("{} answered: {}", action, reply),
                Err(e) => warn!("{} failed: {}", action, e),
            }
        })
    }

    pub async fn close(&self) {
        self.session.close("station shutdown").await;
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        self.session.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{CallResult, Frame};
    use crate::transport::{ChannelTransport, Transport};
    use serde_json::json;
    use tokio::time::Instant;

    async fn station_session() -> (Arc<Session>, ChannelTransport) {
        let (local, peer) = ChannelTransport::pair();
        let session = Session::builder("CP_1", Arc::new(local)).build();
        session.open(Some("ocpp2.0.1")).await.unwrap();
        session.start();
        (session, peer)
    }

    /// Read the next CALL from the station, asserting its action
    async fn expect_call(peer: &ChannelTransport, action: &str) -> String {
        match Frame::decode(&peer.receive().await.unwrap()).unwrap() {
            Frame::Call(call) => {
                assert_eq!(call.action, action);
                call.message_id
            }
            other => panic!("Expected {} call, got {:?}", action, other),
        }
    }

    async fn reply(peer: &ChannelTransport, message_id: String, payload: Value) {
        let frame = Frame::from(CallResult::new(message_id, payload).unwrap());
        peer.send(frame.encode()).await.unwrap();
    }

    fn boot_reply(status: &str, interval: i32) -> Value {
        json!({"currentTime": "2024-01-01T00:00:00Z", "interval": interval, "status": status})
    }

    #[test]
    fn test_boot_request_from_config() {
        let config = StationConfig::default().with_serial("SN-1");
        let request = boot_request(&config);

        assert_eq!(request.charging_station.vendor_name, "anewone");
        assert_eq!(request.charging_station.model, "Wallbox XYZ");
        assert_eq!(request.charging_station.serial_number.as_deref(), Some("SN-1"));
        assert_eq!(request.reason, BootReason::PowerUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_every_interval_until_close() {
        let (session, peer) = station_session().await;
        let config = StationConfig::default();

        let booting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { boot(&session, &config).await })
        };

        let id = expect_call(&peer, "BootNotification").await;
        reply(&peer, id, boot_reply("Accepted", 10)).await;
        assert_eq!(
            booting.await.unwrap().unwrap().status,
            RegistrationStatus::Accepted
        );

        let start = Instant::now();
        for n in 0..3u64 {
            let id = expect_call(&peer, "Heartbeat").await;
            assert_eq!(start.elapsed().as_secs(), n * 10);
            reply(&peer, id, json!({"currentTime": "2024-01-01T00:00:00Z"})).await;
        }

        session.close("test done").await;
        // Heartbeat loop is cancelled with the session; nothing else arrives
        assert!(matches!(peer.receive().await, Err(OcppError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_retries_while_pending() {
        let (session, peer) = station_session().await;
        let config = StationConfig::default();

        let booting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { boot(&session, &config).await })
        };

        let id = expect_call(&peer, "BootNotification").await;
        let first = Instant::now();
        reply(&peer, id, boot_reply("Pending", 5)).await;

        let id = expect_call(&peer, "BootNotification").await;
        assert_eq!(first.elapsed().as_secs(), 5);
        reply(&peer, id, boot_reply("Rejected", 0)).await;

        // Interval 0 falls back to the configured retry delay
        let id = expect_call(&peer, "BootNotification").await;
        assert_eq!(first.elapsed().as_secs(), 15);
        reply(&peer, id, boot_reply("Accepted", 60)).await;

        assert!(booting.await.unwrap().is_ok());
        expect_call(&peer, "Heartbeat").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_before_accepted() {
        let (session, peer) = station_session().await;
        let config = StationConfig::default();

        let booting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { boot(&session, &config).await })
        };

        let id = expect_call(&peer, "BootNotification").await;
        reply(&peer, id, boot_reply("Pending", 30)).await;

        // Station is silent until the retry is due
        let quiet = tokio::time::timeout(Duration::from_secs(29), peer.receive()).await;
        assert!(quiet.is_err());

        session.close("test done").await;
        assert!(booting.await.unwrap().unwrap_err().is_closed());
    }
}
