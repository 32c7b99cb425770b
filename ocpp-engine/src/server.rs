//! CSMS WebSocket listener
//!
//! Each accepted connection becomes a [`Session`] whose identity is the
//! trailing segment of the request path (`ws://host:9000/CP_1` -> `CP_1`).
//! The session is registered, its read loop runs, and the connection task
//! ends when the registry releases it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::central::CentralSystem;
use crate::config::CsmsConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OcppError;
use crate::observer::{SessionObserver, TracingObserver};
use crate::registry::Registry;
use crate::session::Session;
use crate::transport::WsTransport;

/// Station identity from a request path: its last segment, taken verbatim
pub fn identity_from_path(path: &str) -> Result<String, OcppError> {
    let identity = path.rsplit('/').next().unwrap_or_default();

    if identity.is_empty() {
        return Err(OcppError::InvalidIdentity(path.to_string()));
    }
    Ok(identity.to_string())
}

/// First of our subprotocols, in preference order, that the client offered
pub fn negotiate_subprotocol(offered: Option<&str>, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = offered?.split(',').map(str::trim).collect();

    supported
        .iter()
        .find(|p| offered.contains(&p.as_str()))
        .cloned()
}

/// Central system server
#[derive(Clone)]
pub struct CsmsServer {
    config: CsmsConfig,
    dispatcher: Dispatcher,
    observer: Arc<dyn SessionObserver>,
    registry: Registry,
    shutdown: CancellationToken,
}

impl CsmsServer {
    pub fn new(config: CsmsConfig, dispatcher: Dispatcher) -> Self {
        let registry = Registry::new(config.duplicate_policy);

        Self {
            config,
            dispatcher,
            observer: Arc::new(TracingObserver),
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Report session activity to `observer` instead of the log
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Operator-facing operations over the connected stations
    pub fn central(&self) -> CentralSystem {
        CentralSystem::new(self.registry.clone())
    }

    /// Cancelling this token stops the accept loop and closes every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), OcppError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), OcppError> {
        info!(
            "WebSocket server started at {}, subprotocols {:?}",
            listener.local_addr()?,
            self.config.subprotocols
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    warn!("Connection from {} ended: {}", peer, e);
                }
            });
        }

        info!("Shutting down, closing {} session(s)", self.registry.len());
        self.registry.close_all("server shutdown").await;
        Ok(())
    }

    fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_frame_size),
            ..Default::default()
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), OcppError> {
        debug!("New TCP connection from {}", peer);

        let mut identity = None;
        let mut negotiated = None;
        let supported = &self.config.subprotocols;

        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            let path = req.uri().path();
            match identity_from_path(path) {
                Ok(id) => identity = Some(id),
                Err(_) => {
                    let mut refusal = ErrorResponse::new(Some("missing station identity".into()));
                    *refusal.status_mut() = StatusCode::NOT_FOUND;
                    return Err(refusal);
                }
            }

            let offered = req
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok());
            negotiated = negotiate_subprotocol(offered, supported);

            if let Some(protocol) = negotiated.as_deref() {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    resp.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
            } else {
                warn!("{} offered no supported subprotocol: {:?}", path, offered);
            }
            Ok(resp)
        };

        let ws = accept_hdr_async_with_config(stream, callback, Some(self.ws_config())).await?;
        let identity = identity.ok_or_else(|| OcppError::InvalidIdentity(String::new()))?;
        info!("Charging station {} connected from {}", identity, peer);

        let session = Session::builder(identity, Arc::new(WsTransport::new(ws)))
            .dispatcher(self.dispatcher.clone())
            .observer(Arc::clone(&self.observer))
            .config(self.config.session_config())
            .build();

        session.open(negotiated.as_deref()).await?;

        // Handshake finished after close_all; never register into a stopped server
        if self.shutdown.is_cancelled() {
            info!("Server shutting down, dropping {}", session.identity());
            session.close("server shutdown").await;
            return Ok(());
        }

        let release = match self.registry.register(Arc::clone(&session)) {
            Ok(release) => release,
            Err(e) => {
                session.close("identity conflict").await;
                return Err(e);
            }
        };

        let reader = session.start();
        let released = release.released();
        tokio::pin!(released);

        let reason = tokio::select! {
            reason = &mut released => reason,
            _ = self.shutdown.cancelled() => {
                session.close("server shutdown").await;
                released.await
            }
        };
        debug!("Session {} released: {:?}", session.identity(), reason);

        match reader.await {
            Ok(outcome) => outcome,
            Err(e) => Err(OcppError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StationConfig;
    use crate::handlers::{csms_dispatcher, station_dispatcher};
    use crate::session::SessionState;
    use crate::station::Station;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    async fn bound_server() -> (CsmsServer, TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CsmsServer::new(CsmsConfig::new(addr), csms_dispatcher(Duration::from_secs(10)));
        (server, listener, format!("ws://{}", addr))
    }

    #[test]
    fn test_identity_is_last_path_segment() {
        assert_eq!(identity_from_path("/CP_1").unwrap(), "CP_1");
        assert_eq!(identity_from_path("/ocpp/v201/CP_2").unwrap(), "CP_2");
        // No percent-decoding
        assert_eq!(identity_from_path("/CP%201").unwrap(), "CP%201");
    }

    #[test]
    fn test_empty_identity_refused() {
        assert!(matches!(identity_from_path("/"), Err(OcppError::InvalidIdentity(_))));
        assert!(matches!(identity_from_path(""), Err(OcppError::InvalidIdentity(_))));
        assert!(matches!(identity_from_path("/ocpp/"), Err(OcppError::InvalidIdentity(_))));
    }

    #[test]
    fn test_negotiation_prefers_server_order() {
        let supported = vec!["ocpp2.0.1".to_string(), "ocpp2.0".to_string()];

        assert_eq!(
            negotiate_subprotocol(Some("ocpp2.0, ocpp2.0.1"), &supported).as_deref(),
            Some("ocpp2.0.1")
        );
        assert_eq!(
            negotiate_subprotocol(Some("ocpp2.0"), &supported).as_deref(),
            Some("ocpp2.0")
        );
        assert_eq!(negotiate_subprotocol(Some("ocpp1.6"), &supported), None);
        assert_eq!(negotiate_subprotocol(None, &supported), None);
    }

    #[tokio::test]
    async fn test_handshake_after_shutdown_is_not_registered() {
        let (server, listener, url) = bound_server().await;
        server.shutdown_token().cancel();

        let station = tokio::spawn(async move {
            Station::connect(StationConfig::new("CP_1", &url), station_dispatcher()).await
        });

        let (stream, peer) = listener.accept().await.unwrap();
        tokio::time::timeout(WAIT, server.handle_connection(stream, peer))
            .await
            .unwrap()
            .unwrap();
        assert!(server.registry().is_empty());

        if let Ok(station) = station.await.unwrap() {
            tokio::time::timeout(WAIT, station.closed()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_held_connection() {
        let (server, listener, url) = bound_server().await;

        let handler = {
            let server = server.clone();
            tokio::spawn(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                server.handle_connection(stream, peer).await
            })
        };
        let station = Station::connect(StationConfig::new("CP_1", &url), station_dispatcher())
            .await
            .unwrap();

        tokio::time::timeout(WAIT, async {
            while !server.registry().contains("CP_1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let session = server.registry().lookup("CP_1").unwrap();

        // No accept loop is running, so nothing calls close_all
        server.shutdown_token().cancel();

        tokio::time::timeout(WAIT, handler).await.unwrap().unwrap().ok();
        assert_eq!(session.state(), SessionState::Closed);
        tokio::time::timeout(WAIT, station.closed()).await.unwrap();
    }
}
