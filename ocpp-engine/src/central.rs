//! Operator-facing operations of the central system

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::OcppError;
use crate::ocpp::messages::Action;
use crate::ocpp::types::*;
use crate::registry::Registry;

/// Request id used for operator-triggered base reports
pub const BASE_REPORT_REQUEST_ID: i32 = 111;

/// Remote start id used for operator-triggered transactions
pub const REMOTE_START_ID: i32 = 1234;

/// Admin operations over the connected stations
#[derive(Clone)]
pub struct CentralSystem {
    registry: Registry,
}

impl CentralSystem {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn list_connected_identities(&self) -> Vec<String> {
        self.registry.list_identities()
    }

    /// Forward an arbitrary CALL to a connected station
    pub async fn send_to(
        &self,
        identity: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, OcppError> {
        self.registry.send_to(identity, action, payload).await
    }

    /// Ask a station for its summary inventory
    pub async fn get_base_report(&self, identity: &str) -> Result<ReportResponse, OcppError> {
        let request = GetBaseReportRequest {
            request_id: BASE_REPORT_REQUEST_ID,
            report_base: ReportBase::SummaryInventory,
        };

        let session = self.registry.lookup(identity)?;
        let response: ReportResponse = session.call_typed(Action::GetBaseReport, &request).await?;
        info!("GetBaseReport on {}: {:?}", identity, response.status);
        Ok(response)
    }

    /// Start a remote transaction with a freshly generated local token
    pub async fn start_transaction(
        &self,
        identity: &str,
    ) -> Result<RequestStartTransactionResponse, OcppError> {
        let request = RequestStartTransactionRequest {
            id_token: IdToken::local(Uuid::new_v4().to_string()),
            remote_start_id: REMOTE_START_ID,
            evse_id: None,
        };

        let session = self.registry.lookup(identity)?;
        let response: RequestStartTransactionResponse = session
            .call_typed(Action::RequestStartTransaction, &request)
            .await?;
        info!(
            "RequestStartTransaction on {}: {:?} {:?}",
            identity, response.status, response.transaction_id
        );
        Ok(response)
    }

    pub async fn stop_transaction(
        &self,
        identity: &str,
        transaction_id: &str,
    ) -> Result<RequestStopTransactionResponse, OcppError> {
        let request = RequestStopTransactionRequest {
            transaction_id: transaction_id.to_string(),
        };

        let session = self.registry.lookup(identity)?;
        let response: RequestStopTransactionResponse = session
            .call_typed(Action::RequestStopTransaction, &request)
            .await?;
        info!("RequestStopTransaction on {}: {:?}", identity, response.status);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::station_dispatcher;
    use crate::session::Session;
    use crate::transport::ChannelTransport;
    use std::sync::Arc;

    /// Registry holding one station-role session; the returned session is the
    /// station's end, answering with the stock station handlers
    async fn connected(identity: &str) -> (CentralSystem, Arc<Session>) {
        let (csms_end, station_end) = ChannelTransport::pair();

        let csms_session = Session::builder(identity, Arc::new(csms_end)).build();
        csms_session.open(Some("ocpp2.0.1")).await.unwrap();
        csms_session.start();

        let station = Session::builder(identity, Arc::new(station_end))
            .dispatcher(station_dispatcher())
            .build();
        station.open(Some("ocpp2.0.1")).await.unwrap();
        station.start();

        let registry = Registry::default();
        registry.register(csms_session).unwrap();
        (CentralSystem::new(registry), station)
    }

    #[tokio::test]
    async fn test_admin_operations_round_trip() {
        let (central, _station) = connected("CP_1").await;

        assert_eq!(central.list_connected_identities(), vec!["CP_1"]);

        let report = central.get_base_report("CP_1").await.unwrap();
        assert_eq!(report.status, GenericDeviceModelStatus::Accepted);

        let started = central.start_transaction("CP_1").await.unwrap();
        assert_eq!(started.status, GenericStatus::Accepted);
        let transaction_id = started.transaction_id.unwrap();

        let stopped = central.stop_transaction("CP_1", &transaction_id).await.unwrap();
        assert_eq!(stopped.status, GenericStatus::Accepted);
    }

    #[tokio::test]
    async fn test_admin_operations_on_unknown_station() {
        let (central, _station) = connected("CP_1").await;

        assert!(matches!(
            central.get_base_report("CP_2").await,
            Err(OcppError::NotFound(_))
        ));
        assert!(matches!(
            central.send_to("CP_2", "GetReport", serde_json::json!({})).await,
            Err(OcppError::NotFound(_))
        ));
    }
}
