//! Stock handler sets for the two roles
//!
//! - [`csms_dispatcher`]: BootNotification, Heartbeat, Authorize,
//!   TransactionEvent from stations
//! - [`station_dispatcher`]: GetBaseReport, GetReport, Authorize and remote
//!   start/stop from the CSMS

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{typed, CallContext, Dispatcher};
use crate::error::OcppError;
use crate::ocpp::messages::Action;
use crate::ocpp::types::*;

fn accept_token() -> IdTokenInfo {
    IdTokenInfo {
        status: AuthorizationStatus::Accepted,
    }
}

async fn authorize(ctx: CallContext, req: AuthorizeRequest) -> Result<AuthorizeResponse, OcppError> {
    info!("Authorization of {} on {}", req.id_token.id_token, ctx.identity);
    Ok(AuthorizeResponse {
        id_token_info: accept_token(),
    })
}

/// Handlers a central system answers stations with.
///
/// Every station is accepted and told to heartbeat every `heartbeat_interval`.
pub fn csms_dispatcher(heartbeat_interval: Duration) -> Dispatcher {
    let interval = i32::try_from(heartbeat_interval.as_secs()).unwrap_or(i32::MAX);

    Dispatcher::new()
        .on(
            Action::BootNotification,
            typed(move |ctx: CallContext, req: BootNotificationRequest| async move {
                info!(
                    "BootNotification from {}: {} {} ({:?})",
                    ctx.identity, req.charging_station.vendor_name, req.charging_station.model, req.reason
                );
                Ok::<_, OcppError>(BootNotificationResponse {
                    current_time: Utc::now(),
                    interval,
                    status: RegistrationStatus::Accepted,
                    status_info: None,
                })
            }),
        )
        .on(
            Action::Heartbeat,
            typed(|ctx: CallContext, _req: HeartbeatRequest| async move {
                info!("Got a heartbeat from {}", ctx.identity);
                Ok::<_, OcppError>(HeartbeatResponse {
                    current_time: Utc::now(),
                })
            }),
        )
        .on(Action::Authorize, typed(authorize))
        .on(
            Action::TransactionEvent,
            typed(|ctx: CallContext, req: TransactionEventRequest| async move {
                info!(
                    "Transaction event {:?} for {} on {} ({:?})",
                    req.event_type, req.transaction_info.transaction_id, ctx.identity, req.trigger_reason
                );
                Ok::<_, OcppError>(TransactionEventResponse::default())
            }),
        )
}

/// Handlers a charging station answers the CSMS with.
///
/// Remote starts open a transaction with a generated id; remote stops are
/// accepted only for transactions this station started.
pub fn station_dispatcher() -> Dispatcher {
    let transactions: Arc<Mutex<HashSet<String>>> = Arc::default();
    let started = Arc::clone(&transactions);
    let stopped = transactions;

    Dispatcher::new()
        .on(
            Action::GetBaseReport,
            typed(|_ctx: CallContext, req: GetBaseReportRequest| async move {
                info!("Base report {} ({:?})", req.request_id, req.report_base);
                Ok::<_, OcppError>(ReportResponse {
                    status: GenericDeviceModelStatus::Accepted,
                    status_info: None,
                })
            }),
        )
        .on(
            Action::GetReport,
            typed(|_ctx: CallContext, req: GetReportRequest| async move {
                info!("Report {}", req.request_id);
                Ok::<_, OcppError>(ReportResponse {
                    status: GenericDeviceModelStatus::Accepted,
                    status_info: None,
                })
            }),
        )
        .on(Action::Authorize, typed(authorize))
        .on(
            Action::RequestStartTransaction,
            typed(move |_ctx: CallContext, req: RequestStartTransactionRequest| {
                let transactions = Arc::clone(&started);
                async move {
                    let transaction_id = Uuid::new_v4().to_string();
                    info!(
                        "Remote start {} for {}: transaction {}",
                        req.remote_start_id, req.id_token.id_token, transaction_id
                    );
                    transactions.lock().insert(transaction_id.clone());

                    Ok::<_, OcppError>(RequestStartTransactionResponse {
                        status: GenericStatus::Accepted,
                        transaction_id: Some(transaction_id),
                        status_info: None,
                    })
                }
            }),
        )
        .on(
            Action::RequestStopTransaction,
            typed(move |_ctx: CallContext, req: RequestStopTransactionRequest| {
                let transactions = Arc::clone(&stopped);
                async move {
                    let known = transactions.lock().remove(&req.transaction_id);
                    info!("Remote stop of {}: known={}", req.transaction_id, known);

                    let (status, status_info) = if known {
                        (GenericStatus::Accepted, None)
                    } else {
                        (
                            GenericStatus::Rejected,
                            Some(StatusInfo {
                                reason_code: "UnknownTransaction".to_string(),
                                additional_info: None,
                            }),
                        )
                    };
                    Ok::<_, OcppError>(RequestStopTransactionResponse { status, status_info })
                }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{Call, Frame};
    use serde_json::{json, Value};

    async fn dispatch(dispatcher: &Dispatcher, action: Action, payload: Value) -> Value {
        let call = Call::new(action, payload).unwrap();
        match dispatcher.dispatch("CP_1", call).await {
            Frame::CallResult(result) => result.payload,
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_csms_accepts_boot_with_interval() {
        let dispatcher = csms_dispatcher(Duration::from_secs(10));
        let reply = dispatch(
            &dispatcher,
            Action::BootNotification,
            json!({
                "chargingStation": {"model": "Wallbox XYZ", "vendorName": "anewone"},
                "reason": "PowerUp"
            }),
        )
        .await;

        assert_eq!(reply["status"], "Accepted");
        assert_eq!(reply["interval"], 10);
        assert!(reply["currentTime"].is_string());
    }

    #[tokio::test]
    async fn test_csms_answers_station_messages() {
        let dispatcher = csms_dispatcher(Duration::from_secs(10));

        let reply = dispatch(&dispatcher, Action::Heartbeat, json!({})).await;
        assert!(reply["currentTime"].is_string());

        let reply = dispatch(
            &dispatcher,
            Action::Authorize,
            json!({"idToken": {"idToken": "abc", "type": "Local"}}),
        )
        .await;
        assert_eq!(reply["idTokenInfo"]["status"], "Accepted");

        let reply = dispatch(
            &dispatcher,
            Action::TransactionEvent,
            json!({
                "eventType": "Started",
                "timestamp": "2024-01-01T00:00:00Z",
                "triggerReason": "Authorized",
                "seqNo": 1,
                "transactionInfo": {"transactionId": "tx-1"}
            }),
        )
        .await;
        assert_eq!(reply, json!({}));
    }

    #[tokio::test]
    async fn test_station_stop_only_known_transactions() {
        let dispatcher = station_dispatcher();

        let started = dispatch(
            &dispatcher,
            Action::RequestStartTransaction,
            json!({"idToken": {"idToken": "abc", "type": "Local"}, "remoteStartId": 7}),
        )
        .await;
        assert_eq!(started["status"], "Accepted");
        let transaction_id = started["transactionId"].as_str().unwrap().to_string();

        let reply = dispatch(
            &dispatcher,
            Action::RequestStopTransaction,
            json!({"transactionId": "unknown"}),
        )
        .await;
        assert_eq!(reply["status"], "Rejected");

        let reply = dispatch(
            &dispatcher,
            Action::RequestStopTransaction,
            json!({"transactionId": transaction_id}),
        )
        .await;
        assert_eq!(reply["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_station_reports() {
        let dispatcher = station_dispatcher();

        let reply = dispatch(
            &dispatcher,
            Action::GetBaseReport,
            json!({"requestId": 111, "reportBase": "SummaryInventory"}),
        )
        .await;
        assert_eq!(reply["status"], "Accepted");

        let reply = dispatch(&dispatcher, Action::GetReport, json!({"requestId": 1})).await;
        assert_eq!(reply["status"], "Accepted");
    }

    #[test]
    fn test_role_tables() {
        assert_eq!(
            csms_dispatcher(Duration::from_secs(10)).actions(),
            vec!["Authorize", "BootNotification", "Heartbeat", "TransactionEvent"]
        );
        assert!(!station_dispatcher().has_handler("BootNotification"));
    }
}
