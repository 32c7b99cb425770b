//! Operator command lines
//!
//! Stations understand the two-letter tokens `st`, `br`, `au` and `rr`, each
//! of which sends one CALL on the station's session. The CSMS understands
//! admin lines addressed at a connected station.

use std::str::FromStr;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::central::BASE_REPORT_REQUEST_ID;
use crate::error::OcppError;
use crate::ocpp::messages::Action;
use crate::ocpp::types::*;

/// Request id used for operator-triggered GetReport
pub const REPORT_REQUEST_ID: i32 = 112;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
}

/// Station-side command token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// `st`: TransactionEvent(Started)
    TransactionStarted,
    /// `br`: GetBaseReport
    BaseReport,
    /// `au`: Authorize
    Authorize,
    /// `rr`: GetReport
    Report,
}

impl FromStr for OperatorCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "st" => Ok(OperatorCommand::TransactionStarted),
            "br" => Ok(OperatorCommand::BaseReport),
            "au" => Ok(OperatorCommand::Authorize),
            "rr" => Ok(OperatorCommand::Report),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl OperatorCommand {
    pub fn action(&self) -> Action {
        match self {
            OperatorCommand::TransactionStarted => Action::TransactionEvent,
            OperatorCommand::BaseReport => Action::GetBaseReport,
            OperatorCommand::Authorize => Action::Authorize,
            OperatorCommand::Report => Action::GetReport,
        }
    }

    /// Fresh request payload; ids and timestamps are generated per call
    pub fn payload(&self) -> Result<Value, OcppError> {
        let payload = match self {
            OperatorCommand::TransactionStarted => serde_json::to_value(TransactionEventRequest {
                event_type: TransactionEventType::Started,
                timestamp: Utc::now(),
                trigger_reason: TriggerReason::Authorized,
                seq_no: 1,
                transaction_info: Transaction {
                    transaction_id: Uuid::new_v4().to_string(),
                },
            })?,
            OperatorCommand::BaseReport => serde_json::to_value(GetBaseReportRequest {
                request_id: BASE_REPORT_REQUEST_ID,
                report_base: ReportBase::SummaryInventory,
            })?,
            OperatorCommand::Authorize => serde_json::to_value(AuthorizeRequest {
                id_token: IdToken::local(Uuid::new_v4().to_string()),
            })?,
            OperatorCommand::Report => serde_json::to_value(GetReportRequest {
                request_id: REPORT_REQUEST_ID,
            })?,
        };
        Ok(payload)
    }
}

/// CSMS-side admin line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `list`
    List,
    /// `br <id>`
    BaseReport(String),
    /// `start <id>`
    Start(String),
    /// `stop <id> <transaction>`
    Stop(String, String),
}

impl FromStr for AdminCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = words.next().unwrap_or_default();

        let mut arg = |command: &'static str, argument: &'static str| {
            words
                .next()
                .map(str::to_string)
                .ok_or(CommandError::MissingArgument { command, argument })
        };

        match command {
            "list" => Ok(AdminCommand::List),
            "br" => Ok(AdminCommand::BaseReport(arg("br", "a station id")?)),
            "start" => Ok(AdminCommand::Start(arg("start", "a station id")?)),
            "stop" => {
                let identity = arg("stop", "a station id")?;
                let transaction = arg("stop", "a transaction id")?;
                Ok(AdminCommand::Stop(identity, transaction))
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}
