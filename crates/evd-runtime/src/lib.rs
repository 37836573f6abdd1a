//! evd-runtime
//!
//! The connector runtime: source-matrix selection with health-scored
//! failover, per-run orchestration (fetch → standardize → ingest →
//! checkpoint), and the failure replay/repair engine.
//!
//! Matrix resolution and candidate ordering are pure functions in
//! [`matrix`]; everything stateful goes through `evd-db`.

pub mod matrix;
pub mod replay;
pub mod runner;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use evd_audit::AuditLog;
use evd_schemas::{
    ConnectorRegisterRequest, ConnectorRunRequest, ConnectorRunResult, DomainError,
    FailureRepairRequest, FailureRepairResult, ManualReplayRequest, ManualReplayResult,
    RepairReplayRequest, RepairReplayResult, ReplayRequest, ReplayResult,
};
use evd_service::EventService;

/// Terminal run failures with a programmatic shape. The `Display` text is
/// what lands in run logs and `error_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Every source-matrix candidate failed or was skipped.
    AllCandidatesFailed,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::AllCandidatesFailed => write!(f, "all source matrix candidates failed"),
        }
    }
}

impl std::error::Error for RunError {}

/// Runtime handle bundling the event-service facade and the audit log.
#[derive(Clone)]
pub struct ConnectorRuntime {
    service: EventService,
    audit: Option<Arc<AuditLog>>,
}

impl ConnectorRuntime {
    pub fn new(service: EventService, audit: Option<Arc<AuditLog>>) -> Self {
        Self { service, audit }
    }

    pub fn service(&self) -> &EventService {
        &self.service
    }

    pub(crate) fn audit_event(
        &self,
        event_type: &str,
        action: &str,
        status: &str,
        payload: serde_json::Value,
    ) {
        if let Some(audit) = &self.audit {
            audit.log_event(event_type, action, status, payload);
        }
    }

    /// Register (upsert) a connector and sync its source-state registry.
    /// The referenced event source must exist.
    pub async fn register_connector(&self, req: &ConnectorRegisterRequest) -> Result<i64> {
        self.service.require_source(&req.source_name).await?;
        let id = evd_db::register_connector(self.service.pool(), req).await?;

        let connector = evd_db::get_connector(self.service.pool(), &req.connector_name)
            .await?
            .ok_or_else(|| {
                DomainError::not_found(format!("connector '{}' not found", req.connector_name))
            })?;
        let resolved = matrix::resolve_source_matrix(&connector);
        matrix::sync_source_state_registry(self.service.pool(), &connector, &resolved).await?;
        Ok(id)
    }

    pub async fn run_connector(&self, req: &ConnectorRunRequest) -> Result<ConnectorRunResult> {
        runner::run_connector(self, req).await
    }

    pub async fn replay_failures(&self, req: &ReplayRequest) -> Result<ReplayResult> {
        replay::replay_failures(self, req).await
    }

    pub async fn replay_selected_failures(
        &self,
        req: &ManualReplayRequest,
    ) -> Result<ManualReplayResult> {
        replay::replay_selected_failures(self, req).await
    }

    pub async fn repair_failure(&self, req: &FailureRepairRequest) -> Result<FailureRepairResult> {
        replay::repair_failure(self, req).await
    }

    pub async fn repair_and_replay_failures(
        &self,
        req: &RepairReplayRequest,
    ) -> Result<RepairReplayResult> {
        replay::repair_and_replay_failures(self, req).await
    }
}
