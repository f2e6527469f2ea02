use crate::context::ReconcilerContext;
use crate::JobError;
use hypervisor_common::Principal;
use hypervisor_reconciler::{
    HeartbeatOutcome, HypervisorReport, ReconcileRequest, ReconciliationOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

// --- Hypervisor Update ---

/// Entry point for building a validated hypervisor update.
pub struct HypervisorUpdateJob;

impl HypervisorUpdateJob {
    pub fn config() -> HypervisorUpdateConfig {
        HypervisorUpdateConfig::default()
    }
}

/// Unvalidated job parameters, as submitted by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct HypervisorUpdateConfig {
    owner: Option<String>,
    data: Option<String>,
    create_missing: Option<bool>,
    principal: Option<Principal>,
    reporter: Option<String>,
}

impl HypervisorUpdateConfig {
    pub fn owner(mut self, owner_key: impl Into<String>) -> Self {
        self.owner = Some(owner_key.into());
        self
    }

    /// The raw report JSON.
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn create_missing(mut self, create_missing: bool) -> Self {
        self.create_missing = Some(create_missing);
        self
    }

    pub fn principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn reporter(mut self, reporter_id: impl Into<String>) -> Self {
        self.reporter = Some(reporter_id.into());
        self
    }

    /// Checks every required parameter and parses the report.
    pub fn validate(self, max_report_hosts: usize) -> Result<HypervisorUpdateArgs, JobError> {
        let owner_key = self
            .owner
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| JobError::InvalidConfig("owner must be set".to_string()))?;
        let create_missing = self
            .create_missing
            .ok_or_else(|| JobError::InvalidConfig("create missing flag must be set".to_string()))?;
        let principal = self
            .principal
            .ok_or_else(|| JobError::InvalidConfig("principal must be set".to_string()))?;
        let data = self
            .data
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| JobError::InvalidConfig("hypervisor data must be set".to_string()))?;

        let report = parse_report(&data)?;
        if report.len() > max_report_hosts {
            return Err(JobError::InvalidConfig(format!(
                "report lists {} hypervisors, the limit is {}",
                report.len(),
                max_report_hosts
            )));
        }

        Ok(HypervisorUpdateArgs {
            owner_key,
            create_missing,
            reporter_id: self.reporter.filter(|r| !r.trim().is_empty()),
            principal,
            report,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorUpdateArgs {
    pub owner_key: String,
    pub create_missing: bool,
    pub reporter_id: Option<String>,
    pub principal: Principal,
    pub report: HypervisorReport,
}

/// Parses report data in either the `{"hypervisors": [...]}` form or the older
/// `{"<host id>": ["<guest id>", ...]}` form.
pub fn parse_report(data: &str) -> Result<HypervisorReport, JobError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| JobError::InvalidInput(format!("report is not valid JSON: {e}")))?;

    let Value::Object(map) = value else {
        return Err(JobError::InvalidInput(
            "report must be a JSON object".to_string(),
        ));
    };

    if is_wrapped(&map) {
        return serde_json::from_value(Value::Object(map))
            .map_err(|e| JobError::InvalidInput(format!("malformed hypervisor report: {e}")));
    }

    let mut hosts = Vec::with_capacity(map.len());
    for (host, guests) in map {
        let guests = match guests {
            Value::Null => None,
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(guest) => Some(Ok(guest)),
                        Value::Null => None,
                        other => Some(Err(JobError::InvalidInput(format!(
                            "guest ids of {host} must be strings, got {other}"
                        )))),
                    })
                    .collect::<Result<Vec<String>, JobError>>()?,
            ),
            other => {
                return Err(JobError::InvalidInput(format!(
                    "guests of {host} must be a list, got {other}"
                )))
            }
        };
        hosts.push((host, guests));
    }
    Ok(HypervisorReport::from_host_guest_map(hosts))
}

/// A `hypervisors` key only selects the newer form when it holds a list of
/// host objects; otherwise it is a legacy host that happens to carry that name.
fn is_wrapped(map: &serde_json::Map<String, Value>) -> bool {
    match map.get("hypervisors") {
        Some(Value::Array(items)) => items.iter().all(Value::is_object),
        _ => false,
    }
}

#[instrument(
    skip(ctx, args),
    fields(owner = %args.owner_key, hosts = args.report.len(), create_missing = args.create_missing)
)]
pub async fn hypervisor_update_job(
    ctx: &ReconcilerContext,
    args: HypervisorUpdateArgs,
) -> Result<ReconciliationOutcome, JobError> {
    info!(principal = %args.principal, reporter = ?args.reporter_id, "Running hypervisor update");

    let request = ReconcileRequest {
        owner_key: args.owner_key,
        create_missing: args.create_missing,
        reporter_id: args.reporter_id,
        principal: args.principal,
        report: args.report,
    };
    let outcome = ctx.reconciler.reconcile(&request).await?;
    Ok(outcome)
}

// --- Hypervisor Heartbeat ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatArgs {
    pub owner_key: String,
    pub reporter_id: String,
    pub principal: Principal,
}

#[instrument(skip(ctx, args), fields(owner = %args.owner_key, reporter = %args.reporter_id))]
pub async fn hypervisor_heartbeat_job(
    ctx: &ReconcilerContext,
    args: HeartbeatArgs,
) -> Result<HeartbeatOutcome, JobError> {
    if args.owner_key.trim().is_empty() {
        return Err(JobError::InvalidInput("owner must be set".to_string()));
    }
    if args.reporter_id.trim().is_empty() {
        return Err(JobError::InvalidInput("reporter id must be set".to_string()));
    }

    let outcome = ctx
        .reconciler
        .heartbeat(&args.owner_key, &args.reporter_id, &args.principal)
        .await?;
    Ok(outcome)
}
