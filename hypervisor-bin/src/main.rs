use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr};
use hypervisor_common::{Access, Principal};
use hypervisor_lib::context::{ReconcilerConfig, ReconcilerContext};
use hypervisor_lib::jobs::{
    hypervisor_heartbeat_job, hypervisor_update_job, HeartbeatArgs, HypervisorUpdateJob,
};
use hypervisor_lib::state::{load_snapshot, save_snapshot};
use hypervisor_reconciler::InMemoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hypervisor-reconciler", about = "Reconcile hypervisor host/guest reports")]
struct Cli {
    /// Store snapshot file; overrides HYPERVISOR_STATE_PATH
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a hypervisor check-in report
    Update(UpdateArgs),
    /// Record a check-in for every host of a reporter
    Heartbeat(HeartbeatCmdArgs),
}

#[derive(Args)]
struct PrincipalArgs {
    /// Name of the submitting user
    #[arg(long, default_value = "admin")]
    user: String,
    /// Submit as a super admin
    #[arg(long)]
    admin: bool,
    /// Access the user holds on an owner, as `owner=read|update|create`; repeatable
    #[arg(long = "grant", value_parser = parse_grant)]
    grants: Vec<(String, Access)>,
}

impl PrincipalArgs {
    fn principal(&self) -> Principal {
        let principal = if self.admin {
            Principal::admin(&self.user)
        } else {
            Principal::user(&self.user)
        };
        self.grants
            .iter()
            .fold(principal, |p, (owner, access)| p.with_grant(owner, *access))
    }
}

fn parse_grant(s: &str) -> Result<(String, Access), String> {
    let (owner, access) = s
        .split_once('=')
        .ok_or_else(|| format!("expected owner=access, got {s}"))?;
    let owner = owner.trim();
    if owner.is_empty() {
        return Err(format!("missing owner in {s}"));
    }
    let access = access.parse::<Access>().map_err(|e| e.to_string())?;
    Ok((owner.to_string(), access))
}

#[derive(Args)]
struct UpdateArgs {
    /// Owner key
    #[arg(long)]
    owner: String,
    /// Report JSON file
    report: PathBuf,
    /// Create hosts that are not registered yet
    #[arg(long)]
    create_missing: bool,
    /// Reporter id to record on the hosts
    #[arg(long)]
    reporter: Option<String>,
    #[command(flatten)]
    principal: PrincipalArgs,
}

#[derive(Args)]
struct HeartbeatCmdArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    reporter: String,
    #[command(flatten)]
    principal: PrincipalArgs,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    let config = ReconcilerConfig::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = config;
    if let Some(state) = cli.state {
        config.state_path = state;
    }

    let snapshot = load_snapshot(&config.state_path)
        .await
        .wrap_err_with(|| format!("loading {}", config.state_path.display()))?;
    let store = Arc::new(InMemoryStore::from_snapshot(snapshot));
    let ctx = ReconcilerContext::with_store(config.clone(), store.clone());

    let output = match cli.command {
        Command::Update(args) => {
            let data = tokio::fs::read_to_string(&args.report)
                .await
                .wrap_err_with(|| format!("reading {}", args.report.display()))?;
            let mut job = HypervisorUpdateJob::config()
                .owner(args.owner)
                .create_missing(args.create_missing)
                .principal(args.principal.principal())
                .data(data);
            if let Some(reporter) = args.reporter {
                job = job.reporter(reporter);
            }
            let job_args = job.validate(config.max_report_hosts)?;
            let outcome = hypervisor_update_job(&ctx, job_args).await?;
            serde_json::to_string_pretty(&outcome)?
        }
        Command::Heartbeat(args) => {
            let outcome = hypervisor_heartbeat_job(
                &ctx,
                HeartbeatArgs {
                    owner_key: args.owner,
                    reporter_id: args.reporter,
                    principal: args.principal.principal(),
                },
            )
            .await?;
            serde_json::to_string_pretty(&outcome)?
        }
    };

    save_snapshot(&config.state_path, &store.snapshot().await)
        .await
        .wrap_err_with(|| format!("saving {}", config.state_path.display()))?;
    info!(path = %config.state_path.display(), "State saved");

    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grant() {
        assert_eq!(
            parse_grant("admin=update"),
            Ok(("admin".to_string(), Access::Update))
        );
        assert!(parse_grant("admin").is_err());
        assert!(parse_grant("=create").is_err());
        assert!(parse_grant("admin=owner").is_err());
    }

    #[test]
    fn test_user_with_grants() {
        let cli = Cli::try_parse_from([
            "hypervisor-reconciler",
            "update",
            "--owner",
            "admin",
            "--user",
            "joe",
            "--grant",
            "admin=update",
            "--grant",
            "other=create",
            "report.json",
        ])
        .unwrap();
        let Command::Update(args) = cli.command else {
            panic!("expected the update command");
        };
        let principal = args.principal.principal();
        assert!(!principal.super_admin);
        assert_eq!(principal.username, "joe");
        assert_eq!(principal.access_to("admin"), Some(Access::Update));
        assert_eq!(principal.access_to("other"), Some(Access::Create));
        assert_eq!(principal.access_to("third"), None);
    }

    #[test]
    fn test_user_without_grants_has_no_access() {
        let cli = Cli::try_parse_from([
            "hypervisor-reconciler",
            "heartbeat",
            "--owner",
            "admin",
            "--reporter",
            "virt-who",
            "--user",
            "joe",
        ])
        .unwrap();
        let Command::Heartbeat(args) = cli.command else {
            panic!("expected the heartbeat command");
        };
        assert_eq!(args.principal.principal().access_to("admin"), None);
    }
}
