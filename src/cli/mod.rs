//! CLI subcommands: validate, plan, deploy, probe.

use crate::core::cancel::Cancellation;
use crate::core::config::EngineConfig;
use crate::core::engine::{Engine, RunOptions};
use crate::core::executor::RunReport;
use crate::core::parser;
use crate::core::planner::{ExecutionPlan, StageKind};
use crate::core::probe::run_probe;
use crate::core::types::ReadinessProbe;
use crate::repo::LocalTileRepo;
use crate::sink::{LogSink, StdoutSink};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Engine config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the work directory from the config
    #[arg(long, global = true)]
    pub work_home: Option<PathBuf>,

    /// Override the local tile repository from the config
    #[arg(long, global = true)]
    pub tile_repo: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a deployment file without fetching tiles
    Validate {
        /// Path to the deployment YAML
        #[arg(short, long, default_value = "deployment.yaml")]
        file: PathBuf,
    },

    /// Resolve tiles and show the execution plan
    Plan {
        /// Path to the deployment YAML
        #[arg(short, long, default_value = "deployment.yaml")]
        file: PathBuf,
    },

    /// Resolve, plan and run a deployment
    Deploy {
        /// Path to the deployment YAML
        #[arg(short, long, default_value = "deployment.yaml")]
        file: PathBuf,

        /// Render scripts and replay recorded logs instead of running anything
        #[arg(long)]
        dry_run: bool,

        /// Run independent families concurrently
        #[arg(long)]
        parallel: bool,
    },

    /// Run a readiness probe until it passes, fails or times out
    Probe {
        /// Probe command or script file
        #[arg(long)]
        command: String,

        #[arg(long, default_value_t = 0)]
        initial_delay_seconds: u64,

        #[arg(long, default_value_t = 10)]
        period_seconds: u64,

        #[arg(long, default_value_t = 300)]
        timeout_seconds: u64,

        /// -1 disables
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        success_threshold: i64,

        /// -1 disables
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        failure_threshold: i64,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(global: &GlobalArgs, cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan { file } => cmd_plan(global, &file),
        Commands::Deploy {
            file,
            dry_run,
            parallel,
        } => cmd_deploy(global, &file, dry_run, parallel).await,
        Commands::Probe {
            command,
            initial_delay_seconds,
            period_seconds,
            timeout_seconds,
            success_threshold,
            failure_threshold,
        } => {
            let probe = ReadinessProbe {
                command,
                initial_delay_seconds,
                period_seconds,
                timeout_seconds,
                success_threshold,
                failure_threshold,
            };
            cmd_probe(global, &probe).await
        }
    }
}

/// Config file plus command-line overrides.
fn load_config(global: &GlobalArgs) -> Result<EngineConfig, String> {
    let mut config = EngineConfig::load(global.config.as_deref()).map_err(|e| e.to_string())?;
    if let Some(work_home) = &global.work_home {
        config.work_home.clone_from(work_home);
    }
    if let Some(tile_repo) = &global.tile_repo {
        config.tile_repo.clone_from(tile_repo);
    }
    Ok(config)
}

fn build_engine(global: &GlobalArgs, sink: Arc<dyn LogSink>) -> Result<Engine, String> {
    let config = load_config(global)?;
    let source = Arc::new(LocalTileRepo::new(config.tile_repo.clone()));
    Ok(Engine::new(config, source, sink))
}

fn read_file(file: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(file).map_err(|e| format!("cannot read {}: {}", file.display(), e))
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let deployment = parser::parse_deployment_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_deployment(&deployment);

    if errors.is_empty() {
        println!(
            "OK: {} ({} tiles)",
            deployment.metadata.name,
            deployment.spec.template.tiles.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_plan(global: &GlobalArgs, file: &Path) -> Result<(), String> {
    let bytes = read_file(file)?;
    let engine = build_engine(global, Arc::new(StdoutSink::new()))?;
    let ctx = engine
        .prepare(&bytes, &RunOptions::default())
        .map_err(|e| e.to_string())?;
    print!("{}", format_plan(&ctx.plan));
    Ok(())
}

/// Human-readable plan: one block per stage, then the flows.
fn format_plan(plan: &ExecutionPlan) -> String {
    let mut out = format!(
        "Planning: {} ({} stages)\n\n",
        plan.deployment.metadata.name,
        plan.len()
    );
    for stage in &plan.stages {
        let kind = match stage.kind {
            StageKind::DeclarativeInfra => "infra",
            StageKind::Command => "command",
        };
        out.push_str(&format!(
            "  {} [{}] {}@{}\n",
            stage.name, kind, stage.tile_name, stage.tile_version
        ));
        for cmd in stage.prep.iter().chain(stage.commands.iter()) {
            out.push_str(&format!("      {}\n", cmd));
        }
        for cmd in &stage.post_commands {
            out.push_str(&format!("    post: {}\n", cmd));
        }
    }
    out.push_str(&format!("\nSequential: {}\n", plan.flow()));
    out.push_str("Parallel:\n");
    for flow in plan.family_flows() {
        out.push_str(&format!("  {}\n", flow));
    }
    out
}

async fn cmd_deploy(
    global: &GlobalArgs,
    file: &Path,
    dry_run: bool,
    parallel: bool,
) -> Result<(), String> {
    let bytes = read_file(file)?;
    let engine = build_engine(global, Arc::new(StdoutSink::new()))?;

    let cancel = Cancellation::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let opts = RunOptions {
        dry_run,
        parallel,
        cancel: Some(cancel),
    };
    let report = engine.deploy(&bytes, opts).await.map_err(|e| e.to_string())?;
    print_report(&report, dry_run);
    match report.failure {
        Some(e) => Err(e.to_string()),
        None => Ok(()),
    }
}

fn print_report(report: &RunReport, dry_run: bool) {
    println!();
    if dry_run {
        println!("Dry run: recorded logs replayed, nothing executed.");
    }
    for (stage, reason) in &report.interrupted {
        println!("  INTERRUPTED {}: {}", stage, reason);
    }
    println!(
        "Run {}: {} stage(s) done, {} interrupted ({:.1}s)",
        report.run_id,
        report.stages_done,
        report.interrupted.len(),
        report.duration.as_secs_f64()
    );
    if let Some(path) = &report.summary_path {
        println!("Summary: {}", path.display());
    }
}

async fn cmd_probe(global: &GlobalArgs, probe: &ReadinessProbe) -> Result<(), String> {
    let config = load_config(global)?;
    let outcome = run_probe(probe, &config.shell)
        .await
        .map_err(|e| e.to_string())?;
    if outcome.is_ready() {
        Ok(())
    } else {
        Err(format!("probe not ready: {:?}", outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: Network0
  category: Network
  version: 0.0.1
spec:
  outputs:
    - name: baseVpc
"#;

    const DEPLOYMENT: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Deployment
metadata:
  name: cli-test
spec:
  template:
    tiles:
      net:
        tileReference: Network0
        tileVersion: 0.0.1
  summary:
    description: network only
    outputs:
      - name: vpc
        value: $(net.outputs.baseVpc)
"#;

    fn workspace() -> (tempfile::TempDir, GlobalArgs, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("tiles/Network0/0.0.1");
        std::fs::create_dir_all(bundle.join("test")).unwrap();
        std::fs::write(bundle.join("tile-spec.yaml"), NETWORK).unwrap();
        std::fs::write(
            bundle.join("test/output.log"),
            "{\"level\":\"info\",\"msg\":\"NetStack.baseVpcId = vpc-9\"}\n",
        )
        .unwrap();
        let file = dir.path().join("deployment.yaml");
        std::fs::write(&file, DEPLOYMENT).unwrap();
        let global = GlobalArgs {
            config: None,
            work_home: Some(dir.path().join("work")),
            tile_repo: Some(dir.path().join("tiles")),
        };
        (dir, global, file)
    }

    #[test]
    fn test_cli_validate_valid() {
        let (_dir, _, file) = workspace();
        assert!(cmd_validate(&file).is_ok());
    }

    #[test]
    fn test_cli_validate_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.yaml");
        std::fs::write(
            &file,
            DEPLOYMENT.replace("mahjong.io/v1alpha1", "example.com/v2"),
        )
        .unwrap();
        let err = cmd_validate(&file).unwrap_err();
        assert!(err.contains("1 validation error"));
    }

    #[test]
    fn test_cli_validate_missing_file() {
        assert!(cmd_validate(Path::new("/nonexistent/deployment.yaml")).is_err());
    }

    #[test]
    fn test_cli_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dice.yaml");
        std::fs::write(&path, "work_home: /from/file\nsettle_seconds: 3\n").unwrap();
        let global = GlobalArgs {
            config: Some(path),
            work_home: Some(PathBuf::from("/from/flag")),
            tile_repo: None,
        };
        let config = load_config(&global).unwrap();
        assert_eq!(config.work_home, PathBuf::from("/from/flag"));
        assert_eq!(config.settle_seconds, 3);
        assert_eq!(config.tile_repo, PathBuf::from("./tiles"));
    }

    #[test]
    fn test_cli_plan_format() {
        let (_dir, global, file) = workspace();
        let engine = build_engine(&global, Arc::new(crate::sink::MemorySink::new())).unwrap();
        let ctx = engine
            .prepare(&read_file(&file).unwrap(), &RunOptions::default())
            .unwrap();
        let text = format_plan(&ctx.plan);
        assert!(text.contains("Planning: cli-test (1 stages)"));
        assert!(text.contains("net [infra] Network0@0.0.1"));
        assert!(text.contains("cdk deploy NetStack --require-approval never"));
        assert!(text.contains("Sequential: net"));
        assert!(text.contains("[net] net"));
        assert!(cmd_plan(&global, &file).is_ok());
    }

    #[tokio::test]
    async fn test_cli_deploy_dry_run() {
        let (dir, global, file) = workspace();
        cmd_deploy(&global, &file, true, false).await.unwrap();
        let runs: Vec<_> = std::fs::read_dir(dir.path().join("work/runs"))
            .unwrap()
            .collect();
        assert_eq!(runs.len(), 1);
        let run_dir = runs[0].as_ref().unwrap().path();
        let summary = std::fs::read_to_string(run_dir.join("output-summary.txt")).unwrap();
        assert!(summary.contains("vpc: vpc-9"));
    }

    #[tokio::test]
    async fn test_cli_probe_exit_status() {
        let global = GlobalArgs::default();
        let ready = ReadinessProbe {
            command: "true".into(),
            initial_delay_seconds: 0,
            period_seconds: 0,
            timeout_seconds: 5,
            success_threshold: 1,
            failure_threshold: 1,
        };
        assert!(cmd_probe(&global, &ready).await.is_ok());
        let failing = ReadinessProbe {
            command: "false".into(),
            ..ready
        };
        let err = cmd_probe(&global, &failing).await.unwrap_err();
        assert!(err.contains("probe not ready"));
    }
}
