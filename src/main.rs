use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use sshtunnel_harness::{cli, config::Config, destination, error::HarnessError, runner::SuiteReport, tunnel::TunnelMethod};

fn render(results: &[(TunnelMethod, Result<SuiteReport, HarnessError>)]) -> serde_json::Value {
    let runs: Vec<_> = results
        .iter()
        .map(|(method, result)| match result {
            Ok(report) => json!({ "method": method, "report": report }),
            Err(e) => json!({
                "method": method,
                "error": { "phase": e.phase(), "message": format!("{}", e) },
            }),
        })
        .collect();
    json!({ "runs": runs })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;
    let cfg = Config::load(&args.config_file)
        .await
        .with_context(|| format!("failed to load {}", args.config_file))?;
    let methods = if args.methods.is_empty() {
        cfg.methods()
    } else {
        args.methods.clone()
    };
    cfg.verify(&methods)?;
    if args.config_test {
        info!("config {} is valid", args.config_file);
        return Ok(());
    }

    let factory = destination::from_kind(&cfg.destination.kind)?;
    let runner = cfg.runner();
    let results = runner.run_all(&methods, factory.as_ref()).await;

    let failed = results
        .iter()
        .any(|(_, r)| !matches!(r, Ok(report) if report.passed));
    println!("{}", serde_json::to_string_pretty(&render(&results))?);
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
