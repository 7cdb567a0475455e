use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::{domain::Plan, error::ApiError, protocol::StatusResponse};

#[derive(Parser, Debug)]
#[command(name = "plotter-tools", about = "Helpers for working with plotterd")]
struct Cli {
    #[arg(long, global = true, default_value = "http://127.0.0.1:9080")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports and mark the ones that look like plotters.
    ListPorts,
    /// Submit a plan file to the server.
    Plot { file: PathBuf },
    /// Stop the running plot after its current motion.
    Cancel,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let server_url = cli.server_url.trim_end_matches('/');
    let http = reqwest::Client::new();

    match cli.command {
        Command::ListPorts => {
            let ports = tokio::task::spawn_blocking(plotter::list_ports).await??;
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                let marker = if port.is_plotter { "*" } else { " " };
                println!("{marker} {}\t{}", port.path, port.description);
            }
        }
        Command::Plot { file } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let plan = Plan::from_json(&raw)
                .with_context(|| format!("{} is not a valid plan", file.display()))?;
            let res = http
                .post(format!("{server_url}/plot"))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(raw)
                .send()
                .await?;
            check(res).await?;
            println!(
                "plot accepted: {} motions, about {:.1}s",
                plan.len(),
                plan.duration().as_secs_f64()
            );
        }
        Command::Cancel => {
            let res = http.post(format!("{server_url}/cancel")).send().await?;
            check(res).await?;
            println!("cancel requested");
        }
        Command::Status => {
            let status: StatusResponse = http
                .get(format!("{server_url}/status"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!(
                "device={} plotting={} observers={}",
                status.device.as_deref().unwrap_or("none"),
                status.plotting,
                status.observers
            );
        }
    }

    Ok(())
}

/// Turns an error response into an error carrying the server's message.
async fn check(res: reqwest::Response) -> Result<()> {
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    match res.json::<ApiError>().await {
        Ok(error) => bail!("server rejected request ({status}): {}", error.message),
        Err(_) => bail!("server rejected request ({status})"),
    }
}
