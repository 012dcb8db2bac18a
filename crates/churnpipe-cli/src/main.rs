use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use churnpipe_core::EtlError;
use churnpipe_sync::{Pipeline, PipelineConfig, PgWarehouse};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "churnpipe")]
#[command(about = "Customer churn ETL pipeline and dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database and the etl_logs table if missing.
    Bootstrap,
    /// Append the configured CSV to the staging table.
    Load,
    /// Rebuild the cleaned table from staging.
    Clean,
    /// Run one tick: bootstrap, load, clean.
    Run,
    /// Run ticks on the configured cron until ctrl-c.
    Schedule,
    /// Serve the dashboard.
    Serve,
    /// Print the most recent etl_logs rows.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env).with_target(false).init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Run)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "churnpipe failed");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<EtlError>()
        .map(|etl| etl.kind().exit_code())
        .unwrap_or(1)
}

async fn run(command: Commands) -> Result<()> {
    let config = PipelineConfig::load()?;

    match command {
        Commands::Bootstrap => {
            let report = Pipeline::postgres(config).bootstrap().await?;
            println!(
                "bootstrap complete: database={} created={}",
                report.database, report.database_created
            );
        }
        Commands::Load => {
            let report = Pipeline::postgres(config).load().await?;
            if report.skipped_batch {
                println!(
                    "load skipped: {} already loaded into {}",
                    report.summary.source_path, report.table
                );
            } else {
                println!(
                    "load complete: table={} rows_read={} duplicates={} inserted={} missing={}",
                    report.table,
                    report.summary.rows_read,
                    report.summary.duplicates_removed,
                    report.rows_inserted,
                    report.summary.total_missing()
                );
            }
        }
        Commands::Clean => {
            let table = config.cleaned_table();
            let report = Pipeline::postgres(config).clean().await?;
            println!(
                "clean complete: table={} rows_read={} duplicates={} rows_written={}",
                table, report.rows_read, report.duplicates_removed, report.rows_written
            );
        }
        Commands::Run => {
            let summary = Pipeline::postgres(config).run_tick().await.into_result()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            churnpipe_sync::run_scheduler(Arc::new(Pipeline::postgres(config))).await?;
        }
        Commands::Serve => {
            churnpipe_web::serve(&config).await?;
        }
        Commands::Logs { limit } => {
            let warehouse = PgWarehouse::new(config.database_settings());
            for entry in warehouse.recent_logs(limit).await? {
                println!(
                    "{:>6}  {:<10}  {:<8}  {}  {}  {}",
                    entry.id.map(|id| id.to_string()).unwrap_or_default(),
                    entry.task_id,
                    entry.status.as_str(),
                    entry.start_time.format("%Y-%m-%d %H:%M:%S"),
                    entry
                        .end_time
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.error_message.as_deref().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use churnpipe_core::ErrorKind;

    #[test]
    fn no_subcommand_means_one_tick() {
        let cli = Cli::try_parse_from(["churnpipe"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn logs_limit_defaults_to_twenty() {
        let cli = Cli::try_parse_from(["churnpipe", "logs"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Logs { limit: 20 })));
        let cli = Cli::try_parse_from(["churnpipe", "logs", "--limit", "5"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Logs { limit: 5 })));
    }

    #[test]
    fn etl_errors_map_to_their_exit_codes() {
        let err = anyhow::Error::new(EtlError::ImputationImpossible {
            column: "age".to_string(),
        });
        assert_eq!(exit_code(&err), ErrorKind::ImputationImpossible.exit_code());
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
