use anyhow::Result;
use clap::{Parser, Subcommand};
use festival_dbmon::{Config, HealthStatus, ObservabilityContainer, ServiceEvent};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "festival-dbmon")]
#[command(about = "Database health monitoring and query optimization for festival ticketing")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "FESTIVAL_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one system health check and print it
    Health {
        /// Print the full result as JSON
        #[arg(long)]
        detailed: bool,
    },
    /// Print the performance report
    Report {
        /// Include optimizer internals and service diagnostics
        #[arg(long)]
        detailed: bool,
        /// Run deep analysis and apply pending indexes first
        #[arg(long)]
        emergency: bool,
    },
    /// Create the festival indexes and refresh table statistics
    Indexes,
    /// Run periodic health monitoring until interrupted
    Monitor {
        /// Override the check interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Print Prometheus metrics on exit
        #[arg(long)]
        metrics: bool,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config.log_level, cli.json_logs);

    let container = ObservabilityContainer::connect(config).await?;

    let outcome = match cli.command {
        Commands::Health { detailed } => run_health(&container, detailed).await,
        Commands::Report {
            detailed,
            emergency,
        } => run_report(&container, detailed, emergency).await,
        Commands::Indexes => run_indexes(&container).await,
        Commands::Monitor {
            interval_ms,
            metrics,
        } => run_monitor(&container, interval_ms, metrics).await,
    };

    container.shutdown().await;
    outcome
}

async fn run_health(container: &ObservabilityContainer, detailed: bool) -> Result<()> {
    let report = container.perform_system_health_check().await?;

    if detailed {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Status: {}", report.status);
        println!("Connection: {}", report.connection.status);
        if let Some(error) = &report.connection.error {
            println!("  error: {error}");
        }
        for alert in &report.connection.alerts {
            println!("  [{}] {}", alert.severity, alert.message);
        }
        for recommendation in &report.connection.recommendations {
            println!("  -> {recommendation}");
        }
        println!(
            "Queries: {} recorded, {:.1}ms average",
            report.database.metrics.query_count, report.database.metrics.avg_query_time
        );
    }

    if report.status >= HealthStatus::Critical {
        anyhow::bail!("system health is {}", report.status);
    }
    Ok(())
}

async fn run_report(container: &ObservabilityContainer, detailed: bool, emergency: bool) -> Result<()> {
    let optimizer = container.query_optimizer().await?;
    let service = container.performance_service();

    if emergency {
        let summary = service.trigger_emergency_optimization().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if detailed {
        let report = service.get_detailed_report().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let report = service.generate_quick_report().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        for rec in optimizer.get_festival_recommendations().await {
            println!("  [{:?}] {}", rec.priority, rec.message);
        }
    }
    Ok(())
}

async fn run_indexes(container: &ObservabilityContainer) -> Result<()> {
    let optimizer = container.query_optimizer().await?;
    let report = optimizer.create_festival_indexes().await;
    optimizer.refresh_statistics().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.errors.is_empty() {
        anyhow::bail!("{} index(es) failed", report.errors.len());
    }
    Ok(())
}

async fn run_monitor(
    container: &ObservabilityContainer,
    interval_ms: Option<u64>,
    print_metrics: bool,
) -> Result<()> {
    let mut options = container.config.health_monitor.clone();
    if let Some(interval_ms) = interval_ms {
        options.check_interval_ms = interval_ms;
    }

    container.query_optimizer().await?;
    let mut events = container.performance_service().subscribe();
    let monitor = container.get_health_monitor(Some(options)).await?;
    monitor.start_periodic_monitoring().await;
    info!("Monitoring started, press Ctrl+C to stop");

    let mut status_tick = tokio::time::interval(Duration::from_millis(
        monitor.config().check_interval_ms,
    ));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                if let Ok(ServiceEvent::PerformanceAlert(alert) | ServiceEvent::QueryErrorAlert(alert)) = event {
                    warn!(severity = ?alert.severity, "{}", alert.message);
                }
            }
            _ = status_tick.tick() => {
                if let Some(result) = monitor.get_last_result().await {
                    info!(
                        status = %result.status,
                        alerts = result.alerts.len(),
                        duration_ms = result.duration_ms,
                        "Latest health check"
                    );
                }
            }
        }
    }

    monitor.stop_periodic_monitoring().await;
    let stats = monitor.get_monitoring_stats().await;
    info!(
        checks = stats.total_health_checks,
        failures = stats.health_check_failures,
        alerts = stats.alerts_generated,
        "Monitoring stopped"
    );

    if print_metrics {
        println!("{}", container.metrics().gather_metrics());
    }
    Ok(())
}
