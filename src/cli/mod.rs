use std::{borrow::Cow, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{DatabaseOptions, EngineConfig},
    database::PostgresConnection,
    ledger::{access::Unrestricted, domain::precision::Precision, services::LedgerService},
    repos::DynLedgerRepo,
};

mod migrate;
mod reconcile;
mod report;

#[derive(Parser)]
#[clap(version, about = "Keeps cashbook balances consistent with their ledgers.")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// DSN to tell Sentry where to send events.
    ///
    /// If provided, errors will be sent to Sentry.
    #[clap(long = "sentry-dsn", env = "SENTRY_DSN")]
    sentry_dsn: Option<String>,

    /// The number of milliseconds to wait for a cashbook lock before giving
    /// up.
    #[clap(
        long = "lock-timeout-ms",
        default_value = "5000",
        env = "LEDGER_LOCK_TIMEOUT_MS"
    )]
    lock_timeout_ms: u64,

    /// The total number of digits balances are stored with. Two of them are
    /// always decimal places. The bundled schema stores at most 12.
    #[clap(
        long = "balance-max-digits",
        default_value = "12",
        value_parser = clap::value_parser!(u32).range(3..=12)
    )]
    balance_max_digits: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the bundled database migrations.
    Migrate(DatabaseOpts),
    /// Compare cached balances to their ledgers and repair drift.
    Reconcile(reconcile::ReconcileOpts),
    /// Check a single cashbook's balance without changing it.
    Check(report::CheckOpts),
    /// Show the breakdown of a cashbook's balance.
    Summary(report::SummaryOpts),
    /// Record daily balances for a cashbook.
    Snapshot(report::SnapshotOpts),
}

#[derive(Args)]
pub struct DatabaseOpts {
    /// The number of connections to use for the database pool.
    #[clap(long = "database-pool-size", default_value = "4")]
    database_pool_size: u32,

    /// The number of seconds before a database connection times out.
    #[clap(long = "database-timeout", default_value = "5")]
    database_timeout: u8,

    /// Connection string for the ledger database.
    #[clap(long = "database-url", env = "DATABASE_URL")]
    database_url: String,
}

impl From<&DatabaseOpts> for DatabaseOptions {
    fn from(opts: &DatabaseOpts) -> Self {
        Self {
            pool_size: opts.database_pool_size,
            timeout_seconds: opts.database_timeout,
            url: opts.database_url.clone(),
        }
    }
}

impl From<&Cli> for EngineConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            lock_timeout: Duration::from_millis(cli.lock_timeout_ms),
            precision: Precision::new(cli.balance_max_digits, 2),
        }
    }
}

/// Connect to the database and build a service for operator commands, which
/// are not subject to store membership.
async fn connect_service(
    opts: &DatabaseOpts,
    config: EngineConfig,
) -> anyhow::Result<LedgerService> {
    let connection = PostgresConnection::connect(&opts.into()).await?;
    let repo: DynLedgerRepo = Arc::new(connection);

    Ok(LedgerService::new(repo, Arc::new(Unrestricted), config))
}

pub async fn run_with_sys_args() -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    let cli = Cli::parse();

    let sentry_config = cli.sentry_dsn.as_ref().map(|dsn| {
        debug!("Enabled sentry.");

        let release_name = option_env!("VERGEN_GIT_SHA")
            .map(Cow::from)
            .or_else(|| sentry::release_name!());

        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: release_name,
                ..Default::default()
            },
        ))
    });

    let sentry_tracing_layer = if sentry_config.is_some() {
        Some(sentry_tracing::layer())
    } else {
        None
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_tracing_layer)
        .init();

    let config = EngineConfig::from(&cli);

    match cli.command {
        Commands::Migrate(opts) => migrate::run_migrations(&(&opts).into()).await,
        Commands::Reconcile(opts) => {
            let service = connect_service(&opts.database, config).await?;

            reconcile::run(&service, opts).await
        }
        Commands::Check(opts) => {
            let service = connect_service(&opts.database, config).await?;

            report::check(&service, opts).await
        }
        Commands::Summary(opts) => {
            let service = connect_service(&opts.database, config).await?;

            report::summary(&service, opts).await
        }
        Commands::Snapshot(opts) => {
            let service = connect_service(&opts.database, config).await?;

            report::snapshot(&service, opts).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(max_digits: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from([
            "cashbook-ledger",
            "--balance-max-digits",
            max_digits,
            "migrate",
            "--database-url",
            "postgres://localhost/ledger",
        ])
    }

    #[test]
    fn balance_digits_within_schema() {
        let cli = parse("10").unwrap();

        assert_eq!(Precision::new(10, 2), EngineConfig::from(&cli).precision);
    }

    #[test]
    fn balance_digits_beyond_schema_rejected() {
        assert!(parse("13").is_err());
    }
}
