use chrono::NaiveDate;
use clap::Args;
use uuid::Uuid;

use super::DatabaseOpts;
use crate::ledger::services::LedgerService;

#[derive(Args)]
pub struct CheckOpts {
    #[clap(flatten)]
    pub(super) database: DatabaseOpts,

    #[clap(long = "cashbook-id")]
    cashbook_id: Uuid,

    /// Print the report as JSON.
    #[clap(long)]
    json: bool,
}

#[derive(Args)]
pub struct SummaryOpts {
    #[clap(flatten)]
    pub(super) database: DatabaseOpts,

    #[clap(long = "cashbook-id")]
    cashbook_id: Uuid,

    /// Print the summary as JSON.
    #[clap(long)]
    json: bool,
}

#[derive(Args)]
pub struct SnapshotOpts {
    #[clap(flatten)]
    pub(super) database: DatabaseOpts,

    #[clap(long = "cashbook-id")]
    cashbook_id: Uuid,

    /// The first day to record, as `YYYY-MM-DD`.
    #[clap(long)]
    from: NaiveDate,

    /// The last day to record, as `YYYY-MM-DD`.
    #[clap(long)]
    to: NaiveDate,
}

pub async fn check(service: &LedgerService, opts: CheckOpts) -> anyhow::Result<()> {
    let report = service.check_consistency(opts.cashbook_id).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let precision = service.precision();
    let verdict = if report.is_accurate {
        "accurate".to_owned()
    } else {
        format!("off by {}", precision.format_value(report.difference))
    };

    println!(
        "Cashbook {}: cached {}, calculated {} ({}).",
        report.cashbook_id,
        precision.format_value(report.cached),
        precision.format_value(report.calculated),
        verdict
    );

    Ok(())
}

pub async fn summary(service: &LedgerService, opts: SummaryOpts) -> anyhow::Result<()> {
    let summary = service.get_balance_summary(opts.cashbook_id).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let precision = service.precision();
    let rows = [
        ("Initial balance", summary.initial_balance),
        ("Income", summary.total_income),
        ("Expenses", summary.total_expense),
        ("Transfers", summary.total_transfer),
        ("Net change", summary.net_change),
        ("Balance", summary.calculated_balance),
    ];

    for (label, value) in rows {
        println!("{:<16}{:>20}", label, precision.format_value(value));
    }

    println!(
        "{} completed, {} pending, {} cancelled",
        summary.completed_count, summary.pending_count, summary.cancelled_count
    );

    Ok(())
}

pub async fn snapshot(service: &LedgerService, opts: SnapshotOpts) -> anyhow::Result<()> {
    let recorded = service
        .record_daily_balances(opts.cashbook_id, opts.from, opts.to)
        .await?;

    println!(
        "Recorded {} daily balances for cashbook {}.",
        recorded, opts.cashbook_id
    );

    Ok(())
}
