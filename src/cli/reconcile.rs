use anyhow::bail;
use clap::Args;
use uuid::Uuid;

use super::DatabaseOpts;
use crate::ledger::{
    auditor::{BulkReport, ReconcileAction, ReconcileMode, ReconcileTarget},
    services::LedgerService,
};

#[derive(Args)]
pub struct ReconcileOpts {
    #[clap(flatten)]
    pub(super) database: DatabaseOpts,

    /// Only reconcile this cashbook.
    #[clap(long = "cashbook-id", conflicts_with = "store-id")]
    cashbook_id: Option<Uuid>,

    /// Only reconcile the cashbooks of this store.
    #[clap(long = "store-id")]
    store_id: Option<Uuid>,

    /// Report the balances that would be written without writing them.
    #[clap(long = "dry-run", conflicts_with = "check-only")]
    dry_run: bool,

    /// Only report which cashbooks have drifted.
    #[clap(long = "check-only")]
    check_only: bool,

    /// Exit with an error if any cashbook had drifted.
    #[clap(long = "fail-on-drift")]
    fail_on_drift: bool,

    /// Print the report as JSON.
    #[clap(long)]
    json: bool,
}

impl ReconcileOpts {
    fn target(&self) -> ReconcileTarget {
        match (self.cashbook_id, self.store_id) {
            (Some(cashbook_id), _) => ReconcileTarget::Cashbook(cashbook_id),
            (None, Some(store_id)) => ReconcileTarget::Store(store_id),
            (None, None) => ReconcileTarget::All,
        }
    }

    fn mode(&self) -> ReconcileMode {
        if self.check_only {
            ReconcileMode::CheckOnly
        } else if self.dry_run {
            ReconcileMode::DryRun
        } else {
            ReconcileMode::Apply
        }
    }
}

pub async fn run(service: &LedgerService, opts: ReconcileOpts) -> anyhow::Result<()> {
    let report = service.reconcile(opts.target(), opts.mode()).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(service, &report);
    }

    if !report.errors.is_empty() {
        bail!(
            "{} of {} cashbooks could not be reconciled",
            report.errors.len(),
            report.processed
        );
    }

    if opts.fail_on_drift {
        report.ensure_consistent()?;
    }

    Ok(())
}

fn print_report(service: &LedgerService, report: &BulkReport) {
    let precision = service.precision();

    println!(
        "Processed {} cashbooks: {} drifted, {} updated.",
        report.processed, report.drifted, report.updated
    );

    for entry in &report.entries {
        let verb = match entry.action {
            ReconcileAction::Unchanged => continue,
            ReconcileAction::Updated => "updated",
            ReconcileAction::WouldUpdate => "would update",
            ReconcileAction::NeedsUpdate => "needs update",
        };

        println!(
            "  {} ({}): {} -> {} ({}, off by {})",
            entry.name,
            entry.cashbook_id,
            precision.format_value(entry.before),
            precision.format_value(entry.calculated),
            verb,
            precision.format_value(entry.difference),
        );
    }

    for failure in &report.errors {
        println!(
            "  {} ({}): failed: {}",
            failure.name, failure.cashbook_id, failure.message
        );
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[clap(flatten)]
        opts: ReconcileOpts,
    }

    fn parse(args: &[&str]) -> Result<ReconcileOpts, clap::Error> {
        let base = ["reconcile", "--database-url", "postgres://localhost/ledger"];

        Harness::try_parse_from(base.iter().chain(args)).map(|harness| harness.opts)
    }

    #[test]
    fn defaults_to_applying_everything() {
        let opts = parse(&[]).unwrap();

        assert_eq!(ReconcileTarget::All, opts.target());
        assert_eq!(ReconcileMode::Apply, opts.mode());
    }

    #[test]
    fn store_target_in_check_mode() {
        let store_id = Uuid::new_v4();
        let opts = parse(&["--store-id", &store_id.to_string(), "--check-only"]).unwrap();

        assert_eq!(ReconcileTarget::Store(store_id), opts.target());
        assert_eq!(ReconcileMode::CheckOnly, opts.mode());
    }

    #[test]
    fn dry_run_conflicts_with_check_only() {
        assert!(parse(&["--dry-run", "--check-only"]).is_err());
    }

    #[test]
    fn cashbook_conflicts_with_store() {
        let id = Uuid::new_v4().to_string();

        assert!(parse(&["--cashbook-id", &id, "--store-id", &id]).is_err());
    }
}
