#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cashbook_ledger::cli::run_with_sys_args().await
}
