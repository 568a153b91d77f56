//! This example prints runtime statistics of the last 100 blocks of the gno.land testnet,
//! every time a new window of transactions arrives.
//!
//! Usage: watch-window [options.json]

use async_trait::async_trait;
use gnopoller::{
    graphql::GraphqlProvider, normalizer::ExtrinsicValue, run_poller, stats::WindowStats,
    BlockHeader, PollObserver, PollerOptions, TransactionWindow,
};

struct StatisticsPrinter;

#[async_trait]
impl PollObserver for StatisticsPrinter {
    type Error = String;

    async fn on_block(&self, block: &BlockHeader) -> Result<(), Self::Error> {
        log::info!(
            "{} block {} at {}, proposed by {}",
            block.id,
            block.number,
            block.time,
            block.proposer
        );
        Ok(())
    }

    async fn on_window(
        &self,
        window: &TransactionWindow,
        stats: &WindowStats,
    ) -> Result<(), Self::Error> {
        log::info!(
            "Statistics of extrinsic executions between block {} and {} inclusive",
            window.from_height,
            window.to_height
        );
        log::info!("  number of extrinsic executions: {}", stats.transaction_count);
        log::info!("  number of extrinsic types: {}", stats.extrinsic_type_count());
        for (name, count) in &stats.extrinsic_types {
            log::info!("    {name}: {count}");
        }
        log::info!("  active accounts: {}", stats.active_accounts);
        for (name, senders) in &stats.active_accounts_by_type {
            log::info!("    {name}:");
            for (sender, count) in senders {
                log::info!("      {sender}: {count}");
            }
        }
        for (height, transactions) in window.by_block() {
            if transactions.is_empty() {
                continue;
            }
            log::info!("block {height}");
            for transaction in transactions {
                match &transaction.extrinsic.value {
                    ExtrinsicValue::Transfer { from, to, amount } => {
                        log::info!("  {} {}: {from} -> {to} {amount}", transaction.extrinsic.name, transaction.hash)
                    }
                    ExtrinsicValue::Publish { creator, package } => log::info!(
                        "  {} {}: {creator} published {} at {}",
                        transaction.extrinsic.name,
                        transaction.hash,
                        package.name.as_deref().unwrap_or("?"),
                        package.path
                    ),
                    ExtrinsicValue::Call { caller, package, .. }
                    | ExtrinsicValue::Run { caller, package } => log::info!(
                        "  {} {}: {caller} on {}",
                        transaction.extrinsic.name,
                        transaction.hash,
                        package.path
                    ),
                    ExtrinsicValue::Empty {} => log::info!("  {transaction}"),
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("gnopoller::performance", log::LevelFilter::Debug)
        .init()?;

    let options = match std::env::args().nth(1) {
        Some(path) => PollerOptions::from_file(path).await?,
        None => PollerOptions::default(),
    };

    let provider = GraphqlProvider::gnoyager();
    run_poller(provider.clone(), provider, StatisticsPrinter, options).await?;

    Ok(())
}
