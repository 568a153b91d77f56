//! This example follows new blocks through a JSON-RPC block filter, and fetches the
//! transaction window over GraphQL.
//!
//! Usage: filter-blocks <json-rpc endpoint> [graphql endpoint]

use gnopoller::{
    graphql::GraphqlProvider, jsonrpc_filter::JsonRpcFilterProvider, run_poller, PollerOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("gnopoller::poller", log::LevelFilter::Debug)
        .init()?;

    let args = std::env::args().collect::<Vec<_>>();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <json-rpc endpoint> [graphql endpoint]", args[0]);
        std::process::exit(1);
    }

    let blocks = JsonRpcFilterProvider::with_endpoint(args[1].clone());
    let transactions = match args.get(2) {
        Some(endpoint) => GraphqlProvider::with_endpoint(endpoint.clone()),
        None => GraphqlProvider::gnoyager(),
    };

    run_poller(blocks, transactions, (), PollerOptions::default()).await?;

    Ok(())
}
