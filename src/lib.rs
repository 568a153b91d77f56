//! # gnopoller
//! gnopoller keeps a live, trailing view of a gno.land chain by polling an indexer.
//!
//! ## Features
//!
//! - Two independent timers: one fetches the latest block, the other fetches every transaction in a
//!   trailing window of blocks (100 by default) ending at that block.
//! - Sources of chain data: the [tx-indexer](https://github.com/gnolang/tx-indexer) GraphQL API
//!   ([`graphql::GraphqlProvider`]), or its JSON-RPC block filters
//!   ([`jsonrpc_filter::JsonRpcFilterProvider`]) for the latest block. You can add your own sources by
//!   implementing [`BlockSource`] or [`TransactionSource`].
//! - Every transaction is normalized into one shape, `{block, hash, sender, extrinsic: {name, value}}`,
//!   see [`normalizer`]. Message kinds this crate doesn't know are kept, with no sender.
//! - Window statistics (transaction count, message type histogram, active accounts) in [`stats`].
//! - Failures never stop the poller: the previous block and window stay in [`ChainState`] until the
//!   next successful tick. Slow responses that arrive after newer ones are discarded.
//! - Implement [`PollObserver`] to get notified about every new block and window.
//!
//! This crate only works with tokio runtime.

#[cfg(feature = "graphql")]
pub mod graphql;
#[cfg(feature = "jsonrpc-filter")]
pub mod jsonrpc_filter;
pub mod normalizer;
mod poller_state;
#[cfg(all(test, feature = "graphql"))]
mod poller_tests;
pub mod stats;

use std::{
    fmt::{Debug, Display},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
pub use chrono;
use chrono::{DateTime, Utc};
use normalizer::{normalize_window, NormalizedTransaction, RawTransaction};
pub use poller_state::{ChainState, PollFailure, PollTarget, PollerError};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use stats::{window_floor, WindowStats};
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tokio_stream::{wrappers::IntervalStream, StreamExt};

pub type BlockHeight = u64;

pub const DEFAULT_WINDOW_SIZE: BlockHeight = 100;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Chain id, e.g. `test3`.
    pub id: String,
    pub version: String,
    pub time: DateTime<Utc>,
    pub number: BlockHeight,
    pub proposer: String,
}

/// Block as returned by the indexer's `blocks` query.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawBlock {
    pub height: BlockHeight,
    #[serde(default)]
    pub version: String,
    pub chain_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub proposer_address_raw: String,
}

impl From<RawBlock> for BlockHeader {
    fn from(block: RawBlock) -> Self {
        Self {
            id: block.chain_id,
            version: block.version,
            time: block.time,
            number: block.height,
            proposer: block.proposer_address_raw,
        }
    }
}

/// Normalized transactions of blocks `from_height` onwards, newest first.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionWindow {
    pub from_height: BlockHeight,
    /// Height of the current block when the window was requested.
    pub to_height: BlockHeight,
    pub transactions: Vec<NormalizedTransaction>,
}

impl TransactionWindow {
    pub fn stats(&self) -> WindowStats {
        WindowStats::from_window(self)
    }

    /// Every block of the window, newest first, with its transactions. Blocks without
    /// transactions are included with an empty list.
    pub fn by_block(&self) -> Vec<(BlockHeight, Vec<&NormalizedTransaction>)> {
        let highest = self
            .transactions
            .iter()
            .map(|transaction| transaction.block)
            .max()
            .map_or(self.to_height, |highest| highest.max(self.to_height));
        (self.from_height..=highest)
            .rev()
            .map(|height| {
                (
                    height,
                    self.transactions
                        .iter()
                        .filter(|transaction| transaction.block == height)
                        .collect(),
                )
            })
            .collect()
    }
}

#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    type Error: Display + Debug + Send + Sync + 'static;

    /// Blocks produced at or after `since`, oldest first. The last one is used as the current block.
    async fn recent_blocks(&self, since: DateTime<Utc>) -> Result<Vec<BlockHeader>, Self::Error>;
}

#[async_trait]
pub trait TransactionSource: Send + Sync + 'static {
    type Error: Display + Debug + Send + Sync + 'static;

    /// Transactions of blocks `from_height` and above, oldest first.
    async fn transactions_from(
        &self,
        from_height: BlockHeight,
    ) -> Result<Vec<RawTransaction>, Self::Error>;
}

#[async_trait]
impl<S: BlockSource> BlockSource for Arc<S> {
    type Error = S::Error;

    async fn recent_blocks(&self, since: DateTime<Utc>) -> Result<Vec<BlockHeader>, Self::Error> {
        S::recent_blocks(self, since).await
    }
}

#[async_trait]
impl<S: TransactionSource> TransactionSource for Arc<S> {
    type Error = S::Error;

    async fn transactions_from(
        &self,
        from_height: BlockHeight,
    ) -> Result<Vec<RawTransaction>, Self::Error> {
        S::transactions_from(self, from_height).await
    }
}

#[async_trait]
pub trait PollObserver: Send + Sync + 'static {
    type Error: Display + Debug + Send + Sync + 'static;

    async fn on_block(&self, _block: &BlockHeader) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_window(
        &self,
        _window: &TransactionWindow,
        _stats: &WindowStats,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[async_trait]
impl PollObserver for () {
    type Error = std::convert::Infallible;
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PollerOptions {
    /// How often the latest block is requested. Default is 1 second.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "block_poll_interval_ms")]
    pub block_poll_interval: Duration,
    /// How often the transaction window is requested. Default is 2 seconds.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "transaction_poll_interval_ms")]
    pub transaction_poll_interval: Duration,
    /// The block query asks for blocks produced within this period. It has to be longer than
    /// the block time, otherwise some ticks will get no blocks. Default is 30 seconds.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "look_back_ms")]
    pub look_back: Duration,
    /// Number of blocks in the transaction window, ending at the current block. Default is 100.
    pub window_size: BlockHeight,
    /// If true, the poller will stop if one of observer's methods returns an error.
    pub stop_on_error: bool,
    /// If true, [`run_poller`] will stop on Ctrl+C signal.
    pub ctrl_c_handler: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            block_poll_interval: Duration::from_secs(1),
            transaction_poll_interval: Duration::from_secs(2),
            look_back: Duration::from_secs(30),
            window_size: DEFAULT_WINDOW_SIZE,
            stop_on_error: false,
            ctrl_c_handler: true,
        }
    }
}

impl PollerOptions {
    /// Reads options from a JSON file. Missing fields get their default values.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let contents = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(OptionsError::Io)?;
        let options: Self = serde_json::from_str(&contents).map_err(OptionsError::Parse)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.window_size == 0 {
            return Err(OptionsError::Invalid("window_size must be at least 1"));
        }
        if self.block_poll_interval < MIN_POLL_INTERVAL
            || self.transaction_poll_interval < MIN_POLL_INTERVAL
        {
            return Err(OptionsError::Invalid(
                "poll intervals must be at least 10 milliseconds",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum OptionsError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(&'static str),
}

impl Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionsError::Io(e) => write!(f, "Failed to read options file: {e}"),
            OptionsError::Parse(e) => write!(f, "Failed to parse options file: {e}"),
            OptionsError::Invalid(e) => write!(f, "Invalid options: {e}"),
        }
    }
}

impl std::error::Error for OptionsError {}

/// What the timer tasks share.
pub(crate) struct PollContext<O: PollObserver> {
    pub(crate) state: Arc<ChainState>,
    pub(crate) observer: O,
    pub(crate) options: PollerOptions,
    shutdown: Arc<watch::Sender<bool>>,
    observer_error: Arc<Mutex<Option<String>>>,
}

impl<O: PollObserver> PollContext<O> {
    pub(crate) fn new(observer: O, options: PollerOptions) -> Self {
        Self {
            state: Arc::new(ChainState::new()),
            observer,
            options,
            shutdown: Arc::new(watch::channel(false).0),
            observer_error: Arc::new(Mutex::new(None)),
        }
    }

    fn handle_observer_result(&self, result: Result<(), O::Error>) {
        if let Err(err) = result {
            log::error!("Observer error: {err}");
            if self.options.stop_on_error {
                *self
                    .observer_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
                self.shutdown.send_replace(true);
            }
        }
    }
}

/// Fetches the latest block and, if it's newer than the current one, makes it current.
pub(crate) async fn poll_block<B: BlockSource, O: PollObserver>(
    blocks: &B,
    context: &PollContext<O>,
    sequence: u64,
) {
    let look_back = chrono::Duration::from_std(context.options.look_back)
        .unwrap_or_else(|_| chrono::Duration::days(1));
    match blocks.recent_blocks(Utc::now() - look_back).await {
        Ok(mut recent) => match recent.pop() {
            Some(block) => {
                if let Some(block) = context.state.apply_block(sequence, block) {
                    log::debug!(target: "gnopoller::poller", "Current block is {} ({})", block.number, block.time);
                    let result = context.observer.on_block(&block).await;
                    context.handle_observer_result(result);
                }
            }
            None => {
                log::debug!(target: "gnopoller::poller", "Block source returned no new blocks, keeping block {:?}",
                    context.state.current_height());
            }
        },
        Err(err) => {
            log::error!(target: "gnopoller::poller::fetch_failed", "Failed to fetch the latest block: {err}");
            context.state.record_failure(PollTarget::Block, &err);
        }
    }
}

/// Fetches the transaction window ending at the current block and replaces the current window.
pub(crate) async fn poll_transactions<T: TransactionSource, O: PollObserver>(
    transactions: &T,
    context: &PollContext<O>,
    sequence: u64,
) {
    const NORMALIZATION_WARNING_THRESHOLD: Duration = Duration::from_millis(300);

    let Some(to_height) = context.state.current_height() else {
        log::debug!(target: "gnopoller::poller", "No current block yet, skipping transactions");
        return;
    };
    let from_height = window_floor(to_height, context.options.window_size);
    let raw = match transactions.transactions_from(from_height).await {
        Ok(raw) => raw,
        Err(err) => {
            log::error!(target: "gnopoller::poller::fetch_failed", "Failed to fetch transactions from block {from_height}: {err}");
            context.state.record_failure(PollTarget::Transactions, &err);
            return;
        }
    };

    let started = Instant::now();
    let window = TransactionWindow {
        from_height,
        to_height,
        transactions: normalize_window(&raw),
    };
    let elapsed = started.elapsed();
    log::debug!(target: "gnopoller::performance", "Normalizing {} transactions took {elapsed:#?}", raw.len());
    if elapsed > NORMALIZATION_WARNING_THRESHOLD {
        log::warn!(target: "gnopoller::performance", "Normalizing {} transactions took {elapsed:#?}", raw.len());
    }

    if let Some(window) = context.state.apply_window(sequence, window) {
        let stats = window.stats();
        log::debug!(target: "gnopoller::poller", "{} transactions in blocks {from_height}..={to_height}",
            stats.transaction_count);
        let result = context.observer.on_window(&window, &stats).await;
        context.handle_observer_result(result);
    }
}

/// Ticks every `period` until shutdown. Each tick spawns one request, so a slow response
/// never delays the next tick.
async fn run_timer<S, O, F, Fut>(
    source: Arc<S>,
    context: Arc<PollContext<O>>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    next_sequence: fn(&ChainState) -> u64,
    poll: F,
) where
    S: Send + Sync + 'static,
    O: PollObserver,
    F: Fn(Arc<S>, Arc<PollContext<O>>, u64) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval(period.max(MIN_POLL_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(interval);
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = ticks.next() => {
                let sequence = next_sequence(&context.state);
                in_flight.spawn(poll(Arc::clone(&source), Arc::clone(&context), sequence));
            }
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = result {
                    log::error!(target: "gnopoller::poller", "Poll request panicked: {err}");
                }
            }
        }
    }
    in_flight.abort_all();
}

/// A running poller. Owns both timer tasks; they stop on [`Poller::shutdown`] or when the
/// poller is dropped.
pub struct Poller {
    state: Arc<ChainState>,
    shutdown: Arc<watch::Sender<bool>>,
    observer_error: Arc<Mutex<Option<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Poller {
    pub fn start<B, T, O>(blocks: B, transactions: T, observer: O, options: PollerOptions) -> Self
    where
        B: BlockSource,
        T: TransactionSource,
        O: PollObserver,
    {
        let context = Arc::new(PollContext::new(observer, options));
        let state = Arc::clone(&context.state);
        let shutdown = Arc::clone(&context.shutdown);
        let observer_error = Arc::clone(&context.observer_error);

        log::info!(
            "Polling blocks every {:?} and the last {} blocks of transactions every {:?}",
            context.options.block_poll_interval,
            context.options.window_size,
            context.options.transaction_poll_interval,
        );

        let block_timer = tokio::spawn(run_timer(
            Arc::new(blocks),
            Arc::clone(&context),
            shutdown.subscribe(),
            context.options.block_poll_interval,
            ChainState::next_block_sequence,
            |blocks: Arc<B>, context: Arc<PollContext<O>>, sequence| async move {
                poll_block(&*blocks, &context, sequence).await
            },
        ));
        let transaction_timer = tokio::spawn(run_timer(
            Arc::new(transactions),
            Arc::clone(&context),
            shutdown.subscribe(),
            context.options.transaction_poll_interval,
            ChainState::next_window_sequence,
            |transactions: Arc<T>, context: Arc<PollContext<O>>, sequence| async move {
                poll_transactions(&*transactions, &context, sequence).await
            },
        ));

        Self {
            state,
            shutdown,
            observer_error,
            tasks: vec![block_timer, transaction_timer],
        }
    }

    pub fn state(&self) -> Arc<ChainState> {
        Arc::clone(&self.state)
    }

    /// Resolves once a stop was requested, either by [`Poller::shutdown`] or by an observer
    /// error with [`PollerOptions::stop_on_error`].
    pub async fn stopped(&self) {
        let mut receiver = self.shutdown.subscribe();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stops both timers, aborts requests that are still in flight and waits for the tasks.
    pub async fn shutdown(mut self) -> Result<(), PollerError> {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut self.tasks);
        futures::future::try_join_all(tasks)
            .await
            .map_err(PollerError::Join)?;
        log::info!("Poller stopped");
        match self
            .observer_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(PollerError::Observer(err)),
            None => Ok(()),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Runs the poller until Ctrl+C (if [`PollerOptions::ctrl_c_handler`] is set), or until an
/// observer fails with [`PollerOptions::stop_on_error`] set.
pub async fn run_poller<B, T, O>(
    blocks: B,
    transactions: T,
    observer: O,
    options: PollerOptions,
) -> Result<(), PollerError>
where
    B: BlockSource,
    T: TransactionSource,
    O: PollObserver,
{
    let ctrl_c_handler = options.ctrl_c_handler;
    let poller = Poller::start(blocks, transactions, observer, options);
    let ctrl_c = async {
        if ctrl_c_handler {
            tokio::signal::ctrl_c().await.ok();
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = poller.stopped() => {}
        _ = ctrl_c => {
            log::info!("Received Ctrl+C signal, stopping the poller");
        }
    }
    poller.shutdown().await
}

#[cfg(any(feature = "graphql", feature = "jsonrpc-filter"))]
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(format!(
            "{} {} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            if cfg!(test) {
                "test"
            } else if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            }
        ))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|err| {
            log::warn!("Failed to build HTTP client, using defaults: {err}");
            reqwest::Client::new()
        })
}
