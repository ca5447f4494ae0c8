use std::{
    str::FromStr as _,
    sync::Arc,
    time::Duration,
};

use ethers::types::Address;
use eyre::{
    Result,
    WrapErr as _,
};
use tokio::{
    select,
    sync::mpsc,
    task::{
        JoinError,
        JoinHandle,
    },
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
};

use crate::{
    assembler::{
        self,
        BlockAssembler,
        TreeCache,
    },
    challenges::ChallengeGenerator,
    config::Config,
    ethereum::{
        self,
        LedgerClient,
        Watcher,
    },
    ledger::Ledger,
    orchestrator::{
        self,
        Orchestrator,
    },
    signer::{
        self,
        SignerMessage,
    },
    state::SharedState,
    state_sync,
    storage::InMemoryStorage,
    verifier::Groth16Verifier,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SIGNER_CHANNEL_CAPACITY: usize = 64;

pub struct Optimist {
    // Token to signal all subtasks to shut down gracefully.
    shutdown_token: CancellationToken,
    orchestrator: Orchestrator,
    assembler: BlockAssembler,
    watcher: Watcher,
    signer_rx: mpsc::Receiver<SignerMessage>,
    start_l1_block: u64,
}

impl Optimist {
    /// Connects to the L1 node and wires up all subtasks.
    ///
    /// # Errors
    ///
    /// Returns an error if an address in the config fails to parse or if the
    /// L1 node cannot be reached.
    pub async fn new(cfg: Config) -> Result<(Self, ShutdownHandle)> {
        let shutdown_handle = ShutdownHandle::new();

        let node_address = Address::from_str(&cfg.node_address).wrap_err_with(|| {
            format!(
                "failed to parse `node_address` as an L1 address: `{}`",
                cfg.node_address
            )
        })?;
        let contract_address =
            Address::from_str(&cfg.ledger_contract_address).wrap_err_with(|| {
                format!(
                    "failed to parse `ledger_contract_address` as an L1 address: `{}`",
                    cfg.ledger_contract_address
                )
            })?;

        let provider = ethereum::watcher::connect(&cfg.ethereum_ws_endpoint)
            .await
            .wrap_err("failed to connect to the L1 node")?;

        let storage = Arc::new(InMemoryStorage::new());
        let verifier = Arc::new(Groth16Verifier);
        let ledger: Arc<dyn Ledger> =
            Arc::new(LedgerClient::new(provider.clone(), contract_address));
        let state = SharedState::new(node_address);
        let cache = TreeCache::new();

        let (signer, signer_rx) = signer::channel(SIGNER_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let challenges =
            ChallengeGenerator::new(storage.clone(), signer.clone(), state.clone());

        let orchestrator = orchestrator::Builder {
            storage: storage.clone(),
            verifier,
            ledger,
            challenges,
            state: state.clone(),
            cache: cache.clone(),
            is_challenger: cfg.is_challenger,
            events: events_rx,
            shutdown_token: shutdown_handle.token(),
        }
        .build();

        let assembler = assembler::Builder {
            storage,
            signer,
            state,
            cache,
            transactions_per_block: cfg.transactions_per_block,
            assembly_interval: Duration::from_millis(cfg.block_assembly_interval_ms),
            shutdown_token: shutdown_handle.token(),
        }
        .build();

        let watcher = ethereum::watcher::Builder {
            ethereum_ws_endpoint: cfg.ethereum_ws_endpoint,
            ledger_contract_address: contract_address,
            events: events_tx,
            shutdown_token: shutdown_handle.token(),
        }
        .build();

        let optimist = Self {
            shutdown_token: shutdown_handle.token(),
            orchestrator,
            assembler,
            watcher,
            signer_rx,
            start_l1_block: cfg.start_l1_block,
        };

        Ok((optimist, shutdown_handle))
    }

    pub async fn run(self) {
        let Self {
            shutdown_token,
            mut orchestrator,
            assembler,
            watcher,
            signer_rx,
            start_l1_block,
        } = self;

        // The watcher starts buffering live events into the orchestrator's
        // channel before the historical replay runs, so no event falls in
        // between. An event that lands in both the replay and the live
        // stream is applied twice; persistence is keyed by hash, so the
        // second application is a no-op.
        let mut watcher_task = tokio::spawn(watcher.run());
        info!("spawned L1 watcher task");

        let mut signer_task = tokio::spawn(signer::relay(signer_rx, shutdown_token.clone()));
        info!("spawned signer relay task");

        if let Err(error) = state_sync::synchronize(&mut orchestrator, start_l1_block).await {
            error!(%error, "state sync failed; shutting down");
            let shutdown = Shutdown {
                tasks: vec![("watcher", watcher_task), ("signer relay", signer_task)],
                shutdown_token,
            };
            shutdown.run().await;
            return;
        }

        let mut orchestrator_task = tokio::spawn(orchestrator.run());
        info!("spawned orchestrator task");

        let mut assembler_task = tokio::spawn(assembler.run());
        info!("spawned block assembler task");

        let shutdown = select!(
            o = &mut watcher_task => {
                report_exit("watcher", o);
                Shutdown {
                    tasks: vec![
                        ("orchestrator", orchestrator_task),
                        ("block assembler", assembler_task),
                        ("signer relay", signer_task),
                    ],
                    shutdown_token,
                }
            }
            o = &mut orchestrator_task => {
                report_exit("orchestrator", o);
                Shutdown {
                    tasks: vec![
                        ("watcher", watcher_task),
                        ("block assembler", assembler_task),
                        ("signer relay", signer_task),
                    ],
                    shutdown_token,
                }
            }
            o = &mut assembler_task => {
                report_exit("block assembler", o);
                Shutdown {
                    tasks: vec![
                        ("watcher", watcher_task),
                        ("orchestrator", orchestrator_task),
                        ("signer relay", signer_task),
                    ],
                    shutdown_token,
                }
            }
            o = &mut signer_task => {
                report_exit("signer relay", o);
                Shutdown {
                    tasks: vec![
                        ("watcher", watcher_task),
                        ("orchestrator", orchestrator_task),
                        ("block assembler", assembler_task),
                    ],
                    shutdown_token,
                }
            }
        );
        shutdown.run().await;
    }
}

/// A handle for instructing the [`Optimist`] to shut down.
///
/// It is returned along with its related `Optimist` from [`Optimist::new`].
/// The `Optimist` will begin to shut down as soon as
/// [`ShutdownHandle::shutdown`] is called or when the `ShutdownHandle` is
/// dropped.
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    #[must_use]
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Returns a clone of the wrapped cancellation token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Consumes `self` and cancels the wrapped cancellation token.
    pub fn shutdown(self) {
        self.token.cancel();
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            info!("shutdown handle dropped, issuing shutdown to all tasks");
        }
        self.token.cancel();
    }
}

fn report_exit(task_name: &str, outcome: Result<Result<()>, JoinError>) {
    match outcome {
        Ok(Ok(())) => info!(task = task_name, "task has exited"),
        Ok(Err(error)) => {
            error!(task = task_name, %error, "task returned with error");
        }
        Err(e) => {
            error!(
                task = task_name,
                error = &e as &dyn std::error::Error,
                "task failed to complete"
            );
        }
    }
}

struct Shutdown {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
    shutdown_token: CancellationToken,
}

impl Shutdown {
    // Kubernetes issues a SIGKILL 30 seconds after SIGTERM; leave headroom.
    const TASK_SHUTDOWN_TIMEOUT_SECONDS: u64 = 25;

    async fn run(self) {
        let Self {
            tasks,
            shutdown_token,
        } = self;

        shutdown_token.cancel();

        let limit = Duration::from_secs(Self::TASK_SHUTDOWN_TIMEOUT_SECONDS);
        for (name, mut task) in tasks {
            match timeout(limit, &mut task).await.map(flatten_result) {
                Ok(Ok(())) => info!(task = name, "task exited gracefully"),
                Ok(Err(error)) => error!(task = name, %error, "task exited with an error"),
                Err(_) => {
                    error!(
                        task = name,
                        timeout_secs = limit.as_secs(),
                        "task did not shut down within timeout; killing it"
                    );
                    task.abort();
                }
            }
        }
    }
}

fn flatten_result<T>(res: Result<Result<T>, JoinError>) -> Result<T> {
    match res {
        Ok(Ok(val)) => Ok(val),
        Ok(Err(err)) => Err(err).wrap_err("task returned with error"),
        Err(err) => Err(err).wrap_err("task panicked"),
    }
}
