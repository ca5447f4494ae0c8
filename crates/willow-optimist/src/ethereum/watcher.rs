//! Watches the rollup contract on L1 and feeds the orchestrator.
//!
//! Subscribes to new heads over websocket, pulls the contract's logs for
//! each head, and decodes them into [`EventNotification`]s. Logs flagged
//! `removed` by the node are forwarded with the flag intact; the
//! orchestrator owns the reorg handling.
//!
//! BlockProposed and TransactionSubmitted carry their payload in the
//! proposing transaction's calldata rather than in the log, so decoding
//! those fetches the transaction and strips the 4-byte selector.

use std::{
    sync::Arc,
    time::Duration,
};

use ethers::{
    abi::{
        self,
        ParamType,
        Token,
    },
    providers::{
        Middleware,
        Provider,
        ProviderError,
        StreamExt as _,
        Ws,
    },
    types::{
        Filter,
        Log,
        H256,
    },
    utils::keccak256,
};
use eyre::{
    bail,
    eyre,
    Result,
    WrapErr as _,
};
use tokio::{
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

use crate::orchestrator::{
    Event,
    EventNotification,
};

fn topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

pub struct Builder {
    pub ethereum_ws_endpoint: String,
    pub ledger_contract_address: ethers::types::Address,
    pub events: mpsc::Sender<EventNotification>,
    pub shutdown_token: CancellationToken,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Watcher {
        let Self {
            ethereum_ws_endpoint,
            ledger_contract_address,
            events,
            shutdown_token,
        } = self;
        Watcher {
            ethereum_ws_endpoint,
            ledger_contract_address,
            events,
            shutdown_token,
        }
    }
}

pub struct Watcher {
    ethereum_ws_endpoint: String,
    ledger_contract_address: ethers::types::Address,
    events: mpsc::Sender<EventNotification>,
    shutdown_token: CancellationToken,
}

impl Watcher {
    pub async fn run(self) -> Result<()> {
        let provider = connect(&self.ethereum_ws_endpoint)
            .await
            .wrap_err("watcher failed to connect to the L1 node")?;

        select! {
            res = watch_for_blocks(
                provider,
                self.ledger_contract_address,
                self.events.clone(),
            ) => {
                res.wrap_err("block watcher exited")
            }
            () = self.shutdown_token.cancelled() => {
                info!("watcher shutting down");
                Ok(())
            }
        }
    }
}

pub(crate) async fn connect(endpoint: &str) -> Result<Arc<Provider<Ws>>> {
    let retry_config = tryhard::RetryFutureConfig::new(1024)
        .exponential_backoff(Duration::from_millis(500))
        .max_delay(Duration::from_secs(60))
        .on_retry(
            |attempt, next_delay: Option<Duration>, error: &ProviderError| {
                let wait_duration = next_delay
                    .map(humantime::format_duration)
                    .map(tracing::field::display);
                warn!(
                    attempt,
                    wait_duration,
                    error = error as &dyn std::error::Error,
                    "attempt to connect to the L1 node failed; retrying after backoff",
                );
                futures::future::ready(())
            },
        );

    let provider = tryhard::retry_fn(|| {
        let url = endpoint.to_string();
        async move {
            let websocket_client = Ws::connect_with_reconnects(url, 0).await?;
            Ok(Provider::new(websocket_client))
        }
    })
    .with_config(retry_config)
    .await
    .wrap_err("failed connecting to the L1 node after several retries; giving up")?;
    Ok(Arc::new(provider))
}

async fn watch_for_blocks(
    provider: Arc<Provider<Ws>>,
    contract_address: ethers::types::Address,
    events: mpsc::Sender<EventNotification>,
) -> Result<()> {
    let mut block_rx = provider
        .subscribe_blocks()
        .await
        .wrap_err("failed to subscribe to blocks")?;

    loop {
        let Some(block) = block_rx.next().await else {
            bail!("block subscription ended");
        };
        let Some(block_hash) = block.hash else {
            warn!("block without a hash; skipping");
            continue;
        };

        let logs = provider
            .get_logs(&Filter::new().address(contract_address).at_block_hash(block_hash))
            .await
            .wrap_err("failed to fetch the contract's logs")?;
        for log in logs {
            let Some(notification) = decode_log(provider.as_ref(), log).await? else {
                continue;
            };
            debug!(
                l1_block = notification.l1_block,
                removed = notification.removed,
                "forwarding a rollup event"
            );
            if events.send(notification).await.is_err() {
                bail!("orchestrator channel closed");
            }
        }
    }
}

/// Decodes a contract log into a notification; `None` for events this node
/// does not consume.
pub(crate) async fn decode_log(
    provider: &Provider<Ws>,
    log: Log,
) -> Result<Option<EventNotification>> {
    let Some(signature) = log.topics.first().copied() else {
        return Ok(None);
    };
    let event = if signature == topic("BlockProposed()") {
        Event::BlockProposed {
            calldata: transaction_calldata(provider, &log).await?,
        }
    } else if signature == topic("TransactionSubmitted()") {
        Event::TransactionSubmitted {
            calldata: transaction_calldata(provider, &log).await?,
        }
    } else if signature == topic("Rollback(uint256)") {
        let tokens = abi::decode(&[ParamType::Uint(256)], &log.data)
            .wrap_err("failed to decode Rollback data")?;
        let Some(Token::Uint(block_number_l2)) = tokens.into_iter().next() else {
            bail!("Rollback data decoded to an unexpected shape");
        };
        Event::Rollback {
            block_number_l2: block_number_l2.low_u64(),
        }
    } else if signature == topic("NewCurrentProposer(address)") {
        let tokens = abi::decode(&[ParamType::Address], &log.data)
            .wrap_err("failed to decode NewCurrentProposer data")?;
        let Some(Token::Address(proposer)) = tokens.into_iter().next() else {
            bail!("NewCurrentProposer data decoded to an unexpected shape");
        };
        Event::NewCurrentProposer {
            proposer,
        }
    } else if signature == topic("CommittedToChallenge(bytes32,address)") {
        let mut tokens = abi::decode(
            &[ParamType::FixedBytes(32), ParamType::Address],
            &log.data,
        )
        .wrap_err("failed to decode CommittedToChallenge data")?
        .into_iter();
        let (Some(Token::FixedBytes(commit_hash)), Some(Token::Address(sender))) =
            (tokens.next(), tokens.next())
        else {
            bail!("CommittedToChallenge data decoded to an unexpected shape");
        };
        Event::CommittedToChallenge {
            commit_hash: H256::from_slice(&commit_hash),
            sender,
        }
    } else {
        return Ok(None);
    };

    let l1_block = log
        .block_number
        .ok_or_else(|| eyre!("log is missing its block number"))?
        .as_u64();
    let l1_tx_index = log
        .transaction_index
        .ok_or_else(|| eyre!("log is missing its transaction index"))?
        .as_u64();
    let l1_tx_hash = log
        .transaction_hash
        .ok_or_else(|| eyre!("log is missing its transaction hash"))?;
    Ok(Some(EventNotification {
        event,
        l1_block,
        l1_tx_index,
        l1_tx_hash,
        removed: log.removed.unwrap_or(false),
    }))
}

/// The input of the transaction that emitted `log`, minus the selector.
async fn transaction_calldata(provider: &Provider<Ws>, log: &Log) -> Result<Vec<u8>> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| eyre!("log is missing its transaction hash"))?;
    let Some(transaction) = provider
        .get_transaction(tx_hash)
        .await
        .wrap_err("failed to fetch the emitting transaction")?
    else {
        bail!("transaction {tx_hash:#x} not found on the L1 node");
    };
    let input = transaction.input.to_vec();
    if input.len() < 4 {
        bail!("transaction {tx_hash:#x} has no calldata past the selector");
    }
    Ok(input[4..].to_vec())
}
