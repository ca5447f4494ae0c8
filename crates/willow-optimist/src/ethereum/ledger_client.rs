//! [`Ledger`] backed by an L1 websocket provider.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::{
    abi::{
        self,
        ParamType,
        Token,
    },
    providers::{
        Middleware,
        Provider,
        Ws,
    },
    types::{
        transaction::eip2718::TypedTransaction,
        Address,
        Filter,
        TransactionRequest,
    },
    utils::keccak256,
};
use eyre::{
    bail,
    Result,
    WrapErr as _,
};
use willow_core::transaction::TransactionType;

use crate::{
    ethereum::watcher::decode_log,
    ledger::Ledger,
    orchestrator::EventNotification,
    verifier::VerificationKey,
};

pub struct LedgerClient {
    provider: Arc<Provider<Ws>>,
    contract_address: Address,
}

impl LedgerClient {
    #[must_use]
    pub fn new(provider: Arc<Provider<Ws>>, contract_address: Address) -> Self {
        Self {
            provider,
            contract_address,
        }
    }

    async fn call(&self, signature: &str, arguments: &[Token]) -> Result<Vec<u8>> {
        let hash = keccak256(signature.as_bytes());
        let mut data = hash[..4].to_vec();
        data.extend(abi::encode(arguments));
        let request: TypedTransaction = TransactionRequest::new()
            .to(self.contract_address)
            .data(data)
            .into();
        let returned = self
            .provider
            .call(&request, None)
            .await
            .wrap_err_with(|| format!("contract call {signature} failed"))?;
        Ok(returned.to_vec())
    }
}

#[async_trait]
impl Ledger for LedgerClient {
    async fn block_count_l2(&self) -> Result<u64> {
        let returned = self.call("getNumberOfL2Blocks()", &[]).await?;
        let tokens = abi::decode(&[ParamType::Uint(256)], &returned)
            .wrap_err("failed to decode the L2 block count")?;
        let Some(Token::Uint(count)) = tokens.into_iter().next() else {
            bail!("L2 block count decoded to an unexpected shape");
        };
        Ok(count.low_u64())
    }

    async fn current_proposer(&self) -> Result<Address> {
        let returned = self.call("currentProposer()", &[]).await?;
        let tokens = abi::decode(&[ParamType::Address], &returned)
            .wrap_err("failed to decode the current proposer")?;
        let Some(Token::Address(proposer)) = tokens.into_iter().next() else {
            bail!("current proposer decoded to an unexpected shape");
        };
        Ok(proposer)
    }

    async fn verification_key(
        &self,
        transaction_type: TransactionType,
    ) -> Result<VerificationKey> {
        let returned = self
            .call(
                "getVerificationKey(uint256)",
                &[Token::Uint(transaction_type.as_u64().into())],
            )
            .await?;
        let tokens = abi::decode(
            &[ParamType::Array(Box::new(ParamType::Uint(256)))],
            &returned,
        )
        .wrap_err("failed to decode the verification key")?;
        let Some(Token::Array(elements)) = tokens.into_iter().next() else {
            bail!("verification key decoded to an unexpected shape");
        };
        let mut key = Vec::with_capacity(elements.len());
        for element in elements {
            let Token::Uint(word) = element else {
                bail!("verification key element decoded to an unexpected shape");
            };
            key.push(word);
        }
        Ok(VerificationKey(key))
    }

    async fn latest_l1_block(&self) -> Result<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .wrap_err("failed to read the L1 head")?
            .as_u64())
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<EventNotification>> {
        let logs = self
            .provider
            .get_logs(
                &Filter::new()
                    .address(self.contract_address)
                    .from_block(from)
                    .to_block(to),
            )
            .await
            .wrap_err("failed to fetch historical logs")?;
        let mut notifications = Vec::new();
        for log in logs {
            if let Some(notification) = decode_log(self.provider.as_ref(), log).await? {
                notifications.push(notification);
            }
        }
        notifications.sort_by_key(|n| (n.l1_block, n.l1_tx_index));
        Ok(notifications)
    }
}
