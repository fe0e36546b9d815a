use async_trait::async_trait;
use ethers::prelude::{Http, Middleware, Provider};
use ethers::types::{
    Address, Block, BlockNumber, Bytes, Filter, Log, TransactionReceipt, TransactionRequest, H256,
};
use std::sync::Arc;

use crate::error::{ForgeError, Result};

/// The slice of the JSON-RPC surface the pipeline depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// `None` when the block has not been produced yet.
    async fn block(&self, number: u64) -> Result<Option<Block<H256>>>;

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>>;
}

/// [`ChainClient`] over any ethers middleware stack.
pub struct EthersChainClient<M> {
    provider: Arc<M>,
}

impl<M: Middleware> EthersChainClient<M> {
    pub fn new(provider: Arc<M>) -> Self {
        Self { provider }
    }
}

impl EthersChainClient<Provider<Http>> {
    pub fn connect_http(url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| ForgeError::Config(format!("invalid rpc url '{}': {}", url, e)))?;
        Ok(Self::new(Arc::new(provider)))
    }
}

fn transport<E: std::fmt::Display>(e: E) -> ForgeError {
    ForgeError::Transport(e.to_string())
}

#[async_trait]
impl<M> ChainClient for EthersChainClient<M>
where
    M: Middleware + 'static,
{
    async fn block_number(&self) -> Result<u64> {
        let n = self.provider.get_block_number().await.map_err(transport)?;
        Ok(n.as_u64())
    }

    async fn block(&self, number: u64) -> Result<Option<Block<H256>>> {
        self.provider
            .get_block(BlockNumber::Number(number.into()))
            .await
            .map_err(transport)
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(transport)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::new().to(to).data(data);
        self.provider
            .call(&tx.into(), None)
            .await
            .map_err(transport)
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.provider.get_logs(filter).await.map_err(transport)
    }
}
