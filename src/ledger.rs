use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::parse_abi;
use ethers::contract::BaseContract;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use serde::Serialize;
use tracing::debug;

use crate::config::SecretKey;
use crate::error::{LedgerError, RelayerError};
use crate::types::{EventKind, QueueItem, TxHash};

/// Human-readable ABI of the recording contract.
const RECORDER_ABI: &[&str] = &[
    "function recordReaction(uint256 x, uint256 y, uint256 energy, string entityId)",
    "function recordExplosion(string entityId)",
    "function totalReactions() view returns (uint256)",
    "function totalExplosions() view returns (uint256)",
];

/// A write call against the recording contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    RecordReaction {
        x: u32,
        y: u32,
        energy: u32,
        entity_id: String,
    },
    RecordExplosion {
        entity_id: String,
    },
}

impl LedgerCall {
    /// Select the contract function and argument shape for a queue item.
    pub fn from_item(item: &QueueItem) -> Result<Self, LedgerError> {
        match item.kind {
            EventKind::Reaction => Ok(LedgerCall::RecordReaction {
                x: item.payload.x,
                y: item.payload.y,
                energy: item.payload.energy,
                entity_id: item.entity_id.clone().unwrap_or_default(),
            }),
            EventKind::Explosion => match item.entity_id.as_deref() {
                Some(id) if !id.is_empty() => Ok(LedgerCall::RecordExplosion {
                    entity_id: id.to_string(),
                }),
                _ => Err(LedgerError::InvalidCall(format!(
                    "explosion item {} has no entity id",
                    item.id
                ))),
            },
        }
    }

    pub fn function_name(&self) -> &'static str {
        match self {
            LedgerCall::RecordReaction { .. } => "recordReaction",
            LedgerCall::RecordExplosion { .. } => "recordExplosion",
        }
    }
}

/// A simulated call, ready to be signed and broadcast
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub call: LedgerCall,
    pub tx: TypedTransaction,
}

/// Read-only counters exposed by the contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total_reactions: U256,
    pub total_explosions: U256,
}

/// Signing ledger client bound to a single wallet.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Address of the signing wallet
    fn signer(&self) -> Address;

    /// Dry-run the call; fails with `LedgerError::Simulation` when it would revert.
    async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerError>;

    /// Sign and broadcast; returns the transaction hash without waiting for inclusion.
    async fn submit(&self, request: PreparedRequest) -> Result<TxHash, LedgerError>;

    async fn stats(&self) -> Result<LedgerStats, LedgerError>;
}

/// ABI binding for the recording contract
#[derive(Debug, Clone)]
pub struct RecorderContract {
    address: Address,
    abi: BaseContract,
}

impl RecorderContract {
    pub fn new(address: Address) -> Result<Self, RelayerError> {
        let abi = parse_abi(RECORDER_ABI)
            .map_err(|e| RelayerError::Configuration(format!("recorder ABI: {e}")))?;
        Ok(Self {
            address,
            abi: BaseContract::from(abi),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn encode(&self, call: &LedgerCall) -> Result<Bytes, LedgerError> {
        let encoded = match call {
            LedgerCall::RecordReaction {
                x,
                y,
                energy,
                entity_id,
            } => self.abi.encode(
                call.function_name(),
                (
                    U256::from(*x),
                    U256::from(*y),
                    U256::from(*energy),
                    entity_id.clone(),
                ),
            ),
            LedgerCall::RecordExplosion { entity_id } => {
                self.abi.encode(call.function_name(), entity_id.clone())
            }
        };
        encoded.map_err(|e| LedgerError::InvalidCall(e.to_string()))
    }

    fn encode_view(&self, name: &str) -> Result<Bytes, LedgerError> {
        self.abi
            .encode(name, ())
            .map_err(|e| LedgerError::InvalidCall(e.to_string()))
    }

    fn decode_counter(&self, name: &str, output: Bytes) -> Result<U256, LedgerError> {
        self.abi
            .decode_output::<U256, _>(name, output)
            .map_err(|e| LedgerError::Simulation(format!("{name} output: {e}")))
    }
}

/// Signer middleware over a plain HTTP provider.
pub type SignerClient = ethers::middleware::SignerMiddleware<Provider<Http>, LocalWallet>;

/// `LedgerClient` over any ethers middleware stack
#[derive(Debug)]
pub struct EvmLedger<M> {
    client: Arc<M>,
    contract: RecorderContract,
    signer: Address,
    timeout: Duration,
}

impl<M: Middleware + 'static> EvmLedger<M> {
    pub fn new(client: Arc<M>, contract: RecorderContract, signer: Address, timeout: Duration) -> Self {
        Self {
            client,
            contract,
            signer,
            timeout,
        }
    }

    /// Await a ledger round-trip, classifying its error and bounding its duration.
    async fn bounded<T, E, F>(
        &self,
        operation: &str,
        fut: F,
        classify: fn(String) -> LedgerError,
    ) -> Result<T, LedgerError>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| classify(e.to_string())),
            Err(_) => Err(LedgerError::Timeout {
                operation: operation.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn read_counter(&self, name: &str) -> Result<U256, LedgerError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract.address())
            .data(self.contract.encode_view(name)?)
            .into();
        let output = self
            .bounded(name, self.client.call(&tx, None), LedgerError::Simulation)
            .await?;
        self.contract.decode_counter(name, output)
    }
}

impl EvmLedger<SignerClient> {
    /// Build a signing client for one wallet against an HTTP endpoint.
    pub fn connect(
        rpc_url: &str,
        key: &SecretKey,
        contract_address: &str,
        chain_id: u64,
        timeout: Duration,
    ) -> Result<Self, RelayerError> {
        let url = reqwest::Url::parse(rpc_url)
            .map_err(|e| RelayerError::Configuration(format!("invalid rpc url `{rpc_url}`: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayerError::Configuration(format!("http client: {e}")))?;
        let provider = Provider::new(Http::new_with_client(url, http));

        let wallet = key
            .expose()
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Configuration(format!("invalid private key: {e}")))?
            .with_chain_id(chain_id);
        let signer = wallet.address();

        let address = contract_address.parse::<Address>().map_err(|e| {
            RelayerError::Configuration(format!("invalid contract address `{contract_address}`: {e}"))
        })?;

        let client = Arc::new(SignerClient::new(provider, wallet));
        Ok(Self::new(client, RecorderContract::new(address)?, signer, timeout))
    }
}

#[async_trait]
impl<M: Middleware + 'static> LedgerClient for EvmLedger<M> {
    fn signer(&self) -> Address {
        self.signer
    }

    async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerError> {
        let data = self.contract.encode(call)?;
        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(self.signer)
            .to(self.contract.address())
            .data(data)
            .into();

        self.bounded("simulate", self.client.call(&tx, None), LedgerError::Simulation)
            .await?;
        let gas = self
            .bounded("estimate_gas", self.client.estimate_gas(&tx, None), LedgerError::Simulation)
            .await?;
        tx.set_gas(gas);

        debug!("Simulated {} from {:?}, gas {}", call.function_name(), self.signer, gas);
        Ok(PreparedRequest {
            call: call.clone(),
            tx,
        })
    }

    async fn submit(&self, request: PreparedRequest) -> Result<TxHash, LedgerError> {
        let pending = self
            .bounded(
                "submit",
                self.client.send_transaction(request.tx, None),
                LedgerError::Submission,
            )
            .await?;
        Ok(pending.tx_hash())
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        Ok(LedgerStats {
            total_reactions: self.read_counter("totalReactions").await?,
            total_explosions: self.read_counter("totalExplosions").await?,
        })
    }
}
