use figment::{
    providers::Env,
    Figment,
};
use serde::{
    Deserialize,
    Serialize,
};

/// The single config for creating a willow-optimist service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The websocket endpoint of the L1 node.
    pub ethereum_ws_endpoint: String,
    /// The address of the rollup ledger contract on L1.
    pub ledger_contract_address: String,
    /// The L1 address this node signs with.
    pub node_address: String,
    /// Set to true to commit to and reveal challenges against bad blocks.
    pub is_challenger: bool,
    /// The maximum number of transactions packed into an assembled block.
    pub transactions_per_block: usize,
    /// How often the assembler looks at the mempool, in milliseconds.
    pub block_assembly_interval_ms: u64,
    /// The L1 block the ledger contract was deployed at; event replay never
    /// reaches further back.
    pub start_l1_block: u64,
    pub log: String,
}

impl Config {
    const PREFIX: &'static str = "WILLOW_OPTIMIST_";

    /// Reads the config from `WILLOW_OPTIMIST_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is missing or fails to parse.
    pub fn from_env() -> Result<Self, figment::Error> {
        Self::from_env_with_prefix(Self::PREFIX)
    }

    fn from_env_with_prefix(prefix: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Env::prefixed("RUST_").split("_").only(&["log"]))
            .merge(Env::prefixed(prefix))
            .extract()
    }
}
