//! Capability traits for the external collaborators §9 calls "duck-typed":
//! `blocks`, `transactions`, `dapps`, `delegates`, `multisignatures`,
//! `system`, `logic.block`, `logic.transaction`. Each trait names only
//! the methods the transport layer actually calls; the domain logic
//! behind them is out of scope for this crate.

use async_trait::async_trait;
use serde_json::Value;

/// `logic.block.objectNormalize` / `logic.transaction.objectNormalize`:
/// structural validation of a wire object before it enters the chain.
#[async_trait]
pub trait ObjectNormalize: Send + Sync {
    async fn normalize_block(&self, raw: Value) -> Result<Value, String>;
    async fn normalize_transaction(&self, raw: Value) -> Result<Value, String>;
}

/// `blocks` / `transactions`: read access to chain + mempool state, and
/// the entry points inbound gossip feeds into.
#[async_trait]
pub trait ChainState: Send + Sync {
    async fn height(&self) -> u32;
    async fn common_block(&self, ids: &[i64]) -> Option<Value>;
    async fn load_blocks_after(&self, last_block_id: Option<i64>, limit: usize) -> Vec<Value>;
    async fn unconfirmed_transactions(&self) -> Vec<Value>;
    async fn receive_block(&self, block: Value);
    async fn receive_transactions(&self, txs: Vec<Value>) -> Result<(), String>;
}

/// `multisignatures.processSignature`.
#[async_trait]
pub trait Multisignatures: Send + Sync {
    async fn process_signature(&self, signature: Value) -> Result<(), String>;
    async fn gathered_signatures(&self) -> Vec<Value>;
}

/// `dapps.message` / `dapps.request`.
#[async_trait]
pub trait Dapps: Send + Sync {
    async fn message(&self, dappid: &str, body: Value) -> Result<(), String>;
    async fn request(
        &self,
        dappid: &str,
        method: &str,
        path: &str,
        query: Value,
    ) -> Result<Value, String>;
}

/// `delegates.enableForging`.
#[async_trait]
pub trait Delegates: Send + Sync {
    async fn enable_forging(&self);
}

/// A collaborator bundle with no real backing domain logic, used in
/// tests and as a starting point for wiring a real node.
pub struct NoopCollaborators;

#[async_trait]
impl ObjectNormalize for NoopCollaborators {
    async fn normalize_block(&self, raw: Value) -> Result<Value, String> {
        Ok(raw)
    }
    async fn normalize_transaction(&self, raw: Value) -> Result<Value, String> {
        Ok(raw)
    }
}

#[async_trait]
impl ChainState for NoopCollaborators {
    async fn height(&self) -> u32 {
        0
    }
    async fn common_block(&self, _ids: &[i64]) -> Option<Value> {
        None
    }
    async fn load_blocks_after(&self, _last_block_id: Option<i64>, _limit: usize) -> Vec<Value> {
        Vec::new()
    }
    async fn unconfirmed_transactions(&self) -> Vec<Value> {
        Vec::new()
    }
    async fn receive_block(&self, _block: Value) {}
    async fn receive_transactions(&self, _txs: Vec<Value>) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait]
impl Multisignatures for NoopCollaborators {
    async fn process_signature(&self, _signature: Value) -> Result<(), String> {
        Ok(())
    }
    async fn gathered_signatures(&self) -> Vec<Value> {
        Vec::new()
    }
}

#[async_trait]
impl Dapps for NoopCollaborators {
    async fn message(&self, _dappid: &str, _body: Value) -> Result<(), String> {
        Ok(())
    }
    async fn request(
        &self,
        _dappid: &str,
        _method: &str,
        _path: &str,
        _query: Value,
    ) -> Result<Value, String> {
        Ok(Value::Null)
    }
}

#[async_trait]
impl Delegates for NoopCollaborators {
    async fn enable_forging(&self) {}
}
