//! Request and response payloads for the `datastore_v3` RPCs, encoded as JSON
//! bytes on the delegate boundary.

use crate::datastore::{Entity, Key, Query, Transaction};
use crate::errors::HarnessError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DATASTORE_PACKAGE: &str = "datastore_v3";

pub const GET: &str = "Get";
pub const PUT: &str = "Put";
pub const DELETE: &str = "Delete";
pub const BEGIN_TRANSACTION: &str = "BeginTransaction";
pub const COMMIT: &str = "Commit";
pub const ROLLBACK: &str = "Rollback";
pub const RUN_QUERY: &str = "RunQuery";
pub const NEXT: &str = "Next";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub transaction: Option<Transaction>,
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    /// One slot per requested key, in request order.
    pub entities: Vec<Option<Entity>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    pub transaction: Option<Transaction>,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub transaction: Option<Transaction>,
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoidResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginTransactionRequest {
    pub app_id: String,
}

/// Body of both `Commit` and `Rollback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueryRequest {
    pub transaction: Option<Transaction>,
    pub query: Query,
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextRequest {
    pub cursor: u64,
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub cursor: Option<u64>,
    pub entities: Vec<Entity>,
    pub more_results: bool,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, HarnessError> {
    serde_json::to_vec(message).map_err(|e| HarnessError::Wire(format!("encode failed: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HarnessError> {
    serde_json::from_slice(bytes).map_err(|e| HarnessError::Wire(format!("decode failed: {e}")))
}
