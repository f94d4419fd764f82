use crate::api_proxy::ApiProxy;
use crate::datastore::wire::{
    self, BeginTransactionRequest, DeleteRequest, GetRequest, GetResponse, NextRequest,
    PutRequest, PutResponse, QueryResult, RunQueryRequest, TransactionRequest, VoidResponse,
    DATASTORE_PACKAGE,
};
use crate::datastore::{Entity, Key, Query, Transaction};
use crate::environment::require_environment;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// One invocation of the service API, with owned arguments so decorators can
/// inspect, record and forward it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ServiceCall {
    Get {
        transaction: Option<Transaction>,
        key: Key,
    },
    GetMany {
        transaction: Option<Transaction>,
        keys: Vec<Key>,
    },
    Put {
        transaction: Option<Transaction>,
        entity: Entity,
    },
    PutMany {
        transaction: Option<Transaction>,
        entities: Vec<Entity>,
    },
    Delete {
        transaction: Option<Transaction>,
        keys: Vec<Key>,
    },
    BeginTransaction,
    GetCurrentTransaction,
    GetActiveTransactions,
    Commit {
        transaction: Transaction,
    },
    Rollback {
        transaction: Transaction,
    },
    Prepare {
        transaction: Option<Transaction>,
        query: Query,
    },
}

impl ServiceCall {
    /// Method name as seen by interceptors. Single and list variants of an
    /// operation share a name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } | Self::GetMany { .. } => "get",
            Self::Put { .. } | Self::PutMany { .. } => "put",
            Self::Delete { .. } => "delete",
            Self::BeginTransaction => "beginTransaction",
            Self::GetCurrentTransaction => "getCurrentTransaction",
            Self::GetActiveTransactions => "getActiveTransactions",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
            Self::Prepare { .. } => "prepare",
        }
    }

    /// True for the list-argument variants.
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            Self::GetMany { .. } | Self::PutMany { .. } | Self::Delete { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReply {
    Entity(Entity),
    EntityMap(BTreeMap<Key, Entity>),
    Entities(Vec<Entity>),
    Key(Key),
    Keys(Vec<Key>),
    Transaction(Transaction),
    CurrentTransaction(Option<Transaction>),
    Transactions(Vec<Transaction>),
    Unit,
}

fn unexpected(method: &str, reply: &ServiceReply) -> HarnessError {
    HarnessError::Datastore(format!("unexpected reply to {method}: {reply:?}"))
}

/// Typed datastore API.
///
/// Implementors provide `call`; the typed methods build a `ServiceCall`,
/// dispatch it and unpack the reply. Decorators only override `call`.
pub trait DatastoreService: Send + Sync {
    fn call(&self, call: ServiceCall) -> Result<ServiceReply, HarnessError>;

    fn get(&self, transaction: Option<&Transaction>, key: &Key) -> Result<Entity, HarnessError> {
        match self.call(ServiceCall::Get {
            transaction: transaction.cloned(),
            key: key.clone(),
        })? {
            ServiceReply::Entity(entity) => Ok(entity),
            other => Err(unexpected("get", &other)),
        }
    }

    /// Missing keys are absent from the returned map.
    fn get_many(
        &self,
        transaction: Option<&Transaction>,
        keys: &[Key],
    ) -> Result<BTreeMap<Key, Entity>, HarnessError> {
        match self.call(ServiceCall::GetMany {
            transaction: transaction.cloned(),
            keys: keys.to_vec(),
        })? {
            ServiceReply::EntityMap(entities) => Ok(entities),
            other => Err(unexpected("get", &other)),
        }
    }

    fn put(&self, transaction: Option<&Transaction>, entity: Entity) -> Result<Key, HarnessError> {
        match self.call(ServiceCall::Put {
            transaction: transaction.cloned(),
            entity,
        })? {
            ServiceReply::Key(key) => Ok(key),
            other => Err(unexpected("put", &other)),
        }
    }

    fn put_many(
        &self,
        transaction: Option<&Transaction>,
        entities: Vec<Entity>,
    ) -> Result<Vec<Key>, HarnessError> {
        match self.call(ServiceCall::PutMany {
            transaction: transaction.cloned(),
            entities,
        })? {
            ServiceReply::Keys(keys) => Ok(keys),
            other => Err(unexpected("put", &other)),
        }
    }

    fn delete(&self, transaction: Option<&Transaction>, keys: &[Key]) -> Result<(), HarnessError> {
        match self.call(ServiceCall::Delete {
            transaction: transaction.cloned(),
            keys: keys.to_vec(),
        })? {
            ServiceReply::Unit => Ok(()),
            other => Err(unexpected("delete", &other)),
        }
    }

    fn begin_transaction(&self) -> Result<Transaction, HarnessError> {
        match self.call(ServiceCall::BeginTransaction)? {
            ServiceReply::Transaction(txn) => Ok(txn),
            other => Err(unexpected("beginTransaction", &other)),
        }
    }

    /// Most recently begun transaction that is still open.
    fn current_transaction(&self) -> Result<Option<Transaction>, HarnessError> {
        match self.call(ServiceCall::GetCurrentTransaction)? {
            ServiceReply::CurrentTransaction(txn) => Ok(txn),
            other => Err(unexpected("getCurrentTransaction", &other)),
        }
    }

    fn active_transactions(&self) -> Result<Vec<Transaction>, HarnessError> {
        match self.call(ServiceCall::GetActiveTransactions)? {
            ServiceReply::Transactions(txns) => Ok(txns),
            other => Err(unexpected("getActiveTransactions", &other)),
        }
    }

    fn commit(&self, transaction: &Transaction) -> Result<(), HarnessError> {
        match self.call(ServiceCall::Commit {
            transaction: transaction.clone(),
        })? {
            ServiceReply::Unit => Ok(()),
            other => Err(unexpected("commit", &other)),
        }
    }

    fn rollback(&self, transaction: &Transaction) -> Result<(), HarnessError> {
        match self.call(ServiceCall::Rollback {
            transaction: transaction.clone(),
        })? {
            ServiceReply::Unit => Ok(()),
            other => Err(unexpected("rollback", &other)),
        }
    }

    /// Run `query` to completion and return every matching entity.
    fn prepare(
        &self,
        transaction: Option<&Transaction>,
        query: Query,
    ) -> Result<Vec<Entity>, HarnessError> {
        match self.call(ServiceCall::Prepare {
            transaction: transaction.cloned(),
            query,
        })? {
            ServiceReply::Entities(entities) => Ok(entities),
            other => Err(unexpected("prepare", &other)),
        }
    }
}

/// Service API implemented by issuing `datastore_v3` RPCs through an
/// `ApiProxy`. Tracks the transactions it has begun.
pub struct RpcDatastoreService {
    proxy: ApiProxy,
    transactions: Mutex<Vec<Transaction>>,
    query_batch_size: Option<usize>,
}

impl RpcDatastoreService {
    pub fn new(proxy: ApiProxy) -> Self {
        Self {
            proxy,
            transactions: Mutex::new(Vec::new()),
            query_batch_size: None,
        }
    }

    pub fn with_query_batch_size(mut self, batch_size: usize) -> Self {
        self.query_batch_size = Some(batch_size);
        self
    }

    fn transactions(&self) -> MutexGuard<'_, Vec<Transaction>> {
        match self.transactions.lock() {
            Ok(txns) => txns,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn forget(&self, transaction: &Transaction) {
        self.transactions()
            .retain(|open| open.handle != transaction.handle);
    }

    fn rpc<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<Resp, HarnessError> {
        let bytes = self
            .proxy
            .make_sync_call(DATASTORE_PACKAGE, method, &wire::encode(request)?)?;
        wire::decode(&bytes)
    }

    fn get_keys(
        &self,
        transaction: Option<Transaction>,
        keys: Vec<Key>,
    ) -> Result<Vec<(Key, Option<Entity>)>, HarnessError> {
        let response: GetResponse = self.rpc(
            wire::GET,
            &GetRequest {
                transaction,
                keys: keys.clone(),
            },
        )?;
        if response.entities.len() != keys.len() {
            return Err(HarnessError::Datastore(format!(
                "get returned {} results for {} keys",
                response.entities.len(),
                keys.len()
            )));
        }
        Ok(keys.into_iter().zip(response.entities).collect())
    }

    fn put_entities(
        &self,
        transaction: Option<Transaction>,
        entities: Vec<Entity>,
    ) -> Result<Vec<Key>, HarnessError> {
        let response: PutResponse = self.rpc(
            wire::PUT,
            &PutRequest {
                transaction,
                entities,
            },
        )?;
        Ok(response.keys)
    }

    fn run_query(
        &self,
        transaction: Option<Transaction>,
        query: Query,
    ) -> Result<Vec<Entity>, HarnessError> {
        let mut page: QueryResult = self.rpc(
            wire::RUN_QUERY,
            &RunQueryRequest {
                transaction,
                query,
                count: self.query_batch_size,
            },
        )?;
        let mut entities = std::mem::take(&mut page.entities);
        while page.more_results {
            let cursor = page.cursor.ok_or_else(|| {
                HarnessError::Datastore("query reported more results without a cursor".to_string())
            })?;
            page = self.rpc(
                wire::NEXT,
                &NextRequest {
                    cursor,
                    count: self.query_batch_size,
                },
            )?;
            entities.append(&mut page.entities);
        }
        Ok(entities)
    }
}

impl DatastoreService for RpcDatastoreService {
    fn call(&self, call: ServiceCall) -> Result<ServiceReply, HarnessError> {
        match call {
            ServiceCall::Get { transaction, key } => {
                let mut found = self.get_keys(transaction, vec![key.clone()])?;
                match found.pop().and_then(|(_, entity)| entity) {
                    Some(entity) => Ok(ServiceReply::Entity(entity)),
                    None => Err(HarnessError::EntityNotFound(key.to_string())),
                }
            }
            ServiceCall::GetMany { transaction, keys } => Ok(ServiceReply::EntityMap(
                self.get_keys(transaction, keys)?
                    .into_iter()
                    .filter_map(|(key, entity)| entity.map(|entity| (key, entity)))
                    .collect(),
            )),
            ServiceCall::Put {
                transaction,
                entity,
            } => {
                let mut keys = self.put_entities(transaction, vec![entity])?;
                keys.pop()
                    .map(ServiceReply::Key)
                    .ok_or_else(|| HarnessError::Datastore("put returned no key".to_string()))
            }
            ServiceCall::PutMany {
                transaction,
                entities,
            } => Ok(ServiceReply::Keys(self.put_entities(transaction, entities)?)),
            ServiceCall::Delete { transaction, keys } => {
                let _: VoidResponse = self.rpc(wire::DELETE, &DeleteRequest { transaction, keys })?;
                Ok(ServiceReply::Unit)
            }
            ServiceCall::BeginTransaction => {
                let env = require_environment()?;
                let txn: Transaction = self.rpc(
                    wire::BEGIN_TRANSACTION,
                    &BeginTransactionRequest {
                        app_id: env.app_id().to_string(),
                    },
                )?;
                self.transactions().push(txn.clone());
                append_run_log(
                    "debug",
                    "datastore_service.transaction.begin",
                    json!({ "handle": txn.handle, "app_id": txn.app_id }),
                );
                Ok(ServiceReply::Transaction(txn))
            }
            ServiceCall::GetCurrentTransaction => Ok(ServiceReply::CurrentTransaction(
                self.transactions().last().cloned(),
            )),
            ServiceCall::GetActiveTransactions => {
                Ok(ServiceReply::Transactions(self.transactions().clone()))
            }
            ServiceCall::Commit { transaction } => {
                // A failed commit leaves the transaction open for rollback.
                let _: VoidResponse = self.rpc(
                    wire::COMMIT,
                    &TransactionRequest {
                        transaction: transaction.clone(),
                    },
                )?;
                self.forget(&transaction);
                Ok(ServiceReply::Unit)
            }
            ServiceCall::Rollback { transaction } => {
                let result: Result<VoidResponse, HarnessError> = self.rpc(
                    wire::ROLLBACK,
                    &TransactionRequest {
                        transaction: transaction.clone(),
                    },
                );
                self.forget(&transaction);
                result.map(|_| ServiceReply::Unit)
            }
            ServiceCall::Prepare { transaction, query } => {
                Ok(ServiceReply::Entities(self.run_query(transaction, query)?))
            }
        }
    }
}

/// Slot holding the active service handle. Clones share the slot.
#[derive(Clone, Default)]
pub struct DatastoreServiceFactory {
    active: Arc<RwLock<Option<Arc<dyn DatastoreService>>>>,
}

impl DatastoreServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `service`, returning the handle it replaced.
    pub fn set_service(
        &self,
        service: Arc<dyn DatastoreService>,
    ) -> Option<Arc<dyn DatastoreService>> {
        match self.active.write() {
            Ok(mut slot) => slot.replace(service),
            Err(poisoned) => poisoned.into_inner().replace(service),
        }
    }

    pub fn clear_service(&self) -> Option<Arc<dyn DatastoreService>> {
        match self.active.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn DatastoreService>> {
        match self.active.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn service(&self) -> Result<Arc<dyn DatastoreService>, HarnessError> {
        self.current().ok_or(HarnessError::NoService)
    }
}
