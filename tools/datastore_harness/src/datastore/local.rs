use crate::api_proxy::{Delegate, LogRecord};
use crate::datastore::store::{EntityStore, MemoryEntityStore, Partition, SqliteEntityStore};
use crate::datastore::wire::{
    self, BeginTransactionRequest, DeleteRequest, GetRequest, GetResponse, NextRequest,
    PutRequest, PutResponse, QueryResult, RunQueryRequest, TransactionRequest, VoidResponse,
    BEGIN_TRANSACTION, COMMIT, DATASTORE_PACKAGE, DELETE, GET, NEXT, PUT, ROLLBACK, RUN_QUERY,
};
use crate::datastore::{Entity, Key, KeyId, Transaction};
use crate::environment::Environment;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_QUERY_BATCH_SIZE: usize = 20;

#[derive(Debug)]
struct PendingTransaction {
    partition: Partition,
    entity_group: Option<Key>,
    puts: BTreeMap<Key, Entity>,
    deletes: BTreeSet<Key>,
}

impl PendingTransaction {
    /// Bind the transaction to the entity group shared by `keys`. The binding
    /// is untouched when any key falls outside that group.
    fn enlist<'a>(&mut self, keys: impl IntoIterator<Item = &'a Key>) -> Result<(), HarnessError> {
        let mut group = self.entity_group.clone();
        for key in keys {
            let root = key.root();
            let bound = group.get_or_insert_with(|| root.clone());
            if &*bound != root {
                return Err(HarnessError::Datastore(format!(
                    "can't operate on multiple entity groups in a single transaction. found both {bound} and {root}"
                )));
            }
        }
        self.entity_group = group;
        Ok(())
    }
}

struct LocalState {
    store: Box<dyn EntityStore>,
    next_id: i64,
    next_handle: u64,
    transactions: HashMap<u64, PendingTransaction>,
    cursors: HashMap<u64, VecDeque<Entity>>,
}

impl LocalState {
    fn transaction_mut(
        &mut self,
        txn: &Transaction,
    ) -> Result<&mut PendingTransaction, HarnessError> {
        self.transactions.get_mut(&txn.handle).ok_or_else(|| {
            HarnessError::Datastore(format!("transaction {} is not active", txn.handle))
        })
    }

    fn allocate_key(&mut self, mut key: Key) -> Result<Key, HarnessError> {
        if key.parent.as_deref().is_some_and(|parent| !parent.is_complete()) {
            return Err(HarnessError::Datastore(format!(
                "parent of {key} must be complete"
            )));
        }
        if key.id.is_none() {
            key.id = Some(KeyId::Id(self.next_id));
            self.next_id += 1;
        }
        Ok(key)
    }
}

/// In-process stand-in for the datastore backend.
pub struct LocalDatastoreDelegate {
    state: Mutex<LocalState>,
    query_batch_size: usize,
    logs: Mutex<Vec<LogRecord>>,
}

impl LocalDatastoreDelegate {
    pub fn new(store: Box<dyn EntityStore>) -> Self {
        Self {
            state: Mutex::new(LocalState {
                store,
                next_id: 1,
                next_handle: 1,
                transactions: HashMap::new(),
                cursors: HashMap::new(),
            }),
            query_batch_size: DEFAULT_QUERY_BATCH_SIZE,
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryEntityStore::new()))
    }

    pub fn sqlite_in_memory() -> Result<Self, HarnessError> {
        Ok(Self::new(Box::new(SqliteEntityStore::open_in_memory()?)))
    }

    pub fn with_query_batch_size(mut self, batch_size: usize) -> Self {
        self.query_batch_size = batch_size.max(1);
        self
    }

    pub fn logged_records(&self) -> Vec<LogRecord> {
        match self.logs.lock() {
            Ok(logs) => logs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn active_transaction_count(&self) -> Result<usize, HarnessError> {
        Ok(self.lock()?.transactions.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>, HarnessError> {
        self.state
            .lock()
            .map_err(|_| HarnessError::Datastore("local datastore state poisoned".to_string()))
    }

    fn get(&self, env: &Environment, request: GetRequest) -> Result<GetResponse, HarnessError> {
        let partition = partition_for(env);
        if let Some(key) = request.keys.iter().find(|key| !key.is_complete()) {
            return Err(HarnessError::Datastore(format!(
                "cannot get incomplete key {key}"
            )));
        }
        let mut state = self.lock()?;
        if let Some(txn) = &request.transaction {
            state.transaction_mut(txn)?.enlist(&request.keys)?;
        }
        let mut entities = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            entities.push(state.store.get(&partition, key)?);
        }
        Ok(GetResponse { entities })
    }

    fn put(&self, env: &Environment, request: PutRequest) -> Result<PutResponse, HarnessError> {
        let partition = partition_for(env);
        let mut state = self.lock()?;
        let mut entities = Vec::with_capacity(request.entities.len());
        for mut entity in request.entities {
            entity.key = state.allocate_key(entity.key)?;
            entities.push(entity);
        }
        let keys = entities.iter().map(|e| e.key.clone()).collect::<Vec<_>>();

        match &request.transaction {
            Some(txn) => {
                let pending = state.transaction_mut(txn)?;
                pending.enlist(&keys)?;
                for entity in entities {
                    pending.deletes.remove(&entity.key);
                    pending.puts.insert(entity.key.clone(), entity);
                }
            }
            None => state.store.apply(&partition, &entities, &[])?,
        }
        Ok(PutResponse { keys })
    }

    fn delete(&self, env: &Environment, request: DeleteRequest) -> Result<VoidResponse, HarnessError> {
        let partition = partition_for(env);
        let mut state = self.lock()?;
        match &request.transaction {
            Some(txn) => {
                let pending = state.transaction_mut(txn)?;
                pending.enlist(&request.keys)?;
                for key in request.keys {
                    pending.puts.remove(&key);
                    pending.deletes.insert(key);
                }
            }
            None => state.store.apply(&partition, &[], &request.keys)?,
        }
        Ok(VoidResponse {})
    }

    fn begin_transaction(
        &self,
        env: &Environment,
        _request: BeginTransactionRequest,
    ) -> Result<Transaction, HarnessError> {
        let mut state = self.lock()?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.transactions.insert(
            handle,
            PendingTransaction {
                partition: partition_for(env),
                entity_group: None,
                puts: BTreeMap::new(),
                deletes: BTreeSet::new(),
            },
        );
        Ok(Transaction {
            handle,
            app_id: env.app_id().to_string(),
        })
    }

    fn commit(&self, request: TransactionRequest) -> Result<VoidResponse, HarnessError> {
        let mut state = self.lock()?;
        let pending = state
            .transactions
            .remove(&request.transaction.handle)
            .ok_or_else(|| {
                HarnessError::Datastore(format!(
                    "transaction {} is not active",
                    request.transaction.handle
                ))
            })?;
        let puts = pending.puts.into_values().collect::<Vec<_>>();
        let deletes = pending.deletes.into_iter().collect::<Vec<_>>();
        state.store.apply(&pending.partition, &puts, &deletes)?;
        Ok(VoidResponse {})
    }

    fn rollback(&self, request: TransactionRequest) -> Result<VoidResponse, HarnessError> {
        let mut state = self.lock()?;
        state
            .transactions
            .remove(&request.transaction.handle)
            .ok_or_else(|| {
                HarnessError::Datastore(format!(
                    "transaction {} is not active",
                    request.transaction.handle
                ))
            })?;
        Ok(VoidResponse {})
    }

    fn run_query(
        &self,
        env: &Environment,
        request: RunQueryRequest,
    ) -> Result<QueryResult, HarnessError> {
        let partition = partition_for(env);
        let mut state = self.lock()?;
        if let Some(txn) = &request.transaction {
            let ancestor = request.query.ancestor.as_ref().ok_or_else(|| {
                HarnessError::Datastore(
                    "only ancestor queries are allowed inside transactions".to_string(),
                )
            })?;
            state.transaction_mut(txn)?.enlist([ancestor])?;
        }
        let mut matches = state
            .store
            .scan_kind(&partition, &request.query.kind)?
            .into_iter()
            .filter(|entity| request.query.matches(entity))
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| a.key.cmp(&b.key));

        let mut remaining = VecDeque::from(matches);
        let batch = take_batch(&mut remaining, request.count.unwrap_or(self.query_batch_size));
        if remaining.is_empty() {
            return Ok(QueryResult {
                cursor: None,
                entities: batch,
                more_results: false,
            });
        }
        let cursor = state.next_handle;
        state.next_handle += 1;
        state.cursors.insert(cursor, remaining);
        Ok(QueryResult {
            cursor: Some(cursor),
            entities: batch,
            more_results: true,
        })
    }

    fn next(&self, request: NextRequest) -> Result<QueryResult, HarnessError> {
        let mut state = self.lock()?;
        let remaining = state.cursors.get_mut(&request.cursor).ok_or_else(|| {
            HarnessError::Datastore(format!("cursor {} is not open", request.cursor))
        })?;
        let batch = take_batch(remaining, request.count.unwrap_or(self.query_batch_size));
        if remaining.is_empty() {
            state.cursors.remove(&request.cursor);
            return Ok(QueryResult {
                cursor: None,
                entities: batch,
                more_results: false,
            });
        }
        Ok(QueryResult {
            cursor: Some(request.cursor),
            entities: batch,
            more_results: true,
        })
    }
}

impl Default for LocalDatastoreDelegate {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Delegate for LocalDatastoreDelegate {
    fn make_sync_call(
        &self,
        env: &Environment,
        package: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, HarnessError> {
        if package != DATASTORE_PACKAGE {
            return Err(HarnessError::Datastore(format!(
                "no service registered for package {package}"
            )));
        }
        match method {
            GET => wire::encode(&self.get(env, wire::decode(request)?)?),
            PUT => wire::encode(&self.put(env, wire::decode(request)?)?),
            DELETE => wire::encode(&self.delete(env, wire::decode(request)?)?),
            BEGIN_TRANSACTION => wire::encode(&self.begin_transaction(env, wire::decode(request)?)?),
            COMMIT => wire::encode(&self.commit(wire::decode(request)?)?),
            ROLLBACK => wire::encode(&self.rollback(wire::decode(request)?)?),
            RUN_QUERY => wire::encode(&self.run_query(env, wire::decode(request)?)?),
            NEXT => wire::encode(&self.next(wire::decode(request)?)?),
            other => Err(HarnessError::Datastore(format!(
                "{package} has no method {other}"
            ))),
        }
    }

    fn log(&self, env: &Environment, record: &LogRecord) {
        append_run_log(
            record.level.as_str(),
            "local_datastore.app_log",
            json!({
                "app_id": env.app_id(),
                "timestamp_us": record.timestamp_us,
                "message": record.message,
            }),
        );
        match self.logs.lock() {
            Ok(mut logs) => logs.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }

    /// Reused across tests, so every teardown wipes entities, open
    /// transactions and cursors.
    fn tear_down(&self) -> Result<(), HarnessError> {
        let mut state = self.lock()?;
        let dangling = state.transactions.len();
        state.store.clear()?;
        state.transactions.clear();
        state.cursors.clear();
        append_run_log(
            "debug",
            "local_datastore.cleared",
            json!({
                "backend": state.store.backend_name(),
                "dropped_transactions": dangling,
            }),
        );
        Ok(())
    }
}

fn partition_for(env: &Environment) -> Partition {
    Partition::new(env.app_id(), env.namespace())
}

fn take_batch(remaining: &mut VecDeque<Entity>, count: usize) -> Vec<Entity> {
    let count = count.max(1).min(remaining.len());
    remaining.drain(..count).collect()
}
