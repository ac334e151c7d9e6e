//! Database registry (spec §3 "Database (db_context)").

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::store::LocalStore;

/// Outcome of a locally registered call function (spec §4.6 step 7).
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: i32,
    pub reply_data: Vec<u8>,
    pub new_value: Option<Vec<u8>>,
}

/// A client-registered call function: `(key, current value, call_data) ->
/// CallOutcome`. The registration RPC itself is out of core scope (spec
/// §1); this trait is the in-process table the call engine dispatches
/// through once a function is registered.
pub trait CallFunction: Send + Sync {
    fn invoke(&self, key: &[u8], value: &[u8], call_data: &[u8]) -> CallOutcome;
}

/// The default call function every attached database gets at `call_id`
/// zero: an empty `call_data` fetches the current value; a non-empty one
/// replaces it. Exercises the header bookkeeping paths without requiring
/// a client to register anything.
pub struct FetchStoreCall;

impl CallFunction for FetchStoreCall {
    fn invoke(&self, _key: &[u8], value: &[u8], call_data: &[u8]) -> CallOutcome {
        if call_data.is_empty() {
            CallOutcome { status: 0, reply_data: value.to_vec(), new_value: None }
        } else {
            CallOutcome { status: 0, reply_data: Vec::new(), new_value: Some(call_data.to_vec()) }
        }
    }
}

/// One attached database (spec §3 "Database (db_context)"). Non-persistent
/// databases are wiped at daemon startup; persistent ones survive restart
/// (spec §6.3) — that distinction is applied by the daemon at attach time,
/// not by this type.
pub struct Database {
    pub id: u32,
    pub name: String,
    pub persistent: bool,
    pub priority: u32,
    pub path: PathBuf,
    pub store: LocalStore,
    call_functions: DashMap<u32, Arc<dyn CallFunction>>,
}

impl Database {
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>, persistent: bool, priority: u32, path: PathBuf) -> Self {
        let db = Self {
            id,
            name: name.into(),
            persistent,
            priority,
            path,
            store: LocalStore::new(),
            call_functions: DashMap::new(),
        };
        db.call_functions.insert(0, Arc::new(FetchStoreCall));
        db
    }

    pub fn register_call(&self, call_id: u32, f: Arc<dyn CallFunction>) {
        self.call_functions.insert(call_id, f);
    }

    #[must_use]
    pub fn invoke_call(&self, call_id: u32, key: &[u8], value: &[u8], call_data: &[u8]) -> Option<CallOutcome> {
        self.call_functions.get(&call_id).map(|f| f.invoke(key, value, call_data))
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.store.in_transaction()
    }
}

/// Derives the wire `db_id` from a database name (spec §3 "32-bit id
/// derived from the database name").
#[must_use]
pub fn db_id_for_name(name: &str) -> u32 {
    ctdb_core::hash::fnv1a_hash(name.as_bytes())
}

/// Every database this daemon has attached.
pub struct Databases {
    by_id: DashMap<u32, Arc<Database>>,
}

impl Databases {
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: DashMap::new() }
    }

    pub fn attach(&self, db: Database) -> Arc<Database> {
        let db = Arc::new(db);
        self.by_id.insert(db.id, db.clone());
        db
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<Database>> {
        self.by_id.get(&id).map(|e| e.value().clone())
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Database>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for Databases {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_id_is_deterministic() {
        assert_eq!(db_id_for_name("locking.tdb"), db_id_for_name("locking.tdb"));
    }

    #[test]
    fn attach_and_get_roundtrips() {
        let dbs = Databases::new();
        let id = db_id_for_name("test.tdb");
        dbs.attach(Database::new(id, "test.tdb", false, 1, "/tmp/test.tdb".into()));
        assert!(dbs.get(id).is_some());
        assert_eq!(dbs.all().len(), 1);
    }

    #[test]
    fn default_call_function_fetches_and_stores() {
        let db = Database::new(1, "x", false, 1, "/tmp/x".into());
        let fetch = db.invoke_call(0, b"k", b"v", b"").unwrap();
        assert_eq!(fetch.reply_data, b"v");
        assert!(fetch.new_value.is_none());

        let store = db.invoke_call(0, b"k", b"v", b"new").unwrap();
        assert_eq!(store.new_value, Some(b"new".to_vec()));
    }
}
