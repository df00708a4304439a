//! C5 — Executor Registry.
//!
//! Map of database-name -> executor. Ground:
//! `multi_database_executor.py::MultiDatabaseExecutorManager`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::GatewayError;
use crate::executor::DatabaseExecutor;
use crate::model::{AccessPolicy, DatabaseIdentity, DatabaseInfo};

pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<DatabaseExecutor>>>,
    insertion_order: RwLock<Vec<String>>,
    default_database: RwLock<Option<String>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            insertion_order: RwLock::new(Vec::new()),
            default_database: RwLock::new(None),
        }
    }

    pub fn set_default_database(&self, name: impl Into<String>) {
        *self.default_database.write().expect("registry lock poisoned") = Some(name.into());
    }

    /// `add(identity, max_execution_time)` initializes and inserts. Adding
    /// an existing name is a configuration error, surfaced before the
    /// server starts accepting requests.
    pub async fn add(
        &self,
        identity: DatabaseIdentity,
        policy: Option<AccessPolicy>,
    ) -> Result<(), GatewayError> {
        {
            let executors = self.executors.read().expect("registry lock poisoned");
            if executors.contains_key(&identity.name) {
                return Err(GatewayError::internal(format!(
                    "database '{}' is already registered",
                    identity.name
                )));
            }
        }

        let executor = DatabaseExecutor::initialize(identity, policy).await?;
        let name = executor.name().to_string();
        self.executors
            .write()
            .expect("registry lock poisoned")
            .insert(name.clone(), Arc::new(executor));
        self.insertion_order.write().expect("registry lock poisoned").push(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DatabaseExecutor>> {
        self.executors
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .executors
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// `close_all()` is idempotent: closing an already-closed executor is a
    /// no-op (spec.md §8).
    pub async fn close_all(&self) {
        let executors: Vec<Arc<DatabaseExecutor>> = self
            .executors
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for executor in executors {
            executor.close().await;
        }
    }

    pub fn info(&self, name: &str) -> Option<DatabaseInfo> {
        self.get(name).map(|e| e.info())
    }

    /// Default-database resolution: explicit caller override -> configured
    /// default -> first registered, in that order (spec.md §4.5).
    pub fn resolve_default(&self, explicit: Option<&str>) -> Result<String, GatewayError> {
        if let Some(name) = explicit {
            if self.get(name).is_none() {
                return Err(GatewayError::unknown_database(name, &self.list()));
            }
            return Ok(name.to_string());
        }

        if let Some(name) = self.default_database.read().expect("registry lock poisoned").clone() {
            if self.get(&name).is_some() {
                return Ok(name);
            }
        }

        self.insertion_order
            .read()
            .expect("registry lock poisoned")
            .first()
            .cloned()
            .ok_or_else(|| GatewayError::unknown_database("<none>", &[]))
    }
}
