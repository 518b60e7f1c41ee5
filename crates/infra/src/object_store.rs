//! Blob storage for job inputs and outputs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use warden_core::ObjectRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub size: usize,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("object storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object.
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ObjectRef, ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError>;
}

#[async_trait]
impl<O> ObjectStore for Arc<O>
where
    O: ObjectStore + ?Sized,
{
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ObjectRef, ObjectStoreError> {
        (**self).put(key, content_type, bytes).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        (**self).get(key).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> ObjectStoreError {
    ObjectStoreError::Storage("object store lock poisoned".to_string())
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ObjectRef, ObjectStoreError> {
        let reference = ObjectRef::object(key);
        reference
            .validate()
            .map_err(|e| ObjectStoreError::Invalid(e.to_string()))?;
        if content_type.trim().is_empty() {
            return Err(ObjectStoreError::Invalid(
                "content type is required".to_string(),
            ));
        }

        let object = StoredObject {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len(),
            bytes,
            stored_at: Utc::now(),
        };
        self.objects
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), object);

        Ok(reference)
    }

    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        self.objects
            .read()
            .map_err(poisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}
