//! In-process versioned object store.
//!
//! An arena of records keyed by kind and name. Every write bumps a
//! store-wide revision that becomes the object's `resource_version`; updates
//! must carry the version they were based on and are rejected with
//! [`StoreError::Conflict`] otherwise. Writers coordinate only through these
//! compare-and-swap writes.
//!
//! Spec and status are written separately: [`Store::replace`] never changes
//! status and [`Store::replace_status`] never changes spec or metadata.

mod error;

pub(crate) use error::StoreError;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

use crate::resources::{
    Kind, ObjectMeta, Resource, Sandbox, SandboxClaim, SandboxTemplate, SandboxWarmPool,
};
use crate::state::StateSnapshot;

const WATCH_CAPACITY: usize = 1024;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// A change notification. Carries the metadata of the object as written
/// (or as last seen, for deletions).
#[derive(Debug, Clone)]
pub(crate) struct WatchEvent {
    pub kind: Kind,
    pub action: WatchAction,
    pub meta: ObjectMeta,
}

type Table<T> = BTreeMap<String, T>;

/// Per-kind record tables.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    templates: Table<SandboxTemplate>,
    pools: Table<SandboxWarmPool>,
    claims: Table<SandboxClaim>,
    sandboxes: Table<Sandbox>,
}

/// A resource kind the store keeps a table for.
pub(crate) trait Stored: Resource {
    fn table(tables: &Tables) -> &Table<Self>;
    fn table_mut(tables: &mut Tables) -> &mut Table<Self>;
}

macro_rules! impl_stored {
    ($ty:ty, $field:ident) => {
        impl Stored for $ty {
            fn table(tables: &Tables) -> &Table<Self> {
                &tables.$field
            }
            fn table_mut(tables: &mut Tables) -> &mut Table<Self> {
                &mut tables.$field
            }
        }
    };
}

impl_stored!(SandboxTemplate, templates);
impl_stored!(SandboxWarmPool, pools);
impl_stored!(SandboxClaim, claims);
impl_stored!(Sandbox, sandboxes);

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    last_created: Option<DateTime<Utc>>,
    tables: Tables,
    injected: VecDeque<StoreError>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Creation timestamps are strictly increasing so that age ordering is
    /// total even for objects created in the same clock tick.
    fn next_creation_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_created {
            Some(last) if now <= last => last + chrono::Duration::nanoseconds(1),
            _ => now,
        };
        self.last_created = Some(ts);
        ts
    }
}

/// The object store. Shared between workers behind an `Arc`.
#[derive(Debug)]
pub(crate) struct Store {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
    latency: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            latency: Duration::ZERO,
        }
    }

    /// Adds a fixed delay before every call, as a remote API would have.
    /// Widens race windows in tests.
    #[cfg(test)]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Subscribes to change notifications.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Makes the next call fail with `err`.
    #[cfg(test)]
    pub fn inject_failure(&self, err: StoreError) {
        self.lock().injected.push_back(err);
    }

    /// Creates `obj`, assigning uid, version, generation and creation time.
    pub async fn create<T: Stored>(&self, mut obj: T) -> Result<T, StoreError> {
        self.round_trip().await;
        let mut inner = self.begin()?;

        let name = obj.name().to_string();
        if name.is_empty() {
            return Err(StoreError::invalid(T::KIND, "name must not be empty"));
        }
        if T::table(&inner.tables).contains_key(&name) {
            return Err(StoreError::already_exists(T::KIND, name));
        }

        let revision = inner.next_revision();
        let created = inner.next_creation_timestamp();
        let meta = obj.meta_mut();
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.resource_version = revision;
        meta.generation = 1;
        meta.creation_timestamp = Some(created);

        T::table_mut(&mut inner.tables).insert(name, obj.clone());
        drop(inner);

        self.publish(T::KIND, WatchAction::Added, obj.meta());
        Ok(obj)
    }

    /// Reads one object.
    pub async fn get<T: Stored>(&self, name: &str) -> Result<T, StoreError> {
        self.round_trip().await;
        let inner = self.begin()?;
        T::table(&inner.tables)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(T::KIND, name))
    }

    /// Lists every object of a kind, ordered by name.
    pub async fn list<T: Stored>(&self) -> Result<Vec<T>, StoreError> {
        self.round_trip().await;
        let inner = self.begin()?;
        Ok(T::table(&inner.tables).values().cloned().collect())
    }

    /// Replaces spec and metadata, conditional on `obj`'s resource version.
    ///
    /// Status is kept from the stored copy. `generation` is bumped when the
    /// spec changed. A write that changes nothing is not a write: the stored
    /// object is returned unchanged.
    pub async fn replace<T: Stored>(&self, obj: &T) -> Result<T, StoreError> {
        self.round_trip().await;
        let mut inner = self.begin()?;

        let stored = Self::current::<T>(&inner, obj)?;
        let spec_changed = stored.spec() != obj.spec();
        let meta_changed = stored.meta().labels != obj.meta().labels
            || stored.meta().annotations != obj.meta().annotations
            || stored.meta().owner != obj.meta().owner;
        if !spec_changed && !meta_changed {
            return Ok(stored);
        }

        let mut updated = obj.clone();
        *updated.status_mut() = stored.status().clone();
        {
            let meta = updated.meta_mut();
            meta.uid.clone_from(&stored.meta().uid);
            meta.creation_timestamp = stored.meta().creation_timestamp;
            meta.generation = stored.meta().generation + u64::from(spec_changed);
        }
        updated.meta_mut().resource_version = inner.next_revision();

        T::table_mut(&mut inner.tables).insert(updated.name().to_string(), updated.clone());
        drop(inner);

        self.publish(T::KIND, WatchAction::Modified, updated.meta());
        Ok(updated)
    }

    /// Replaces status, conditional on `obj`'s resource version.
    ///
    /// Spec and metadata are kept from the stored copy. Writing an identical
    /// status is a no-op.
    pub async fn replace_status<T: Stored>(&self, obj: &T) -> Result<T, StoreError> {
        self.round_trip().await;
        let mut inner = self.begin()?;

        let stored = Self::current::<T>(&inner, obj)?;
        if stored.status() == obj.status() {
            return Ok(stored);
        }

        let mut updated = stored;
        *updated.status_mut() = obj.status().clone();
        updated.meta_mut().resource_version = inner.next_revision();

        T::table_mut(&mut inner.tables).insert(updated.name().to_string(), updated.clone());
        drop(inner);

        trace!(kind = %T::KIND, name = %updated.name(), version = updated.meta().resource_version, "status written");
        self.publish(T::KIND, WatchAction::Modified, updated.meta());
        Ok(updated)
    }

    /// Deletes an object, optionally conditional on its resource version.
    pub async fn delete<T: Stored>(
        &self,
        name: &str,
        expected_version: Option<u64>,
    ) -> Result<T, StoreError> {
        self.round_trip().await;
        let mut inner = self.begin()?;

        let table = T::table_mut(&mut inner.tables);
        let actual = table
            .get(name)
            .map(|o| o.meta().resource_version)
            .ok_or_else(|| StoreError::not_found(T::KIND, name))?;
        if let Some(expected) = expected_version {
            if expected != actual {
                return Err(StoreError::conflict(T::KIND, name, expected, actual));
            }
        }
        let removed = table
            .remove(name)
            .ok_or_else(|| StoreError::not_found(T::KIND, name))?;
        inner.next_revision();
        drop(inner);

        self.publish(T::KIND, WatchAction::Deleted, removed.meta());
        Ok(removed)
    }

    /// Copies every object for persistence or display.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            written_at: Utc::now(),
            revision: inner.revision,
            templates: inner.tables.templates.values().cloned().collect(),
            pools: inner.tables.pools.values().cloned().collect(),
            claims: inner.tables.claims.values().cloned().collect(),
            sandboxes: inner.tables.sandboxes.values().cloned().collect(),
        }
    }

    fn current<T: Stored>(inner: &Inner, obj: &T) -> Result<T, StoreError> {
        let stored = T::table(&inner.tables)
            .get(obj.name())
            .ok_or_else(|| StoreError::not_found(T::KIND, obj.name()))?;

        // A re-created object with the same name is a different object.
        if stored.meta().uid != obj.meta().uid {
            return Err(StoreError::not_found(T::KIND, obj.name()));
        }

        let (expected, actual) = (obj.meta().resource_version, stored.meta().resource_version);
        if expected != actual {
            return Err(StoreError::conflict(T::KIND, obj.name(), expected, actual));
        }
        Ok(stored.clone())
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Locks the store for one call, surfacing any injected failure.
    fn begin(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self.lock();
        match inner.injected.pop_front() {
            Some(err) => Err(err),
            None => Ok(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the tables consistent, so a panic in
        // another holder does not invalidate them.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, kind: Kind, action: WatchAction, meta: &ObjectMeta) {
        // No subscribers is fine: nothing is running yet.
        let _ = self.events.send(WatchEvent {
            kind,
            action,
            meta: meta.clone(),
        });
    }
}
