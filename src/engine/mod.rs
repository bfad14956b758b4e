mod admission;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod scope;
mod store;

pub use admission::{AdmissionRequest, VIDEO_LINK_PLACEHOLDER};
pub use availability::{
    day_windows, generate_candidates, in_date_range, local_date, local_instant, merge_windows,
    SLOT_STEP_MIN,
};
pub use conflict::{filter_available, first_conflict};
pub use error::EngineError;
pub use scope::HostScope;
pub use store::{HostStore, SharedHostState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::outbound::Collaborators;
use crate::wal::Wal;

/// Tunables that do not change engine semantics.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Longest wait for a host lock before failing with `LockTimeout`.
    pub lock_timeout: Duration,
    /// Longest wait for the conferencing collaborator.
    pub conferencing_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            conferencing_timeout: Duration::from_secs(3),
        }
    }
}

// ── Group-commit journal channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then handle the non-append command.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    commit(wal, batch.iter().map(|(event, _)| event))
}

/// Write and fsync `events` as one unit. On failure the journal is cut back
/// to where it stood before the first of them, so no caller that is told
/// `Err` has its event replayed later.
fn commit<'a>(wal: &mut Wal, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
    let result = events
        .into_iter()
        .try_for_each(|event| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        error!(path = %wal.path().display(), "journal rollback failed, appends disabled: {e}");
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let _ = response.send(commit(wal, [&event]));
        }
    }
}

/// The booking engine: authoritative host state, its journal, and the
/// collaborators invoked around admission.
pub struct Engine {
    pub(super) store: HostStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) collaborators: Collaborators,
    pub(super) options: EngineOptions,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, Collaborators::default(), EngineOptions::default())
    }

    /// Replay the journal at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn with_options(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        collaborators: Collaborators,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let (events, wal) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: HostStore::new(),
            wal_tx,
            notify,
            collaborators,
            options,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds
        // instantly. Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::HostCreated { id, name } => {
                    if engine.store.reserve_host(HostState::new(*id, name.clone())).is_none() {
                        warn!(host = %id, "duplicate host creation in journal skipped");
                    }
                }
                other => {
                    let host_id = other.host_id();
                    let Some(rs) = engine.store.get_host(&host_id) else {
                        warn!(host = %host_id, "journal event for unknown host skipped");
                        continue;
                    };
                    if let Ok(mut guard) = rs.try_write() {
                        engine.store.apply_event(&mut guard, other);
                    }
                }
            }
        }

        if !events.is_empty() {
            info!(
                events = events.len(),
                hosts = engine.store.host_count(),
                "journal replayed"
            );
        }
        metrics::gauge!(crate::observability::HOSTS_ACTIVE).set(engine.store.host_count() as f64);
        Ok(engine)
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn get_host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.store.get_host(id)
    }

    pub fn host_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.store.host_for_entity(entity_id)
    }

    /// Append an event via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Journal-append + apply + publish in one call. The event is durable
    /// before the in-memory state changes.
    pub(super) async fn persist_and_apply(
        &self,
        host_id: Ulid,
        hs: &mut HostState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(hs, event);
        self.notify.send(host_id, event);
        Ok(())
    }

    /// Acquire a host's exclusive lock, failing fast after `lock_timeout`.
    pub(super) async fn lock_host(
        &self,
        host_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<HostState>, EngineError> {
        let rs = self
            .store
            .get_host(&host_id)
            .ok_or(EngineError::NotFound(host_id))?;
        let waited = Instant::now();
        let guard = tokio::time::timeout(self.options.lock_timeout, rs.clone().write_owned())
            .await
            .map_err(|_| {
                warn!(host = %host_id, "host lock wait timed out");
                EngineError::LockTimeout(host_id)
            })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(waited.elapsed().as_secs_f64());
        if !self.store.is_current(&host_id, &rs) {
            return Err(EngineError::NotFound(host_id));
        }
        Ok(guard)
    }

    /// Shared read of a host, bounded like `lock_host`.
    pub(super) async fn read_host(
        &self,
        host_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<HostState>, EngineError> {
        let rs = self
            .store
            .get_host(&host_id)
            .ok_or(EngineError::NotFound(host_id))?;
        let guard = tokio::time::timeout(self.options.lock_timeout, rs.clone().read_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(host_id))?;
        if !self.store.is_current(&host_id, &rs) {
            return Err(EngineError::NotFound(host_id));
        }
        Ok(guard)
    }

    /// Lookup entity → host, then acquire that host's lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<HostState>), EngineError> {
        let host_id = self
            .store
            .host_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.lock_host(host_id).await?;
        Ok((host_id, guard))
    }
}
