use std::io;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::store::{BookingStore, InMemoryStore, StoreError};

const WAL_CHANNEL_CAPACITY: usize = 4096;

enum WalCommand {
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

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                write_batch(&mut wal, batch);
            }
            WalCommand::Compact { events, response } => {
                let _ = response.send(wal.compact(&events));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
    tracing::debug!("WAL writer for {} stopped", wal.path().display());
}

fn write_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!("WAL batch of {} failed: {e}", batch.len());
        // No caller is told the batch landed, so none of it may survive a replay.
        if let Err(cut) = wal.discard_pending() {
            error!("could not cut failed batch from {}: {cut}", wal.path().display());
        }
    }

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, response) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(r);
    }
}

/// In-memory indexes backed by a write-ahead log.
///
/// `commit` appends to the log and only then applies the event, so a reader
/// never sees a booking that would be lost on restart.
pub struct JournaledStore {
    state: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction holds it exclusively so the snapshot
    /// cannot miss an event that is already in the old log.
    commit_gate: RwLock<()>,
}

impl JournaledStore {
    /// Replay `path` and start the background writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(path)?;
        let state = InMemoryStore::new();
        for event in &events {
            state.apply(event);
        }
        info!(
            "{}: replayed {} events, {} bookings",
            path.display(),
            events.len(),
            state.booking_count()
        );

        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Ok(Self {
            state,
            wal_tx,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn state(&self) -> &InMemoryStore {
        &self.state
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(make(tx))
            .await
            .map_err(|_| StoreError::Closed("WAL writer shut down"))?;
        rx.await
            .map_err(|_| StoreError::Closed("WAL writer dropped response"))
    }

    /// Rewrite the log as one `BookingCreated` per live booking.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.commit_gate.write().await;
        let events = self.state.snapshot();
        let count = events.len();
        self.request(|response| WalCommand::Compact { events, response })
            .await??;
        info!("WAL compacted to {count} records");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.request(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for JournaledStore {
    async fn find_by_room_and_weekday(
        &self,
        room_id: RoomId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.state.room_day(room_id, weekday))
    }

    async fn find_by_instructor_and_weekday(
        &self,
        instructor_id: InstructorId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.state.instructor_day(instructor_id, weekday))
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.state.get_booking(&id))
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError> {
        Ok(self.state.matching(filter))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.state.booking_count())
    }

    async fn commit(&self, event: &Event) -> Result<(), StoreError> {
        let _shared = self.commit_gate.read().await;
        let event_for_log = event.clone();
        self.request(|response| WalCommand::Append {
            event: event_for_log,
            response,
        })
        .await??;
        self.state.apply(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("timetabled_test_journal");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn created(room_id: RoomId, start: &str, end: &str) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                room_id,
                course_id: 1,
                instructor_id: room_id,
                academic_unit_id: 1,
                window: TimeWindow::parse("Wednesday", start, end).unwrap(),
                kind: ClassKind::Lab,
                created_at: 0,
                updated_at: 0,
            },
        }
    }

    fn run_batch(wal: &mut Wal, events: &[Event]) -> Vec<io::Result<()>> {
        let mut waiting = Vec::new();
        let mut batch = Vec::new();
        for event in events {
            let (tx, rx) = oneshot::channel();
            batch.push((event.clone(), tx));
            waiting.push(rx);
        }
        write_batch(wal, batch);
        waiting
            .into_iter()
            .map(|mut rx| rx.try_recv().unwrap())
            .collect()
    }

    #[test]
    fn failed_batch_leaves_no_bytes_behind() {
        let path = tmp_path("failed_batch.wal");
        let first = created(1, "08:00:00", "09:00:00");
        let lost = created(2, "08:00:00", "09:00:00");
        let torn = created(3, "08:00:00", "09:00:00");
        let after = created(4, "08:00:00", "09:00:00");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            assert!(run_batch(&mut wal, std::slice::from_ref(&first))[0].is_ok());

            wal.fail_append_after(1);
            let results = run_batch(&mut wal, &[lost, torn]);
            assert!(results.iter().all(|r| r.is_err()));
            assert!(!wal.is_poisoned());

            assert!(run_batch(&mut wal, std::slice::from_ref(&after))[0].is_ok());
            assert_eq!(wal.appends_since_compact(), 2);
        }

        let scan = Wal::replay(&path).unwrap();
        assert_eq!(scan.events, vec![first, after]);
        assert_eq!(scan.discarded, 0);
    }

    #[tokio::test]
    async fn store_keeps_committing_after_failed_write() {
        let path = tmp_path("store_after_failure.wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.fail_append_after(0);
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        let store = JournaledStore {
            state: InMemoryStore::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
        };

        let rejected = created(5, "10:00:00", "11:00:00");
        assert!(store.commit(&rejected).await.is_err());
        assert_eq!(store.len().await.unwrap(), 0);

        let kept = created(5, "10:00:00", "11:00:00");
        store.commit(&kept).await.unwrap();

        let (_, events) = Wal::open(&path).unwrap();
        assert_eq!(events, vec![kept]);
    }
}
