//! The stream synchronization service.
//!
//! Push events drive the stream sessions held in a [`StreamingStore`].
//! While a stream is running, a per-stream poll re-fetches its latest data
//! and results as a fallback for missed events.
//!
//! Every fetch takes a generation number per `(stream, kind)` when issued.
//! A response is applied only if its generation is newer than the last one
//! applied; clearing or restarting a stream marks everything issued so far
//! as applied, so responses that predate it are discarded.

use filestate_bridge::{StreamState, StreamingStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::backend::StreamBackend;
use crate::error::{Result, StreamError};
use crate::event::{EventDebouncer, StreamEvent};

/// Configuration for the stream synchronization service
#[derive(Debug, Clone)]
pub struct StreamSyncConfig {
    /// Fallback poll interval while a stream is running
    pub poll_interval: Duration,
    /// Window in which repeated non-critical events are dropped
    pub event_debounce: Duration,
    /// Number of chunks/results requested per fetch
    pub fetch_count: usize,
}

impl Default for StreamSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            event_debounce: Duration::from_millis(50),
            fetch_count: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FetchKind {
    Data,
    Results,
    Stats,
}

impl FetchKind {
    const ALL: [FetchKind; 3] = [FetchKind::Data, FetchKind::Results, FetchKind::Stats];

    fn as_str(self) -> &'static str {
        match self {
            FetchKind::Data => "data",
            FetchKind::Results => "results",
            FetchKind::Stats => "stats",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Generation {
    issued: u64,
    applied: u64,
}

type Generations = HashMap<(String, FetchKind), Generation>;

fn discard_in_flight(generations: &mut Generations, stream_id: &str) {
    for kind in FetchKind::ALL {
        let entry = generations
            .entry((stream_id.to_string(), kind))
            .or_default();
        entry.applied = entry.issued;
    }
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_debounced: AtomicU64,
    fetches_issued: AtomicU64,
    fetch_failures: AtomicU64,
    stale_discarded: AtomicU64,
}

/// Snapshot of the service's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_debounced: u64,
    pub fetches_issued: u64,
    pub fetch_failures: u64,
    pub stale_discarded: u64,
}

struct Listener {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner<S: ?Sized> {
    backend: Arc<dyn StreamBackend>,
    store: Arc<S>,
    config: StreamSyncConfig,
    debouncer: Mutex<EventDebouncer>,
    polls: Mutex<HashMap<String, JoinHandle<()>>>,
    generations: Mutex<Generations>,
    fetch_tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_task: AtomicU64,
    listener: Mutex<Option<Listener>>,
    counters: Counters,
    shut_down: AtomicBool,
}

impl<S: ?Sized> Drop for Inner<S> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
        for (_, task) in self.polls.get_mut().drain() {
            task.abort();
        }
    }
}

/// Keeps stream sessions in a [`StreamingStore`] in sync with a backend.
///
/// Cheap to clone; clones share sessions, polls and counters.
pub struct StreamSyncService<S: ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: ?Sized> Clone for StreamSyncService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: StreamingStore + ?Sized + 'static> StreamSyncService<S> {
    pub fn new(backend: Arc<dyn StreamBackend>, store: Arc<S>, config: StreamSyncConfig) -> Self {
        let debouncer = EventDebouncer::new(config.event_debounce);
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                config,
                debouncer: Mutex::new(debouncer),
                polls: Mutex::new(HashMap::new()),
                generations: Mutex::new(HashMap::new()),
                fetch_tasks: Mutex::new(HashMap::new()),
                next_task: AtomicU64::new(0),
                listener: Mutex::new(None),
                counters: Counters::default(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &StreamSyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    // ── Listener ─────────────────────────────────────────────────────

    /// Consume push events from `events` on a background task, in arrival
    /// order. Replaces any previous listener.
    pub fn start(&self, mut events: mpsc::Receiver<StreamEvent>) -> Result<()> {
        if self.is_shut_down() {
            return Err(StreamError::ShutDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(StreamError::backend)?;
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let weak = Arc::downgrade(&self.inner);

        let task = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,

                    event = events.recv() => {
                        let Some(event) = event else {
                            break; // Sender dropped
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        StreamSyncService { inner }.handle_event(event);
                    }
                }
            }
            tracing::debug!("stream event listener stopped");
        });

        if let Some(previous) = self.inner.listener.lock().replace(Listener { stop_tx, task }) {
            previous.task.abort();
        }
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Apply one push event. Never fails and never blocks on I/O; fetches
    /// run in the background.
    pub fn handle_event(&self, event: StreamEvent) {
        if self.is_shut_down() {
            return;
        }
        let counters = &self.inner.counters;
        counters.events_received.fetch_add(1, Ordering::Relaxed);
        if !self.inner.debouncer.lock().admit(&event, Instant::now()) {
            counters.events_debounced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(stream = %event.stream_id(), kind = event.kind().as_str(), "event debounced");
            return;
        }
        counters.events_processed.fetch_add(1, Ordering::Relaxed);

        let store = &self.inner.store;
        if store.ensure_stream_session(event.stream_id()) {
            tracing::debug!(stream = %event.stream_id(), "new stream session");
        }

        match event {
            StreamEvent::StateChanged { stream_id, state } => self.apply_state(&stream_id, state),
            StreamEvent::DataReceived { stream_id, .. } => {
                self.spawn_fetch(&stream_id, FetchKind::Data)
            }
            StreamEvent::ResultsReady { stream_id, .. } => {
                self.spawn_fetch(&stream_id, FetchKind::Results)
            }
            StreamEvent::StatsUpdate { stream_id, stats } => {
                let generation = self.begin_fetch(&stream_id, FetchKind::Stats);
                self.apply(&stream_id, FetchKind::Stats, generation, |store| {
                    store.set_stream_stats(&stream_id, stats)
                });
            }
            StreamEvent::Error { stream_id, error } => {
                self.stop_polling(&stream_id);
                tracing::warn!(stream = %stream_id, %error, "stream error");
                store.set_stream_error(&stream_id, &error);
            }
        }
    }

    fn apply_state(&self, stream_id: &str, state: StreamState) {
        let store = &self.inner.store;
        match state {
            StreamState::Running => {
                let previous = store.stream_session(stream_id).map(|s| s.state);
                if previous.is_some_and(StreamState::is_terminal) {
                    let mut generations = self.inner.generations.lock();
                    discard_in_flight(&mut generations, stream_id);
                    store.reset_stream_session(stream_id);
                    tracing::info!(stream = %stream_id, "stream restarted");
                }
                store.set_stream_state(stream_id, state);
                self.start_polling(stream_id);
            }
            _ => {
                self.stop_polling(stream_id);
                store.set_stream_state(stream_id, state);
            }
        }
    }

    // ── Polling ──────────────────────────────────────────────────────

    fn start_polling(&self, stream_id: &str) {
        if self.is_shut_down() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(stream = %stream_id, "no runtime, polling not started");
            return;
        };

        let mut polls = self.inner.polls.lock();
        if polls.get(stream_id).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval;
        let id = stream_id.to_string();
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                StreamSyncService { inner }.poll_once(&id).await;
            }
        });
        polls.insert(stream_id.to_string(), task);
        tracing::debug!(stream = %stream_id, "polling started");
    }

    fn stop_polling(&self, stream_id: &str) -> bool {
        match self.inner.polls.lock().remove(stream_id) {
            Some(task) => {
                task.abort();
                tracing::debug!(stream = %stream_id, "polling stopped");
                true
            }
            None => false,
        }
    }

    async fn poll_once(&self, stream_id: &str) {
        self.fetch(stream_id, FetchKind::Data).await;
        self.fetch(stream_id, FetchKind::Results).await;
    }

    pub fn is_polling(&self, stream_id: &str) -> bool {
        self.inner
            .polls
            .lock()
            .get(stream_id)
            .is_some_and(|h| !h.is_finished())
    }

    pub fn active_poll_count(&self) -> usize {
        self.inner
            .polls
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    // ── Fetching ─────────────────────────────────────────────────────

    fn spawn_fetch(&self, stream_id: &str, kind: FetchKind) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(stream = %stream_id, fetch = kind.as_str(), "no runtime, fetch skipped");
            return;
        };
        let task_id = self.inner.next_task.fetch_add(1, Ordering::Relaxed);
        let service = self.clone();
        let id = stream_id.to_string();

        // Registered under the lock so the task cannot deregister first.
        let mut tasks = self.inner.fetch_tasks.lock();
        let handle = runtime.spawn(async move {
            service.fetch(&id, kind).await;
            service.inner.fetch_tasks.lock().remove(&task_id);
        });
        tasks.insert(task_id, handle.abort_handle());
    }

    /// Number of event-triggered fetches still running.
    pub fn in_flight_fetches(&self) -> usize {
        self.inner.fetch_tasks.lock().len()
    }

    fn begin_fetch(&self, stream_id: &str, kind: FetchKind) -> u64 {
        let mut generations = self.inner.generations.lock();
        let entry = generations
            .entry((stream_id.to_string(), kind))
            .or_default();
        entry.issued += 1;
        entry.issued
    }

    /// Run `update` if `generation` is the newest response seen for this
    /// stream and kind and the session still exists.
    fn apply(
        &self,
        stream_id: &str,
        kind: FetchKind,
        generation: u64,
        update: impl FnOnce(&S),
    ) -> bool {
        let mut generations = self.inner.generations.lock();
        let entry = generations
            .entry((stream_id.to_string(), kind))
            .or_default();
        if generation <= entry.applied || !self.inner.store.has_stream_session(stream_id) {
            self.inner
                .counters
                .stale_discarded
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(stream = %stream_id, fetch = kind.as_str(), generation, "stale response discarded");
            return false;
        }
        entry.applied = generation;
        update(&*self.inner.store);
        true
    }

    async fn fetch(&self, stream_id: &str, kind: FetchKind) {
        let generation = self.begin_fetch(stream_id, kind);
        self.inner
            .counters
            .fetches_issued
            .fetch_add(1, Ordering::Relaxed);
        let backend = &self.inner.backend;
        let count = self.inner.config.fetch_count;

        let outcome = match kind {
            FetchKind::Data => backend
                .get_stream_data(stream_id, count)
                .await
                .map(|chunks| {
                    self.apply(stream_id, kind, generation, |store| {
                        store.replace_stream_data(stream_id, chunks)
                    })
                }),
            FetchKind::Results => backend
                .get_stream_results(stream_id, count)
                .await
                .map(|results| {
                    self.apply(stream_id, kind, generation, |store| {
                        store.replace_stream_results(stream_id, results)
                    })
                }),
            FetchKind::Stats => backend.get_stream_stats(stream_id).await.map(|stats| {
                self.apply(stream_id, kind, generation, |store| {
                    store.set_stream_stats(stream_id, stats)
                })
            }),
        };

        if let Err(e) = outcome {
            self.inner
                .counters
                .fetch_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(stream = %stream_id, fetch = kind.as_str(), error = %e, "stream fetch failed");
        }
    }

    // ── Explicit operations ──────────────────────────────────────────

    /// Truncate the backend's buffers, then the local ones. Responses to
    /// fetches issued before the clear are discarded when they arrive.
    pub async fn clear_stream_buffers(&self, stream_id: &str) -> Result<()> {
        self.inner.backend.clear_stream_buffers(stream_id).await?;
        let mut generations = self.inner.generations.lock();
        discard_in_flight(&mut generations, stream_id);
        self.inner.store.clear_stream_buffers(stream_id);
        Ok(())
    }

    /// Stop polling, clear buffers on both sides and drop the session.
    pub async fn remove_stream(&self, stream_id: &str) -> bool {
        self.stop_polling(stream_id);
        if let Err(e) = self.inner.backend.clear_stream_buffers(stream_id).await {
            tracing::warn!(stream = %stream_id, error = %e, "backend clear failed during removal");
        }
        {
            let mut generations = self.inner.generations.lock();
            discard_in_flight(&mut generations, stream_id);
        }
        self.inner.debouncer.lock().forget(stream_id);
        self.inner.store.remove_stream_session(stream_id)
    }

    /// Adopt the streams the backend already knows about, e.g. after a
    /// restart. Running streams start polling. Returns how many were
    /// adopted.
    pub async fn sync_existing_streams(&self) -> Result<usize> {
        let stream_ids = self.inner.backend.list_streams().await?;
        let mut adopted = 0;
        for stream_id in stream_ids {
            match self.inner.backend.get_stream_state(&stream_id).await {
                Ok(state) => {
                    self.inner.store.ensure_stream_session(&stream_id);
                    self.apply_state(&stream_id, state);
                    self.spawn_fetch(&stream_id, FetchKind::Data);
                    self.spawn_fetch(&stream_id, FetchKind::Results);
                    adopted += 1;
                }
                Err(e) => {
                    self.inner
                        .counters
                        .fetch_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(stream = %stream_id, error = %e, "could not adopt stream");
                }
            }
        }
        tracing::info!(adopted, "synced existing streams");
        Ok(adopted)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop the listener, every poll and every in-flight fetch.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(listener) = self.inner.listener.lock().take() {
            let _ = listener.stop_tx.try_send(());
            listener.task.abort();
        }
        for (_, task) in self.inner.polls.lock().drain() {
            task.abort();
        }
        for (_, task) in self.inner.fetch_tasks.lock().drain() {
            task.abort();
        }
        self.inner.debouncer.lock().clear();
        tracing::info!("stream sync service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> SyncMetrics {
        let c = &self.inner.counters;
        SyncMetrics {
            events_received: c.events_received.load(Ordering::Relaxed),
            events_processed: c.events_processed.load(Ordering::Relaxed),
            events_debounced: c.events_debounced.load(Ordering::Relaxed),
            fetches_issued: c.fetches_issued.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            stale_discarded: c.stale_discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use filestate_bridge::{AppStateManager, DataChunk, StreamResult, StreamStats};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockBackend {
        data_calls: AtomicUsize,
        results_calls: AtomicUsize,
        clear_calls: AtomicUsize,
        fail: AtomicBool,
        scripted_data: Mutex<VecDeque<(Duration, Vec<DataChunk>)>>,
        streams: Mutex<Vec<(String, StreamState)>>,
    }

    impl MockBackend {
        fn script(&self, delay_ms: u64, chunks: Vec<DataChunk>) {
            self.scripted_data
                .lock()
                .push_back((Duration::from_millis(delay_ms), chunks));
        }

        fn data_calls(&self) -> usize {
            self.data_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamBackend for MockBackend {
        async fn get_stream_data(&self, stream_id: &str, _count: usize) -> Result<Vec<DataChunk>> {
            self.data_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StreamError::fetch(stream_id, "data", "backend offline"));
            }
            let scripted = self.scripted_data.lock().pop_front();
            match scripted {
                Some((delay, chunks)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(chunks)
                }
                None => Ok(Vec::new()),
            }
        }

        async fn get_stream_results(
            &self,
            stream_id: &str,
            _count: usize,
        ) -> Result<Vec<StreamResult>> {
            self.results_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StreamError::fetch(stream_id, "results", "backend offline"));
            }
            Ok(Vec::new())
        }

        async fn get_stream_stats(&self, _stream_id: &str) -> Result<StreamStats> {
            Ok(StreamStats::default())
        }

        async fn get_stream_state(&self, stream_id: &str) -> Result<StreamState> {
            self.streams
                .lock()
                .iter()
                .find(|(id, _)| id == stream_id)
                .map(|(_, state)| *state)
                .ok_or_else(|| StreamError::backend(format!("unknown stream {stream_id}")))
        }

        async fn clear_stream_buffers(&self, _stream_id: &str) -> Result<()> {
            self.clear_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_streams(&self) -> Result<Vec<String>> {
            Ok(self.streams.lock().iter().map(|(id, _)| id.clone()).collect())
        }
    }

    fn chunk(sequence: u64) -> DataChunk {
        DataChunk {
            sequence,
            timestamp: sequence as f64,
            channels: vec!["C3".into()],
            samples: vec![vec![0.5]],
        }
    }

    fn setup() -> (
        StreamSyncService<AppStateManager>,
        Arc<MockBackend>,
        Arc<AppStateManager>,
    ) {
        let backend = Arc::new(MockBackend::default());
        let store = Arc::new(AppStateManager::new());
        let service =
            StreamSyncService::new(backend.clone(), store.clone(), StreamSyncConfig::default());
        (service, backend, store)
    }

    fn state(stream_id: &str, state: StreamState) -> StreamEvent {
        StreamEvent::StateChanged {
            stream_id: stream_id.into(),
            state,
        }
    }

    fn data(stream_id: &str) -> StreamEvent {
        StreamEvent::DataReceived {
            stream_id: stream_id.into(),
            chunks_count: 1,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_triggers_single_fetch_and_one_poll() {
        let (service, backend, _store) = setup();
        service.handle_event(state("s1", StreamState::Running));
        for _ in 0..5 {
            service.handle_event(data("s1"));
            tokio::time::advance(ms(2)).await;
        }
        tokio::time::sleep(ms(20)).await;

        assert_eq!(backend.data_calls(), 1);
        assert_eq!(service.active_poll_count(), 1);
        assert_eq!(service.metrics().events_debounced, 4);

        // First poll tick at 100ms.
        tokio::time::sleep(ms(100)).await;
        assert_eq!(backend.data_calls(), 2);
        assert_eq!(backend.results_calls.load(Ordering::SeqCst), 1);

        service.handle_event(state("s1", StreamState::Stopped));
        assert_eq!(service.active_poll_count(), 0);
        let calls = backend.data_calls();
        tokio::time::sleep(ms(500)).await;
        assert_eq!(backend.data_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_response_is_discarded() {
        let (service, backend, store) = setup();
        backend.script(200, vec![chunk(1)]);
        backend.script(0, vec![chunk(2)]);

        service.handle_event(data("s1"));
        tokio::time::sleep(ms(60)).await;
        service.handle_event(data("s1"));
        tokio::time::sleep(ms(10)).await;
        let session = store.stream_session("s1").unwrap();
        assert_eq!(session.data.latest().map(|c| c.sequence), Some(2));

        tokio::time::sleep(ms(300)).await;
        let session = store.stream_session("s1").unwrap();
        assert_eq!(session.data.latest().map(|c| c.sequence), Some(2));
        assert_eq!(session.data.len(), 1);
        assert_eq!(service.metrics().stale_discarded, 1);
        assert_eq!(service.in_flight_fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_in_flight_fetch() {
        let (service, backend, store) = setup();
        backend.script(100, vec![chunk(1)]);

        service.handle_event(data("s1"));
        tokio::time::sleep(ms(10)).await;
        service.clear_stream_buffers("s1").await.unwrap();
        tokio::time::sleep(ms(200)).await;

        let session = store.stream_session("s1").unwrap();
        assert!(session.data.is_empty());
        assert_eq!(backend.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.metrics().stale_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_events_are_never_debounced() {
        let (service, _backend, store) = setup();
        service.handle_event(state("s1", StreamState::Running));
        for _ in 0..2 {
            service.handle_event(StreamEvent::Error {
                stream_id: "s1".into(),
                error: "device lost".into(),
            });
        }
        let metrics = service.metrics();
        assert_eq!(metrics.events_processed, 3);
        assert_eq!(metrics.events_debounced, 0);
        assert!(!service.is_polling("s1"));

        let session = store.stream_session("s1").unwrap();
        assert_eq!(session.state, StreamState::Error);
        assert_eq!(session.last_error.as_deref(), Some("device lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_session() {
        let (service, backend, store) = setup();
        backend.script(0, vec![chunk(1)]);
        service.handle_event(state("s1", StreamState::Running));
        service.handle_event(data("s1"));
        tokio::time::sleep(ms(10)).await;
        assert_eq!(store.stream_session("s1").unwrap().data.len(), 1);

        service.handle_event(state("s1", StreamState::Stopped));
        assert!(!service.is_polling("s1"));
        assert_eq!(
            store.stream_session("s1").unwrap().state,
            StreamState::Stopped
        );

        service.handle_event(state("s1", StreamState::Running));
        let session = store.stream_session("s1").unwrap();
        assert!(session.data.is_empty());
        assert_eq!(session.state, StreamState::Running);
        assert!(service.is_polling("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_keep_polling() {
        let (service, backend, store) = setup();
        backend.fail.store(true, Ordering::SeqCst);
        service.handle_event(state("s1", StreamState::Running));
        tokio::time::sleep(ms(350)).await;

        assert!(service.metrics().fetch_failures >= 6);
        assert!(service.is_polling("s1"));
        assert_eq!(
            store.stream_session("s1").unwrap().state,
            StreamState::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_is_per_stream() {
        let (service, _backend, _store) = setup();
        service.handle_event(state("s1", StreamState::Running));
        service.handle_event(state("s2", StreamState::Running));
        service.handle_event(state("s1", StreamState::Running));
        assert_eq!(service.active_poll_count(), 2);

        service.handle_event(state("s1", StreamState::Stopped));
        assert_eq!(service.active_poll_count(), 1);
        assert!(service.is_polling("s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_update_applies_payload() {
        let (service, _backend, store) = setup();
        let stats = StreamStats {
            chunks_received: 42,
            ..StreamStats::default()
        };
        service.handle_event(StreamEvent::StatsUpdate {
            stream_id: "s1".into(),
            stats: stats.clone(),
        });
        assert_eq!(store.stream_session("s1").unwrap().stats, stats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_existing_streams() {
        let (service, backend, store) = setup();
        *backend.streams.lock() = vec![
            ("a".to_string(), StreamState::Running),
            ("b".to_string(), StreamState::Stopped),
        ];
        assert_eq!(service.sync_existing_streams().await.unwrap(), 2);
        assert!(service.is_polling("a"));
        assert!(!service.is_polling("b"));
        assert_eq!(store.stream_session("b").unwrap().state, StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stream() {
        let (service, backend, store) = setup();
        service.handle_event(state("s1", StreamState::Running));
        assert!(service.remove_stream("s1").await);
        assert!(!service.is_polling("s1"));
        assert!(store.stream_session("s1").is_none());
        assert_eq!(backend.clear_calls.load(Ordering::SeqCst), 1);
        assert!(!service.remove_stream("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_does_not_recreate_removed_session() {
        let (service, backend, store) = setup();
        backend.script(100, vec![chunk(1)]);

        service.handle_event(data("s1"));
        tokio::time::sleep(ms(10)).await;
        assert!(service.remove_stream("s1").await);
        tokio::time::sleep(ms(200)).await;

        assert!(!store.has_stream_session("s1"));
        assert!(store.stream_ids().is_empty());
        assert_eq!(service.metrics().stale_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_nothing_running() {
        let (service, backend, _store) = setup();
        let (tx, rx) = mpsc::channel(16);
        service.start(rx).unwrap();
        tx.send(state("s1", StreamState::Running)).await.unwrap();
        tx.send(state("s2", StreamState::Running)).await.unwrap();
        backend.script(1_000, vec![chunk(1)]);
        tx.send(data("s1")).await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert!(service.is_listening());
        assert_eq!(service.active_poll_count(), 2);
        assert_eq!(service.in_flight_fetches(), 1);

        service.shutdown();
        assert!(!service.is_listening());
        assert_eq!(service.active_poll_count(), 0);
        assert_eq!(service.in_flight_fetches(), 0);

        let calls = backend.data_calls();
        tokio::time::sleep(ms(500)).await;
        assert_eq!(backend.data_calls(), calls);

        service.handle_event(state("s3", StreamState::Running));
        assert_eq!(service.active_poll_count(), 0);
        assert!(service.start(mpsc::channel(1).1).is_err());
    }
}
