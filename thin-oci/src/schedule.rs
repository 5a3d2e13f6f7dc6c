//! Bounded-concurrency layer download.
//!
//! A fixed pool of workers drains a shared queue of descriptors.  Each
//! worker streams one blob at a time into memory and hands the payload back
//! to the coordinator, which runs the caller's sink (extraction) in
//! completion order.  The first failure aborts every sibling worker.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{OciError, Result};
use crate::layer::FetchedLayer;
use crate::manifest::Descriptor;
use crate::progress::ProgressReporter;
use crate::reference::ImageRef;
use crate::registry::Registry;

/// Number of concurrent layer fetches.  Kept small to bound registry load.
pub const DOWNLOAD_WORKERS: usize = 2;

/// Minimum time between two byte-progress reports for the same layer.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the buffer reserved up front from a declared layer size.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Byte counting
// ---------------------------------------------------------------------------

/// Accumulates bytes read for one layer and forwards the running total to
/// the reporter at most once per interval, plus once at the end.
pub struct ByteCounter {
    digest: String,
    reporter: Arc<dyn ProgressReporter>,
    total: u64,
    interval: Duration,
    last_report: Instant,
}

impl ByteCounter {
    pub fn new(digest: impl Into<String>, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self::with_interval(digest, reporter, PROGRESS_INTERVAL)
    }

    pub fn with_interval(
        digest: impl Into<String>,
        reporter: Arc<dyn ProgressReporter>,
        interval: Duration,
    ) -> Self {
        Self {
            digest: digest.into(),
            reporter,
            total: 0,
            interval,
            last_report: Instant::now(),
        }
    }

    pub fn add(&mut self, n: usize) {
        self.total += n as u64;
        let now = Instant::now();
        if now.duration_since(self.last_report) >= self.interval {
            self.last_report = now;
            self.reporter.bytes_read(&self.digest, self.total);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Report the final count and return it.
    pub fn finish(self) -> u64 {
        self.reporter.bytes_read(&self.digest, self.total);
        self.total
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum Outcome {
    Fetched(FetchedLayer),
    Failed { descriptor: Descriptor, error: OciError },
}

/// Fetches a list of layers through a fixed worker pool.
pub struct DownloadScheduler {
    registry: Arc<dyn Registry>,
    reporter: Arc<dyn ProgressReporter>,
    workers: usize,
}

impl DownloadScheduler {
    pub fn new(registry: Arc<dyn Registry>, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            registry,
            reporter,
            workers: DOWNLOAD_WORKERS,
        }
    }

    /// Override the pool size (at least one worker).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Download `layers` and pass each payload to `sink` as it completes.
    ///
    /// Layers are queued in the given order but handed to `sink` in
    /// completion order.  On the first fetch failure, or the first error
    /// returned by `sink`, all workers are aborted and the error is
    /// returned.  Returns the descriptors in the order they were processed.
    pub async fn run<F, Fut>(
        &self,
        image: &ImageRef,
        layers: Vec<Descriptor>,
        mut sink: F,
    ) -> Result<Vec<Descriptor>>
    where
        F: FnMut(FetchedLayer) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let expected = layers.len();
        if expected == 0 {
            return Ok(Vec::new());
        }

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        for desc in layers {
            // The receiver is alive until the workers are spawned below.
            let _ = task_tx.send(desc);
        }
        drop(task_tx);
        let queue = Arc::new(Mutex::new(task_rx));

        let workers = self.workers.min(expected);
        let (result_tx, mut result_rx) = mpsc::channel(workers);
        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(worker(
                id,
                Arc::clone(&queue),
                result_tx.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.reporter),
                image.clone(),
            ));
        }
        drop(result_tx);
        debug!(workers, layers = expected, "download workers started");

        let mut processed = Vec::with_capacity(expected);
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                Outcome::Fetched(layer) => {
                    let descriptor = layer.descriptor.clone();
                    self.reporter.processing_started(&descriptor);
                    if let Err(e) = sink(layer).await {
                        cancel(&mut set).await;
                        return Err(e);
                    }
                    self.reporter.extraction_finished(&descriptor);
                    processed.push(descriptor);
                }
                Outcome::Failed { descriptor, error } => {
                    warn!(digest = %descriptor.digest, error = %error, "layer fetch failed");
                    cancel(&mut set).await;
                    return Err(OciError::Fetch {
                        digest: descriptor.digest,
                        source: Box::new(error),
                    });
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                return Err(OciError::Worker(e.to_string()));
            }
        }
        if processed.len() != expected {
            return Err(OciError::Worker(format!(
                "{} of {} layers were downloaded",
                processed.len(),
                expected
            )));
        }
        Ok(processed)
    }
}

/// Abort every worker and wait until their in-flight transfers are dropped.
async fn cancel(set: &mut JoinSet<()>) {
    set.abort_all();
    while set.join_next().await.is_some() {}
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Descriptor>>>,
    results: mpsc::Sender<Outcome>,
    registry: Arc<dyn Registry>,
    reporter: Arc<dyn ProgressReporter>,
    image: ImageRef,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(descriptor) = next else { break };

        debug!(worker = id, digest = %descriptor.digest, "fetching layer");
        reporter.download_started(&descriptor);
        let outcome = match fetch_layer(registry.as_ref(), &reporter, &image, &descriptor).await {
            Ok(data) => {
                reporter.download_finished(&descriptor);
                Outcome::Fetched(FetchedLayer { descriptor, data })
            }
            Err(error) => Outcome::Failed { descriptor, error },
        };
        let failed = matches!(outcome, Outcome::Failed { .. });
        if results.send(outcome).await.is_err() || failed {
            break;
        }
    }
}

async fn fetch_layer(
    registry: &dyn Registry,
    reporter: &Arc<dyn ProgressReporter>,
    image: &ImageRef,
    desc: &Descriptor,
) -> Result<Vec<u8>> {
    let mut stream = registry.fetch_blob(image, desc).await?;
    let mut counter = ByteCounter::new(desc.digest.clone(), Arc::clone(reporter));
    let mut data = Vec::with_capacity(desc.size.min(MAX_PREALLOC) as usize);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        counter.add(chunk.len());
        data.extend_from_slice(&chunk);
    }
    counter.finish();
    Ok(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BlobStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct InFlight {
        current: Arc<AtomicUsize>,
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        blobs: HashMap<String, Vec<u8>>,
        failing: HashSet<String>,
        hanging: HashSet<String>,
        hang_dropped: Arc<AtomicBool>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn resolve(&self, _image: &ImageRef) -> Result<Descriptor> {
            unreachable!("not used by the scheduler")
        }

        async fn fetch_manifest(&self, _image: &ImageRef, _digest: &str) -> Result<Vec<u8>> {
            unreachable!("not used by the scheduler")
        }

        async fn fetch_blob(&self, _image: &ImageRef, desc: &Descriptor) -> Result<BlobStream> {
            if self.failing.contains(&desc.digest) {
                return Err(OciError::NotFound(desc.digest.clone()));
            }
            if self.hanging.contains(&desc.digest) {
                let guard = DropFlag(Arc::clone(&self.hang_dropped));
                return Ok(Box::pin(stream::pending::<Result<Bytes>>().map(move |item| {
                    let _ = &guard;
                    item
                })));
            }
            let data = self.blobs.get(&desc.digest).cloned().unwrap_or_default();

            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let guard = InFlight {
                current: Arc::clone(&self.current),
            };
            let chunks: Vec<Result<Bytes>> = data
                .chunks(7)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks).then(move |chunk| {
                let _ = &guard;
                async move {
                    tokio::task::yield_now().await;
                    chunk
                }
            })))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
        bytes: StdMutex<HashMap<String, Vec<u64>>>,
    }

    impl Recorder {
        fn push(&self, event: &str, desc: &Descriptor) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {}", event, desc.digest));
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressReporter for Recorder {
        fn download_started(&self, desc: &Descriptor) {
            self.push("started", desc);
        }
        fn download_finished(&self, desc: &Descriptor) {
            self.push("finished", desc);
        }
        fn processing_started(&self, desc: &Descriptor) {
            self.push("processing", desc);
        }
        fn extraction_finished(&self, desc: &Descriptor) {
            self.push("extracted", desc);
        }
        fn skipped(&self, desc: &Descriptor) {
            self.push("skipped", desc);
        }
        fn bytes_read(&self, digest: &str, total: u64) {
            self.bytes
                .lock()
                .unwrap()
                .entry(digest.to_string())
                .or_default()
                .push(total);
        }
    }

    fn image() -> ImageRef {
        ImageRef::parse("ghcr.io/sourceplane/lite-ci:v1").unwrap()
    }

    fn layer(digest: &str, size: u64) -> Descriptor {
        Descriptor::new("application/octet-stream", digest, size)
    }

    fn registry_with(layers: &[(&str, usize)]) -> FakeRegistry {
        let mut registry = FakeRegistry::default();
        for (digest, size) in layers {
            registry
                .blobs
                .insert(digest.to_string(), vec![b'x'; *size]);
        }
        registry
    }

    #[tokio::test]
    async fn every_layer_reaches_the_sink() {
        let specs = [("sha256:a", 40), ("sha256:b", 15), ("sha256:c", 3), ("sha256:d", 0)];
        let registry = Arc::new(registry_with(&specs));
        let recorder = Arc::new(Recorder::default());
        let scheduler = DownloadScheduler::new(registry.clone(), recorder.clone());
        let layers: Vec<_> = specs.iter().map(|(d, s)| layer(d, *s as u64)).collect();

        let mut received = HashMap::new();
        let processed = scheduler
            .run(&image(), layers.clone(), |fetched| {
                assert_eq!(fetched.data.len() as u64, fetched.descriptor.size);
                received.insert(fetched.digest().to_string(), fetched.data.len());
                async { Ok::<(), OciError>(()) }
            })
            .await
            .unwrap();

        assert_eq!(processed.len(), 4);
        assert_eq!(received["sha256:a"], 40);
        assert_eq!(received["sha256:d"], 0);
        assert!(registry.peak.load(Ordering::SeqCst) <= DOWNLOAD_WORKERS);

        let events = recorder.events();
        for (digest, _) in specs {
            let pos = |e: &str| {
                events
                    .iter()
                    .position(|x| x == &format!("{} {}", e, digest))
                    .unwrap()
            };
            assert!(pos("started") < pos("finished"));
            assert!(pos("finished") < pos("processing"));
            assert!(pos("processing") < pos("extracted"));
        }
    }

    #[tokio::test]
    async fn byte_progress_is_monotonic_and_ends_at_total() {
        let registry = Arc::new(registry_with(&[("sha256:big", 1000)]));
        let recorder = Arc::new(Recorder::default());
        let scheduler = DownloadScheduler::new(registry, recorder.clone());

        scheduler
            .run(&image(), vec![layer("sha256:big", 1000)], |_| async { Ok::<(), OciError>(()) })
            .await
            .unwrap();

        let bytes = recorder.bytes.lock().unwrap();
        let reports = &bytes["sha256:big"];
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*reports.last().unwrap(), 1000);
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal() {
        let mut registry = registry_with(&[("sha256:ok", 10)]);
        registry.failing.insert("sha256:bad".to_string());
        let scheduler = DownloadScheduler::new(Arc::new(registry), Arc::new(Recorder::default()))
            .with_workers(1);

        let mut sunk = Vec::new();
        let err = scheduler
            .run(
                &image(),
                vec![layer("sha256:bad", 10), layer("sha256:ok", 10)],
                |fetched| {
                    sunk.push(fetched.digest().to_string());
                    async { Ok::<(), OciError>(()) }
                },
            )
            .await
            .unwrap_err();

        match err {
            OciError::Fetch { digest, source } => {
                assert_eq!(digest, "sha256:bad");
                assert!(matches!(*source, OciError::NotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(sunk.is_empty(), "single worker stops after its failure");
    }

    #[tokio::test]
    async fn failure_cancels_in_flight_siblings() {
        let mut registry = FakeRegistry::default();
        registry.hanging.insert("sha256:slow".to_string());
        registry.failing.insert("sha256:bad".to_string());
        let dropped = Arc::clone(&registry.hang_dropped);
        let scheduler = DownloadScheduler::new(Arc::new(registry), Arc::new(Recorder::default()));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run(
                &image(),
                vec![layer("sha256:slow", 10), layer("sha256:bad", 10)],
                |_| async { Ok::<(), OciError>(()) },
            ),
        )
        .await
        .expect("scheduler must not wait for the hung fetch");

        assert!(matches!(result, Err(OciError::Fetch { .. })));
        assert!(dropped.load(Ordering::SeqCst), "hung transfer was dropped");
    }

    #[tokio::test]
    async fn sink_error_stops_the_run() {
        let registry = Arc::new(registry_with(&[("sha256:a", 5), ("sha256:b", 5)]));
        let scheduler = DownloadScheduler::new(registry, Arc::new(Recorder::default()));

        let err = scheduler
            .run(
                &image(),
                vec![layer("sha256:a", 5), layer("sha256:b", 5)],
                |_| async { Err::<(), _>(OciError::Extract("corrupt".into())) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Extract(_)));
    }

    #[tokio::test]
    async fn empty_download_set_is_a_no_op() {
        let scheduler = DownloadScheduler::new(
            Arc::new(FakeRegistry::default()),
            Arc::new(Recorder::default()),
        );
        let processed = scheduler
            .run(&image(), Vec::new(), |_| async { Ok::<(), OciError>(()) })
            .await
            .unwrap();
        assert!(processed.is_empty());
    }

    #[test]
    fn byte_counter_throttles_but_always_reports_final_total() {
        let recorder = Arc::new(Recorder::default());
        let mut counter =
            ByteCounter::with_interval("sha256:x", recorder.clone(), Duration::from_secs(3600));
        counter.add(10);
        counter.add(20);
        assert_eq!(counter.total(), 30);
        assert!(recorder.bytes.lock().unwrap().is_empty());

        assert_eq!(counter.finish(), 30);
        assert_eq!(recorder.bytes.lock().unwrap()["sha256:x"], vec![30]);
    }

    #[test]
    fn byte_counter_reports_every_read_with_zero_interval() {
        let recorder = Arc::new(Recorder::default());
        let mut counter = ByteCounter::with_interval("sha256:y", recorder.clone(), Duration::ZERO);
        counter.add(1);
        counter.add(2);
        counter.finish();
        assert_eq!(recorder.bytes.lock().unwrap()["sha256:y"], vec![1, 3, 3]);
    }
}
