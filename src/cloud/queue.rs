//! Upload tending.
//!
//! A tend pass scans the track directory and pushes every `NotUploaded` or
//! `Queued` file through `Queued → Uploading → Uploaded`, falling back to
//! `NotUploaded` on failure. Only one pass runs at a time; triggers that
//! arrive while a pass is running are dropped. A pass with failures leaves
//! the tender armed until a later trigger succeeds. There is no timer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{AuthSignal, CloudData, TokenProvider, UploadError, Uploader};
use crate::tracks::{TrackFile, TrackState, TrackStateRegistry};

/// Outcome of one tend pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TendReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
}

pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    registry: Arc<TrackStateRegistry>,
    track_dir: PathBuf,
    uploader: Arc<dyn Uploader>,
    tokens: Arc<dyn TokenProvider>,
    auth: AuthSignal,
    runtime: Handle,
    tending: AtomicBool,
    armed: AtomicBool,
    completed: Mutex<HashMap<PathBuf, CloudData>>,
}

impl UploadQueue {
    pub fn new(
        registry: Arc<TrackStateRegistry>,
        track_dir: impl Into<PathBuf>,
        uploader: Arc<dyn Uploader>,
        tokens: Arc<dyn TokenProvider>,
        auth: AuthSignal,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                registry,
                track_dir: track_dir.into(),
                uploader,
                tokens,
                auth,
                runtime,
                tending: AtomicBool::new(false),
                armed: AtomicBool::new(false),
                completed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a tend pass on the runtime. Returns `None` when signed out or
    /// when a pass is already running.
    pub fn tend(&self) -> Option<JoinHandle<TendReport>> {
        if !self.inner.auth.is_signed_in() {
            log::info!("[cloud] not signed in, skipping tend");
            return None;
        }
        if self
            .inner
            .tending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::info!("[cloud] tend already running, trigger dropped");
            return None;
        }

        let guard = TendGuard {
            inner: self.inner.clone(),
            finished: false,
        };
        Some(self.inner.runtime.spawn(async move {
            let mut guard = guard;
            let report = guard.inner.tend_pass().await;
            guard.inner.armed.store(report.failed > 0, Ordering::Release);
            guard.finished = true;
            drop(guard);
            log::info!(
                "[cloud] tend done: {} attempted, {} uploaded, {} failed",
                report.attempted,
                report.uploaded,
                report.failed
            );
            report
        }))
    }

    pub fn is_tending(&self) -> bool {
        self.inner.tending.load(Ordering::Acquire)
    }

    /// True when the last pass left failures behind
    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    /// Remote metadata for a track uploaded during this process lifetime,
    /// keyed by the path it had before moving to `synced/`
    pub fn completed(&self, track: &TrackFile) -> Option<CloudData> {
        self.inner
            .completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(track.path())
            .cloned()
    }

    pub fn track_dir(&self) -> &Path {
        &self.inner.track_dir
    }

    pub fn auth(&self) -> &AuthSignal {
        &self.inner.auth
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }
}

/// Releases the tender when a pass ends, including by panic or cancellation.
/// An unfinished pass leaves the tender armed.
struct TendGuard {
    inner: Arc<QueueInner>,
    finished: bool,
}

impl Drop for TendGuard {
    fn drop(&mut self) {
        if !self.finished {
            log::error!("[cloud] tend pass aborted");
            self.inner.armed.store(true, Ordering::Release);
        }
        self.inner.tending.store(false, Ordering::Release);
    }
}

impl Clone for UploadQueue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl QueueInner {
    fn ensure_signed_in(&self) -> Result<(), UploadError> {
        if self.auth.is_signed_in() {
            Ok(())
        } else {
            Err(UploadError::NotSignedIn)
        }
    }

    async fn scan(&self) -> Result<Vec<TrackFile>, String> {
        let registry = self.registry.clone();
        let dir = self.track_dir.clone();
        match tokio::task::spawn_blocking(move || registry.list_tracks(&dir)).await {
            Ok(Ok(tracks)) => Ok(tracks),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn tend_pass(&self) -> TendReport {
        let mut report = TendReport::default();

        let tracks = match self.scan().await {
            Ok(tracks) => tracks,
            Err(e) => {
                log::warn!("[cloud] cannot scan tracks: {}", e);
                report.failed = 1;
                return report;
            }
        };

        let pending: Vec<TrackFile> = tracks
            .into_iter()
            .filter(|t| {
                matches!(
                    self.registry.get_state(t),
                    TrackState::NotUploaded | TrackState::Queued
                )
            })
            .collect();
        if pending.is_empty() {
            return report;
        }

        let token = match self.tokens.token().ok_or(UploadError::NotSignedIn) {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[cloud] no credential ({}), {} track(s) left pending", e, pending.len());
                report.failed = pending.len();
                return report;
            }
        };

        for track in &pending {
            if self.registry.get_state(track) == TrackState::NotUploaded {
                // A rejected step leaves the file out of the upload loop below
                let _ = self.registry.set_state(track, TrackState::Queued);
            }
        }

        for track in &pending {
            if let Err(e) = self.ensure_signed_in() {
                log::info!("[cloud] {} mid-tend, remaining tracks stay queued", e);
                report.failed += 1;
                break;
            }
            if self.registry.set_state(track, TrackState::Uploading).is_err() {
                continue;
            }
            report.attempted += 1;

            match self.uploader.upload(track, &token).await {
                Ok(data) => {
                    log::info!("[cloud] uploaded {} → {}", track, data.track_url);
                    self.completed
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(track.path().to_path_buf(), data);
                    if self.registry.set_state(track, TrackState::Uploaded).is_ok() {
                        report.uploaded += 1;
                        self.archive(track).await;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    match e {
                        UploadError::AuthRequired => {
                            log::error!("[cloud] upload of {} rejected: {}", track, e)
                        }
                        _ => log::warn!("[cloud] upload of {} failed: {}", track, e),
                    }
                    let _ = self.registry.set_state(track, TrackState::NotUploaded);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Move an uploaded file out of the scan path so no later pass, in this
    /// process or another, offers it again.
    async fn archive(&self, track: &TrackFile) {
        let source = track.clone();
        match tokio::task::spawn_blocking(move || source.move_to_synced()).await {
            Ok(Ok(moved)) => log::debug!("[cloud] {} → {}", track, moved.path().display()),
            Ok(Err(e)) => log::error!("[cloud] uploaded {} but could not archive it: {}", track, e),
            Err(e) => log::error!("[cloud] archiving {} failed: {}", track, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{AuthState, StaticToken};
    use crate::tracks::TrackStateChange;
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct FakeUploader {
        failures_left: AtomicUsize,
        calls: Mutex<Vec<PathBuf>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeUploader {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(0)
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Uploader for FakeUploader {
        fn upload<'a>(
            &'a self,
            track: &'a TrackFile,
            token: &'a str,
        ) -> BoxFuture<'a, Result<CloudData, UploadError>> {
            async move {
                assert_eq!(token, "tok");
                self.calls.lock().unwrap().push(track.path().to_path_buf());
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                let failing = self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(UploadError::Http(500));
                }
                let id = track.file_name();
                Ok(CloudData {
                    track_url: format!("https://base-line.ws/tracks/{id}"),
                    track_id: id,
                })
            }
            .boxed()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<TrackStateRegistry>,
        auth: AuthSignal,
        queue: UploadQueue,
        tracks: Vec<TrackFile>,
    }

    fn fixture(uploader: Arc<dyn Uploader>, names: &[&str]) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let tracks: Vec<TrackFile> = names
            .iter()
            .map(|n| {
                let t = TrackFile::new(dir.path().join(n));
                std::fs::write(t.path(), b"x").unwrap();
                t
            })
            .collect();
        let registry = Arc::new(TrackStateRegistry::new());
        let auth = AuthSignal::new(AuthState::SignedIn);
        let queue = UploadQueue::new(
            registry.clone(),
            dir.path(),
            uploader,
            Arc::new(StaticToken("tok".to_string())),
            auth.clone(),
            Handle::current(),
        );
        Fixture {
            _dir: dir,
            registry,
            auth,
            queue,
            tracks,
        }
    }

    #[tokio::test]
    async fn test_signed_out_skips_tend() {
        let uploader = Arc::new(FakeUploader::new(0));
        let f = fixture(uploader.clone(), &["track_2024-01-01_00-00-00.csv.gz"]);
        f.auth.set(AuthState::SignedOut);
        assert!(f.queue.tend().is_none());
        f.auth.set(AuthState::SigningIn);
        assert!(f.queue.tend().is_none());
        assert_eq!(uploader.calls(), 0);
    }

    #[tokio::test]
    async fn test_tend_uploads_pending_tracks() {
        let uploader = Arc::new(FakeUploader::new(0));
        let f = fixture(
            uploader.clone(),
            &[
                "track_2024-01-01_00-00-00.csv.gz",
                "track_2024-01-02_00-00-00.csv.gz",
            ],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = f
            .registry
            .changes()
            .subscribe(move |c: &TrackStateChange| sink.lock().unwrap().push(c.clone()));

        let report = f.queue.tend().unwrap().await.unwrap();
        assert_eq!(
            report,
            TendReport {
                attempted: 2,
                uploaded: 2,
                failed: 0
            }
        );
        assert!(!f.queue.is_armed());
        assert!(!f.queue.is_tending());
        for t in &f.tracks {
            assert_eq!(f.registry.get_state(t), TrackState::Uploaded);
            assert_eq!(f.queue.completed(t).unwrap().track_id, t.file_name());
        }

        f.registry.changes().flush();
        f.registry.changes().unsubscribe(sub);
        // No file skips a state
        for t in &f.tracks {
            let steps: Vec<(TrackState, TrackState)> = seen
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.path == t.path())
                .map(|c| (c.from, c.to))
                .collect();
            assert_eq!(
                steps,
                vec![
                    (TrackState::NotUploaded, TrackState::Queued),
                    (TrackState::Queued, TrackState::Uploading),
                    (TrackState::Uploading, TrackState::Uploaded),
                ]
            );
        }

        // Uploaded files leave the scan path
        for t in &f.tracks {
            assert!(!t.path().exists());
            assert!(f
                .queue
                .track_dir()
                .join(crate::tracks::track_file::SYNCED_DIR)
                .join(t.file_name())
                .exists());
        }

        // Nothing left to do
        let again = f.queue.tend().unwrap().await.unwrap();
        assert_eq!(again, TendReport::default());
        assert_eq!(uploader.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_arms_and_next_trigger_retries() {
        let uploader = Arc::new(FakeUploader::new(1));
        let f = fixture(uploader.clone(), &["track_2024-01-01_00-00-00.csv.gz"]);
        let track = &f.tracks[0];

        let first = f.queue.tend().unwrap().await.unwrap();
        assert_eq!(first.failed, 1);
        assert!(f.queue.is_armed());
        assert_eq!(f.registry.get_state(track), TrackState::NotUploaded);
        assert!(f.queue.completed(track).is_none());

        let second = f.queue.tend().unwrap().await.unwrap();
        assert_eq!(second.uploaded, 1);
        assert!(!f.queue.is_armed());
        assert_eq!(f.registry.get_state(track), TrackState::Uploaded);
        assert_eq!(uploader.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_dropped() {
        let gate = Arc::new(Notify::new());
        let uploader = Arc::new(FakeUploader::gated(gate.clone()));
        let f = fixture(uploader.clone(), &["track_2024-01-01_00-00-00.csv.gz"]);

        let running = f.queue.tend().unwrap();
        // Let the pass reach the gated upload
        while uploader.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(f.queue.is_tending());
        assert!(f.queue.tend().is_none());

        gate.notify_one();
        let report = running.await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(uploader.calls(), 1);
        assert!(!f.queue.is_tending());
    }

    #[tokio::test]
    async fn test_recording_track_is_not_uploaded() {
        let uploader = Arc::new(FakeUploader::new(0));
        let f = fixture(
            uploader.clone(),
            &[
                "track_2024-01-01_00-00-00.csv.gz",
                "track_2024-01-02_00-00-00.csv.gz",
            ],
        );
        f.registry
            .set_state(&f.tracks[1], TrackState::Recording)
            .unwrap();

        let report = f.queue.tend().unwrap().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.registry.get_state(&f.tracks[0]), TrackState::Uploaded);
        assert_eq!(f.registry.get_state(&f.tracks[1]), TrackState::Recording);
    }

    #[tokio::test]
    async fn test_missing_token_leaves_tracks_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let track = TrackFile::new(dir.path().join("track_2024-01-01_00-00-00.csv.gz"));
        std::fs::write(track.path(), b"x").unwrap();
        let registry = Arc::new(TrackStateRegistry::new());
        let queue = UploadQueue::new(
            registry.clone(),
            dir.path(),
            Arc::new(FakeUploader::new(0)),
            Arc::new(StaticToken(String::new())),
            AuthSignal::new(AuthState::SignedIn),
            Handle::current(),
        );

        let report = queue.tend().unwrap().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(queue.is_armed());
        assert_eq!(registry.get_state(&track), TrackState::NotUploaded);
    }

    #[tokio::test]
    async fn test_upload_outcome_survives_a_new_queue() {
        let uploader = Arc::new(FakeUploader::new(0));
        let f = fixture(uploader.clone(), &["track_2024-01-01_00-00-00.csv.gz"]);
        assert_eq!(f.queue.tend().unwrap().await.unwrap().uploaded, 1);

        // A later process: fresh registry, fresh queue, same directory
        let registry = Arc::new(TrackStateRegistry::new());
        let queue = UploadQueue::new(
            registry.clone(),
            f.queue.track_dir(),
            uploader.clone(),
            Arc::new(StaticToken("tok".to_string())),
            AuthSignal::new(AuthState::SignedIn),
            Handle::current(),
        );
        let report = queue.tend().unwrap().await.unwrap();
        assert_eq!(report, TendReport::default());
        assert_eq!(uploader.calls(), 1);
        assert!(registry.list_tracks(queue.track_dir()).unwrap().is_empty());
    }

    struct PanickingUploader;

    impl Uploader for PanickingUploader {
        fn upload<'a>(
            &'a self,
            _track: &'a TrackFile,
            _token: &'a str,
        ) -> BoxFuture<'a, Result<CloudData, UploadError>> {
            async move { panic!("transport bug") }.boxed()
        }
    }

    #[tokio::test]
    async fn test_panicking_pass_releases_tender() {
        let f = fixture(Arc::new(PanickingUploader), &["track_2024-01-01_00-00-00.csv.gz"]);

        let pass = f.queue.tend().unwrap();
        assert!(pass.await.is_err());
        assert!(!f.queue.is_tending());
        assert!(f.queue.is_armed());
        assert!(f.queue.tend().is_some());
    }

    #[tokio::test]
    async fn test_signed_out_is_not_signed_in_error() {
        let f = fixture(Arc::new(FakeUploader::new(0)), &[]);
        assert_eq!(f.queue.inner.ensure_signed_in(), Ok(()));
        f.auth.set(AuthState::SignedOut);
        assert_eq!(f.queue.inner.ensure_signed_in(), Err(UploadError::NotSignedIn));
    }
}
