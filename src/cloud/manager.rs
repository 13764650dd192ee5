//! Wires the three tend triggers: startup, sign-in and finished recordings.

use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;

use super::{AuthState, TendReport, UploadQueue};
use crate::bus::{Subscription, Topic};
use crate::tracks::RecorderEvent;

struct Triggers {
    auth_watcher: JoinHandle<()>,
    recorder_sub: Subscription,
}

pub struct UploadManager {
    queue: UploadQueue,
    recorder_events: Topic<RecorderEvent>,
    triggers: Mutex<Option<Triggers>>,
}

impl UploadManager {
    pub fn new(queue: UploadQueue, recorder_events: &Topic<RecorderEvent>) -> Self {
        Self {
            queue,
            recorder_events: recorder_events.clone(),
            triggers: Mutex::new(None),
        }
    }

    fn triggers(&self) -> MutexGuard<'_, Option<Triggers>> {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Install the triggers and run the startup tend. Returns the startup
    /// pass, if one was started.
    pub fn start(&self) -> Option<JoinHandle<TendReport>> {
        let mut triggers = self.triggers();
        if triggers.is_some() {
            log::warn!("[cloud] upload manager already started");
            return None;
        }

        let mut auth_rx = self.queue.auth().subscribe();
        auth_rx.borrow_and_update();
        let queue = self.queue.clone();
        let auth_watcher = self.queue.runtime().spawn(async move {
            while auth_rx.changed().await.is_ok() {
                let state = *auth_rx.borrow_and_update();
                if state == AuthState::SignedIn {
                    log::info!("[cloud] signed in, tending");
                    let _ = queue.tend();
                }
            }
        });

        let queue = self.queue.clone();
        let recorder_sub = self.recorder_events.subscribe(move |event| {
            if let RecorderEvent::Stopped(Some(track)) = event {
                if queue.auth().is_signed_in() {
                    log::info!("[cloud] auto syncing {}", track);
                    let _ = queue.tend();
                }
            }
        });

        *triggers = Some(Triggers {
            auth_watcher,
            recorder_sub,
        });
        drop(triggers);

        self.queue.tend()
    }

    /// Remove the triggers. A pass already running finishes on its own.
    pub fn stop(&self) {
        let Some(triggers) = self.triggers().take() else {
            log::warn!("[cloud] upload manager not started");
            return;
        };
        triggers.auth_watcher.abort();
        self.recorder_events.unsubscribe(triggers.recorder_sub);
    }

    pub fn is_running(&self) -> bool {
        self.triggers().is_some()
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        if let Some(triggers) = self.triggers().take() {
            triggers.auth_watcher.abort();
            self.recorder_events.unsubscribe(triggers.recorder_sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{AuthSignal, CloudData, StaticToken, UploadError, Uploader};
    use crate::tracks::{TrackFile, TrackState, TrackStateRegistry};
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::runtime::Handle;

    struct AlwaysOk;

    impl Uploader for AlwaysOk {
        fn upload<'a>(
            &'a self,
            track: &'a TrackFile,
            _token: &'a str,
        ) -> BoxFuture<'a, Result<CloudData, UploadError>> {
            let id = track.file_name();
            async move {
                Ok(CloudData {
                    track_url: format!("https://base-line.ws/tracks/{id}"),
                    track_id: id,
                })
            }
            .boxed()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        registry: Arc<TrackStateRegistry>,
        auth: AuthSignal,
        events: Topic<RecorderEvent>,
        manager: UploadManager,
    }

    fn fixture(initial: AuthState) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(TrackStateRegistry::new());
        let auth = AuthSignal::new(initial);
        let queue = UploadQueue::new(
            registry.clone(),
            dir.path(),
            Arc::new(AlwaysOk),
            Arc::new(StaticToken("tok".to_string())),
            auth.clone(),
            Handle::current(),
        );
        let events = Topic::new("recorder-test");
        let manager = UploadManager::new(queue, &events);
        Fixture {
            dir,
            registry,
            auth,
            events,
            manager,
        }
    }

    fn write_track(dir: &tempfile::TempDir, name: &str) -> TrackFile {
        let track = TrackFile::new(dir.path().join(name));
        std::fs::write(track.path(), b"x").unwrap();
        track
    }

    async fn wait_for_state(registry: &TrackStateRegistry, track: &TrackFile, want: TrackState) {
        for _ in 0..500 {
            if registry.get_state(track) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {}", track, want);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_tend() {
        let f = fixture(AuthState::SignedIn);
        let track = write_track(&f.dir, "track_2024-01-01_00-00-00.csv.gz");

        let report = f.manager.start().unwrap().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.registry.get_state(&track), TrackState::Uploaded);
        assert!(f.manager.start().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sign_in_triggers_tend() {
        let f = fixture(AuthState::SignedOut);
        let track = write_track(&f.dir, "track_2024-01-01_00-00-00.csv.gz");

        assert!(f.manager.start().is_none());
        f.auth.set(AuthState::SigningIn);
        f.auth.set(AuthState::SignedIn);
        wait_for_state(&f.registry, &track, TrackState::Uploaded).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recorder_stop_triggers_tend_while_signed_in() {
        let f = fixture(AuthState::SignedIn);
        if let Some(startup) = f.manager.start() {
            startup.await.unwrap();
        }

        let track = write_track(&f.dir, "track_2024-01-02_00-00-00.csv.gz");
        f.events.publish(RecorderEvent::Stopped(Some(track.clone())));
        wait_for_state(&f.registry, &track, TrackState::Uploaded).await;
        assert!(f.manager.queue().completed(&track).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_session_does_not_trigger() {
        let f = fixture(AuthState::SignedIn);
        if let Some(startup) = f.manager.start() {
            startup.await.unwrap();
        }

        let track = write_track(&f.dir, "track_2024-01-02_00-00-00.csv.gz");
        f.events.publish(RecorderEvent::Stopped(None));
        f.events.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.registry.get_state(&track), TrackState::NotUploaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_removes_triggers() {
        let f = fixture(AuthState::SignedOut);
        let track = write_track(&f.dir, "track_2024-01-01_00-00-00.csv.gz");

        let _ = f.manager.start();
        f.manager.stop();
        assert!(!f.manager.is_running());

        f.auth.set(AuthState::SignedIn);
        f.events.publish(RecorderEvent::Stopped(Some(track.clone())));
        f.events.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.registry.get_state(&track), TrackState::NotUploaded);
    }
}
