//! Sensors → fusion → recorder → upload queue, end to end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;

use flight_tracker_rs::altimeter::{altitude_to_pressure, AltitudeFusionEngine};
use flight_tracker_rs::bus::Topic;
use flight_tracker_rs::cloud::{
    AuthSignal, AuthState, CloudData, StaticToken, UploadError, UploadManager, UploadQueue,
    Uploader,
};
use flight_tracker_rs::config::{FusionConfig, LocationPreferences};
use flight_tracker_rs::location::{
    BluetoothLocationSource, LocationArbitrator, LocationMode, LocationSource,
    NmeaLocationSource, PlatformLocationSource,
};
use flight_tracker_rs::nmea::with_checksum;
use flight_tracker_rs::storage::{FixedDirectory, StorageDirResolver};
use flight_tracker_rs::tracks::{
    read_session, RecorderEvent, SessionSummary, TrackFile, TrackRecorder, TrackState,
    TrackStateRegistry,
};
use flight_tracker_rs::types::{PressureSample, SensorKind, SensorSample};

/// Accepts a file only if it decodes as a complete session.
struct VerifyingUploader {
    uploaded: Mutex<Vec<SessionSummary>>,
}

impl Uploader for VerifyingUploader {
    fn upload<'a>(
        &'a self,
        track: &'a TrackFile,
        token: &'a str,
    ) -> BoxFuture<'a, Result<CloudData, UploadError>> {
        async move {
            assert_eq!(token, "secret");
            let log = read_session(track.path())
                .map_err(|e| UploadError::Io(e.to_string()))?;
            assert_eq!(log.skipped, 0);
            self.uploaded
                .lock()
                .unwrap()
                .push(SessionSummary::from_log(&log));
            Ok(CloudData {
                track_id: "t-1".to_string(),
                track_url: "https://base-line.ws/tracks/t-1".to_string(),
            })
        }
        .boxed()
    }
}

fn rmc(second: u32) -> String {
    with_checksum(&format!(
        "GPRMC,1200{second:02}.00,A,4807.038,N,01131.000,E,019.4,090.0,230394,003.1,W"
    ))
}

fn gga(second: u32, altitude: f64) -> String {
    with_checksum(&format!(
        "GPGGA,1200{second:02}.00,4807.038,N,01131.000,E,1,08,0.9,{altitude:.1},M,46.9,M,,"
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recorded_session_is_uploaded_after_stop() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(TrackStateRegistry::new());

    // Fusion and location
    let engine = Arc::new(AltitudeFusionEngine::new(FusionConfig {
        sensor_variance: 1.0,
        acceleration_variance: 1.0,
        ..FusionConfig::default()
    }));
    engine.start();
    let nmea = Arc::new(NmeaLocationSource::new(None));
    let platform = Arc::new(PlatformLocationSource::new());
    let arbitrator = LocationArbitrator::new(
        nmea.clone(),
        platform.clone(),
        Arc::new(BluetoothLocationSource::new()),
        engine.clone(),
    );
    arbitrator.start(&LocationPreferences::default()).unwrap();
    assert_eq!(arbitrator.mode(), LocationMode::Platform);

    // Recorder
    let sensors: Topic<SensorSample> = Topic::new("sensors");
    let recorder = TrackRecorder::new(registry.clone());
    recorder.attach(engine.altitudes(), arbitrator.fixes(), &sensors);
    let resolver: Arc<dyn StorageDirResolver> = Arc::new(FixedDirectory::new(dir.path()));
    recorder.start(resolver).join().unwrap();

    // Upload side, signed in from the start
    let uploader = Arc::new(VerifyingUploader {
        uploaded: Mutex::new(Vec::new()),
    });
    let queue = UploadQueue::new(
        registry.clone(),
        dir.path(),
        uploader.clone(),
        Arc::new(StaticToken("secret".to_string())),
        AuthSignal::new(AuthState::SignedIn),
        Handle::current(),
    );
    let manager = UploadManager::new(queue, recorder.events());
    if let Some(startup) = manager.start() {
        assert_eq!(startup.await.unwrap().attempted, 0);
    }

    let stops = Arc::new(Mutex::new(Vec::new()));
    let sink = stops.clone();
    let _events = recorder.events().subscribe(move |e: &RecorderEvent| {
        if let RecorderEvent::Stopped(track) = e {
            sink.lock().unwrap().push(track.clone());
        }
    });

    let track = recorder.start_logging().unwrap();
    assert_eq!(registry.get_state(&track), TrackState::Recording);
    // A file being written is invisible to directory scans
    assert!(registry.list_tracks(dir.path()).unwrap().is_empty());

    // Ten seconds of a steady 2 m/s climb at 10 Hz, GPS at 1 Hz
    let base_millis = 764_337_600_000i64;
    for i in 0..100i64 {
        let t = i as f64 * 0.1;
        let pressure = altitude_to_pressure(500.0 + 2.0 * t);
        engine
            .submit_pressure(PressureSample::new(
                i * 100_000_000,
                base_millis + i * 100,
                pressure,
            ))
            .unwrap();
        sensors.publish(SensorSample::new(
            SensorKind::Accelerometer,
            base_millis + i * 100,
            i * 100_000_000,
            0.0,
            0.0,
            9.81,
        ));
        if i % 10 == 0 {
            let second = (i / 10) as u32;
            nmea.feed_line(&gga(second, 545.0 + 2.0 * t));
            nmea.feed_line(&rmc(second));
        }
    }
    assert!(nmea.nmea_received());

    nmea.fixes().flush();
    platform.fixes().flush();
    arbitrator.stop();
    engine.stop();
    engine.altitudes().flush();
    arbitrator.fixes().flush();
    sensors.flush();

    let status = engine.status();
    assert!((status.climb - 2.0).abs() < 0.5, "climb {}", status.climb);

    let finished = recorder.stop_logging().unwrap().unwrap();
    assert_eq!(finished, track);
    recorder.events().flush();
    assert_eq!(*stops.lock().unwrap(), vec![Some(track.clone())]);

    // The stop notification drives the upload
    let mut state = registry.get_state(&track);
    for _ in 0..500 {
        if state == TrackState::Uploaded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = registry.get_state(&track);
    }
    assert_eq!(state, TrackState::Uploaded);
    assert_eq!(
        manager.queue().completed(&track).unwrap().track_url,
        "https://base-line.ws/tracks/t-1"
    );
    assert!(!manager.queue().is_armed());

    let uploaded = uploader.uploaded.lock().unwrap().clone();
    assert_eq!(uploaded.len(), 1);
    let summary = &uploaded[0];
    assert_eq!(summary.altitude_rows, 100);
    assert_eq!(summary.location_rows, 10);
    assert_eq!(summary.sensor_rows, 100);
    let top = summary.max_pressure_altitude.unwrap();
    assert!((top - 519.8).abs() < 0.5, "max pressure altitude {top}");

    manager.stop();
}
