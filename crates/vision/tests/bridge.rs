use std::{
    future::poll_fn,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use actix_web::{
    App,
    body::{BoxBody, MessageBody},
    http::{StatusCode, header},
    rt,
    test as actix_test,
    web::Bytes,
};
use ml_core::ScriptedDetector;
use serde_json::{Value, json};
use video_ingest::{FrameSource, SyntheticSource};
use vision::{
    AlertLevel, Bridge, CaptureLoop, CycleOutcome, DetectionEvent, LiveConfig, VisionConfig,
    pipeline::{health::CaptureState, telemetry},
    server::{ServerState, configure, cors_headers},
};

const DEMO_COUNTS: [usize; 7] = [0, 0, 1, 3, 3, 9, 0];

fn config() -> VisionConfig {
    VisionConfig {
        width: 64,
        height: 48,
        stream_interval: Duration::from_millis(5),
        raw_interval: Duration::from_millis(5),
        ..VisionConfig::default()
    }
}

fn bridge() -> Bridge {
    let config = config();
    Bridge::new(LiveConfig::new(&config), config.bus_capacity)
}

fn server_state(bridge: &Bridge) -> ServerState {
    let config = config();
    ServerState {
        bridge: bridge.clone(),
        stream_interval: config.stream_interval,
        raw_interval: config.raw_interval,
        jpeg_quality: config.jpeg_quality,
    }
}

fn capture_with(
    bridge: &Bridge,
    source: impl FrameSource + 'static,
    detector: ScriptedDetector,
) -> CaptureLoop {
    CaptureLoop::new(
        Box::new(source),
        Box::new(detector),
        bridge.clone(),
        Arc::new(AtomicBool::new(false)),
    )
}

fn demo_capture(bridge: &Bridge) -> CaptureLoop {
    capture_with(
        bridge,
        SyntheticSource::new(80, 60),
        ScriptedDetector::new(DEMO_COUNTS.to_vec()),
    )
}

async fn next_chunk(body: &mut Pin<Box<BoxBody>>) -> Bytes {
    rt::time::timeout(
        Duration::from_secs(5),
        poll_fn(|cx| body.as_mut().poll_next(cx)),
    )
    .await
    .expect("stream produced no part in time")
    .expect("stream ended")
    .expect("stream errored")
}

fn part_sequence(part: &[u8]) -> u64 {
    let text = String::from_utf8_lossy(part);
    text.lines()
        .find_map(|line| line.strip_prefix("X-Sequence: "))
        .and_then(|value| value.trim().parse().ok())
        .expect("part carries an X-Sequence header")
}

#[actix_web::test]
async fn fifty_cycle_demo_run() {
    let bridge = bridge();
    let mut capture = demo_capture(&bridge);
    let app = actix_test::init_service(
        App::new()
            .wrap(cors_headers())
            .configure(configure(server_state(&bridge))),
    )
    .await;

    for _ in 0..6 {
        capture.run_cycle().unwrap();
    }

    let body: Value = actix_test::call_and_read_body_json(
        &app,
        actix_test::TestRequest::get().uri("/api/detections").to_request(),
    )
    .await;
    assert_eq!(body["vehicle_count"], 9);
    assert_eq!(body["alert_triggered"], 2);
    assert_eq!(body["alert_level"], "high");
    assert_eq!(body["frame_sequence"], 6);
    assert_eq!(body["detections"].as_array().unwrap().len(), 9);
    let first = &body["detections"][0];
    assert_eq!(first["class"], "car");
    assert_eq!(first["bbox"].as_array().unwrap().len(), 4);

    let req = actix_test::TestRequest::get().uri("/stream").to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "multipart/x-mixed-replace; boundary=frame"
    );
    let mut stream = Box::pin(resp.into_body());
    let part = next_chunk(&mut stream).await;
    assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
    assert!(part_sequence(&part) >= 6);

    for _ in 6..50 {
        capture.run_cycle().unwrap();
    }
    let body: Value = actix_test::call_and_read_body_json(
        &app,
        actix_test::TestRequest::get().uri("/api/detections").to_request(),
    )
    .await;
    assert_eq!(body["frame_sequence"], 50);
    // Cycle 50 replays the first entry of the seven step script.
    assert_eq!(body["vehicle_count"], DEMO_COUNTS[49 % DEMO_COUNTS.len()]);
    assert_eq!(body["alert_level"], "none");

    let part = next_chunk(&mut stream).await;
    assert!(part_sequence(&part) > 6);
}

#[actix_web::test]
async fn config_round_trip() {
    let bridge = bridge();
    let mut capture = capture_with(
        &bridge,
        SyntheticSource::new(64, 48),
        ScriptedDetector::new(vec![9]),
    );
    let app =
        actix_test::init_service(App::new().configure(configure(server_state(&bridge)))).await;

    let req = actix_test::TestRequest::post()
        .uri("/api/config")
        .set_json(json!({"confidence": 0.86, "area_threshold": 0.2, "unknown": true}))
        .to_request();
    let body: Value = actix_test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({"status": "success"}));

    let view: Value = actix_test::call_and_read_body_json(
        &app,
        actix_test::TestRequest::get().uri("/api/config").to_request(),
    )
    .await;
    assert!((view["confidence"].as_f64().unwrap() - 0.86).abs() < 1e-6);
    assert!((view["area_threshold"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    assert!((view["iou_threshold"].as_f64().unwrap() - 0.45).abs() < 1e-6);
    assert_eq!(view["target_width"], 64);
    assert_eq!(view["alert_high_min"], 8);
    assert!(view.get("unknown").is_none());

    for bad in [json!({"confidence": "high"}), json!({"iou_threshold": 1.5})] {
        let req = actix_test::TestRequest::post()
            .uri("/api/config")
            .set_json(bad)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().is_some());
    }
    let thresholds = bridge.live.thresholds();
    assert!((thresholds.confidence - 0.86).abs() < 1e-6);
    assert!((thresholds.iou_threshold - 0.45).abs() < 1e-6);

    // The next cycle runs with the updated confidence: only the two 0.9 boxes
    // of the nine scripted ones survive.
    capture.run_cycle().unwrap();
    let event = bridge.read_latest_event().unwrap();
    assert_eq!(event.detections.len(), 2);
    assert_eq!(event.alert_level, AlertLevel::Low);
}

#[test]
fn event_never_ahead_of_visible_frame() {
    let bridge = bridge();
    let (_handle, events) = bridge.bus.subscribe_channel("ordering");
    let shutdown = Arc::new(AtomicBool::new(false));
    let capture = CaptureLoop::new(
        Box::new(SyntheticSource::new(64, 48).with_limit(300)),
        Box::new(ScriptedDetector::new(DEMO_COUNTS.to_vec())),
        bridge.clone(),
        shutdown,
    );
    let worker = thread::spawn(move || capture.run());

    let mut checked = 0;
    let mut last = 0;
    while let Ok(event) = events.recv_timeout(Duration::from_secs(2)) {
        assert!(event.sequence > last);
        last = event.sequence;
        let annotated = bridge.annotated.latest_sequence().unwrap();
        let raw = bridge.raw.latest_sequence().unwrap();
        assert!(annotated >= event.sequence);
        assert!(raw >= event.sequence);
        checked += 1;
    }
    worker.join().unwrap();
    assert!(checked > 0);
    assert_eq!(bridge.read_latest_event().unwrap().sequence, 300);
}

#[actix_web::test]
async fn slow_consumers_do_not_slow_capture() {
    let bridge = bridge();
    bridge
        .bus
        .subscribe(
            "sluggish",
            Box::new(|_: &DetectionEvent| {
                thread::sleep(Duration::from_millis(200));
                Ok(())
            }),
        )
        .unwrap();
    let app =
        actix_test::init_service(App::new().configure(configure(server_state(&bridge)))).await;
    let mut capture = capture_with(
        &bridge,
        SyntheticSource::new(80, 60),
        ScriptedDetector::new(DEMO_COUNTS.to_vec()).with_latency(Duration::from_millis(5)),
    );
    capture.run_cycle().unwrap();

    // A client that only takes a part every 100 ms, polled alongside capture.
    let resp = actix_test::call_service(
        &app,
        actix_test::TestRequest::get().uri("/stream/raw").to_request(),
    )
    .await;
    let mut lagging = Box::pin(resp.into_body());
    next_chunk(&mut lagging).await;
    let parts_read = Arc::new(AtomicUsize::new(1));
    let reader_count = parts_read.clone();
    let reader = rt::spawn(async move {
        loop {
            rt::time::sleep(Duration::from_millis(100)).await;
            next_chunk(&mut lagging).await;
            reader_count.fetch_add(1, Ordering::SeqCst);
        }
    });

    let mut slowest = Duration::ZERO;
    for _ in 0..30 {
        let started = Instant::now();
        capture.run_cycle().unwrap();
        slowest = slowest.max(started.elapsed());
        // Hand the runtime to the reader between cycles.
        rt::time::sleep(Duration::from_millis(10)).await;
    }
    reader.abort();

    assert!(
        slowest < Duration::from_millis(150),
        "capture cycle took {slowest:?}"
    );
    assert!(
        parts_read.load(Ordering::SeqCst) >= 2,
        "reader should keep receiving parts while capture runs"
    );
    assert_eq!(bridge.read_latest_frame().unwrap().sequence, 31);
}

#[test]
fn slow_subscriber_ends_on_latest_event() {
    let bridge = bridge();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bridge
        .bus
        .subscribe(
            "slow",
            Box::new(move |event: &DetectionEvent| {
                thread::sleep(Duration::from_millis(20));
                sink.lock().unwrap().push(event.sequence);
                Ok(())
            }),
        )
        .unwrap();
    let mut capture = demo_capture(&bridge);
    for _ in 0..100 {
        capture.run_cycle().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().last() != Some(&100) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.len() < 100, "slow subscriber should have skipped events");
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
}

#[actix_web::test]
async fn capture_failure_keeps_last_data_available() {
    let bridge = bridge();
    let mut capture = capture_with(
        &bridge,
        SyntheticSource::new(64, 48).with_limit(5),
        ScriptedDetector::new(vec![3]),
    );
    let app =
        actix_test::init_service(App::new().configure(configure(server_state(&bridge)))).await;

    for _ in 0..5 {
        capture.run_cycle().unwrap();
    }
    let status: Value = actix_test::call_and_read_body_json(
        &app,
        actix_test::TestRequest::get().uri("/api/status").to_request(),
    )
    .await;
    assert_eq!(status["processing"], true);
    assert_eq!(status["camera_connected"], true);
    assert_eq!(status["model_loaded"], true);

    let err = capture.run_cycle().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(bridge.health.state(), CaptureState::Failed);

    let status: Value = actix_test::call_and_read_body_json(
        &app,
        actix_test::TestRequest::get().uri("/api/status").to_request(),
    )
    .await;
    assert_eq!(status["processing"], false);
    assert_eq!(status["camera_connected"], false);

    let body: Value = actix_test::call_and_read_body_json(
        &app,
        actix_test::TestRequest::get().uri("/api/detections").to_request(),
    )
    .await;
    assert_eq!(body["frame_sequence"], 5);
    assert_eq!(body["vehicle_count"], 3);
}

#[actix_web::test]
async fn detection_failure_reports_zero_and_continues() {
    let bridge = bridge();
    let mut capture = capture_with(
        &bridge,
        SyntheticSource::new(64, 48),
        ScriptedDetector::new(vec![3]).fail_on(2),
    );
    let app =
        actix_test::init_service(App::new().configure(configure(server_state(&bridge)))).await;

    let mut counts = Vec::new();
    for _ in 0..4 {
        let outcome = capture.run_cycle().unwrap();
        let CycleOutcome::Published { detections, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        counts.push(detections);
        if counts.len() == 3 {
            let body: Value = actix_test::call_and_read_body_json(
                &app,
                actix_test::TestRequest::get().uri("/api/detections").to_request(),
            )
            .await;
            assert_eq!(body["vehicle_count"], 0);
            assert_eq!(body["processing_time"], 0.0);
            assert_eq!(body["frame_sequence"], 3);
        }
    }
    assert_eq!(counts, vec![3, 3, 0, 3]);
    assert_eq!(bridge.health.state(), CaptureState::Running);
}

#[actix_web::test]
async fn metrics_endpoint_exposes_capture_metrics() {
    let installed = telemetry::init_metrics_recorder().is_some();
    let bridge = bridge();
    let mut capture = demo_capture(&bridge);
    capture.run_cycle().unwrap();
    capture.run_cycle().unwrap();

    let app =
        actix_test::init_service(App::new().configure(configure(server_state(&bridge)))).await;
    let req = actix_test::TestRequest::get().uri("/metrics").to_request();
    let resp = actix_test::call_service(&app, req).await;
    if installed {
        assert_eq!(resp.status(), StatusCode::OK);
        let body = actix_test::read_body(resp).await;
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("vision_capture_cycle_seconds"));
        assert!(text.contains("vision_pipeline_fps"));
    } else {
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
