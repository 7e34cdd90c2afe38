//! End-to-end acquisition scenarios against an in-process simulated
//! device: single and block reads, NaN diagnostics, timeout recovery and
//! sink delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::net::UnixDatagram;
use tokio::time::timeout;

use acqsrv::acquisition::service::ServiceEvent;
use acqsrv::config::{AcquisitionConfig, AppConfig, ResilienceConfig};
use acqsrv::error::ErrorKind;
use acqsrv::point::{DataType, Point, Value};
use acqsrv::protocols::modbus::simulator::{SimulatedDevice, SimulatorBehavior};
use acqsrv::AcquisitionService;

fn test_point(name: &str, port: u16, address: u16, data_type: DataType) -> Point {
    Point {
        name: name.into(),
        host: "127.0.0.1".into(),
        port,
        unit_id: 1,
        address,
        data_type,
        poll_interval_ms: 100,
        measurement: "telemetry".into(),
        tags: BTreeMap::new(),
        enabled: true,
    }
}

fn test_config(points: Vec<Point>, socket_path: &str) -> AppConfig {
    AppConfig {
        resilience: ResilienceConfig {
            auto_adjust: false,
            connection_timeout_ms: 1000,
            request_timeout_ms: 1000,
            ..ResilienceConfig::default()
        },
        acquisition: AcquisitionConfig {
            telegraf_socket_path: socket_path.into(),
            default_poll_ms: 500,
            ..AcquisitionConfig::default()
        },
        points,
    }
}

async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<ServiceEvent>,
    what: &str,
    pred: impl Fn(&ServiceEvent) -> bool,
) -> ServiceEvent {
    timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed while waiting for {what}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// S1: a single Float32 point decodes to pi and reaches the collector
/// as one line-protocol datagram.
#[tokio::test]
async fn single_float32_point_flows_to_sink() {
    let device = SimulatedDevice::start(SimulatorBehavior {
        holding_registers: vec![(104, vec![0x4049, 0x0FDB])],
        ..Default::default()
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("telegraf.sock");
    let collector = UnixDatagram::bind(&socket_path).unwrap();

    let config = test_config(
        vec![test_point("boiler_pressure", device.port(), 104, DataType::Float32)],
        socket_path.to_str().unwrap(),
    );
    let service = AcquisitionService::new(config);
    let mut events = service.subscribe();
    service.start().await.unwrap();

    let event = wait_for_event(&mut events, "sample", |e| {
        matches!(e, ServiceEvent::SampleAcquired(_))
    })
    .await;
    let ServiceEvent::SampleAcquired(sample) = event else {
        unreachable!()
    };
    assert_eq!(sample.point_name, "boiler_pressure");
    assert!(sample.valid);
    match sample.value {
        Value::F32(v) => assert!((v - std::f32::consts::PI).abs() < 1e-5),
        other => panic!("unexpected value {other:?}"),
    }

    // The record arrives as exactly one datagram.
    let mut buf = [0u8; 1024];
    let n = timeout(Duration::from_secs(5), collector.recv(&mut buf))
        .await
        .expect("no datagram received")
        .unwrap();
    let record = std::str::from_utf8(&buf[..n]).unwrap();
    assert!(record.starts_with("telemetry,"));
    assert!(record.contains("value=3.14159"));
    assert!(record.ends_with('\n'));

    wait_for_event(&mut events, "sample sent", |e| {
        matches!(e, ServiceEvent::SampleSent { ok: true, .. })
    })
    .await;

    service.stop().await;
}

/// S2: three adjacent registers are planned into one block and come back
/// as three samples in address order.
#[tokio::test]
async fn block_read_emits_samples_in_address_order() {
    let device = SimulatedDevice::start(SimulatorBehavior {
        holding_registers: vec![(101, vec![7, 8, 9])],
        ..Default::default()
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("telegraf.sock");
    let _collector = UnixDatagram::bind(&socket_path).unwrap();

    let config = test_config(
        vec![
            test_point("r101", device.port(), 101, DataType::Reg16),
            test_point("r102", device.port(), 102, DataType::Reg16),
            test_point("r103", device.port(), 103, DataType::Reg16),
        ],
        socket_path.to_str().unwrap(),
    );
    let service = AcquisitionService::new(config);
    let mut events = service.subscribe();
    service.start().await.unwrap();

    let mut samples = Vec::new();
    while samples.len() < 3 {
        let event = wait_for_event(&mut events, "block samples", |e| {
            matches!(e, ServiceEvent::SampleAcquired(_))
        })
        .await;
        let ServiceEvent::SampleAcquired(sample) = event else {
            unreachable!()
        };
        samples.push(sample);
    }

    assert_eq!(samples[0].point_name, "r101");
    assert_eq!(samples[0].value, Value::U16(7));
    assert_eq!(samples[1].point_name, "r102");
    assert_eq!(samples[1].value, Value::U16(8));
    assert_eq!(samples[2].point_name, "r103");
    assert_eq!(samples[2].value, Value::U16(9));

    // One transaction served all three points.
    let reads: Vec<_> = device
        .observed_requests()
        .into_iter()
        .filter(|r| r.function_code == 0x03)
        .collect();
    assert!(!reads.is_empty());
    assert_eq!(reads[0].address, 101);
    assert_eq!(reads[0].count, 3);

    service.stop().await;
}

/// S3: a NaN payload is flagged but the sample stays valid.
#[tokio::test]
async fn nan_float_is_diagnostic_not_fatal() {
    let device = SimulatedDevice::start(SimulatorBehavior {
        holding_registers: vec![(104, vec![0x7FC0, 0x0000])],
        ..Default::default()
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("telegraf.sock");
    let _collector = UnixDatagram::bind(&socket_path).unwrap();

    let config = test_config(
        vec![test_point("noisy", device.port(), 104, DataType::Float32)],
        socket_path.to_str().unwrap(),
    );
    let service = AcquisitionService::new(config);
    let mut events = service.subscribe();
    service.start().await.unwrap();

    let event = wait_for_event(&mut events, "NaN sample", |e| {
        matches!(e, ServiceEvent::SampleAcquired(_))
    })
    .await;
    let ServiceEvent::SampleAcquired(sample) = event else {
        unreachable!()
    };
    assert!(sample.valid);
    match sample.value {
        Value::F32(v) => assert!(v.is_nan()),
        other => panic!("unexpected value {other:?}"),
    }

    service.stop().await;
}

/// S4: a stalled device produces a request timeout, a disconnect, and a
/// recovery once the device answers again.
#[tokio::test]
async fn timeout_disconnects_then_recovers() {
    let device = SimulatedDevice::start(SimulatorBehavior {
        stall: true,
        ..Default::default()
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("telegraf.sock");
    let _collector = UnixDatagram::bind(&socket_path).unwrap();

    let config = test_config(
        vec![test_point("slow", device.port(), 10, DataType::Reg16)],
        socket_path.to_str().unwrap(),
    );
    let service = AcquisitionService::new(config);
    let mut events = service.subscribe();
    service.start().await.unwrap();

    // The timeout closes the socket first, then the classified error
    // follows in the stream.
    wait_for_event(&mut events, "disconnect", |e| {
        matches!(e, ServiceEvent::ConnectionStateChanged { connected: false, .. })
    })
    .await;

    wait_for_event(&mut events, "request timeout", |e| {
        matches!(
            e,
            ServiceEvent::ClassifiedError {
                kind: ErrorKind::RequestTimeout,
                ..
            }
        )
    })
    .await;

    // Let the device answer again; the next poll cycle reconnects.
    device.set_behavior(SimulatorBehavior {
        holding_registers: vec![(10, vec![42])],
        ..Default::default()
    });

    let event = wait_for_event(&mut events, "recovered sample", |e| {
        matches!(e, ServiceEvent::SampleAcquired(_))
    })
    .await;
    let ServiceEvent::SampleAcquired(sample) = event else {
        unreachable!()
    };
    assert_eq!(sample.value, Value::U16(42));

    service.stop().await;
}

/// A write submitted through the service completes and surfaces its
/// request id.
#[tokio::test]
async fn write_path_round_trip() {
    let device = SimulatedDevice::start(SimulatorBehavior::default()).await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("telegraf.sock");

    let config = test_config(
        vec![test_point("p", device.port(), 0, DataType::Reg16)],
        socket_path.to_str().unwrap(),
    );
    let service = AcquisitionService::new(config);
    let mut events = service.subscribe();
    service.start().await.unwrap();

    let request_id = service
        .submit_write(
            "127.0.0.1",
            device.port(),
            1,
            20,
            DataType::Reg16,
            Value::U16(777),
            acqsrv::point::RequestPriority::High,
            true,
        )
        .unwrap();

    let event = wait_for_event(&mut events, "write completion", |e| {
        matches!(e, ServiceEvent::WriteCompleted { .. })
    })
    .await;
    let ServiceEvent::WriteCompleted { request_id: id, ok, .. } = event else {
        unreachable!()
    };
    assert_eq!(id, request_id);
    assert!(ok);

    // FC06 with the expected payload reached the device.
    let writes: Vec<_> = device
        .observed_requests()
        .into_iter()
        .filter(|r| r.function_code == 0x06)
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].address, 20);

    service.stop().await;
}

/// Disabled points are never polled.
#[tokio::test]
async fn disabled_points_are_skipped() {
    let device = SimulatedDevice::start(SimulatorBehavior {
        holding_registers: vec![(0, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])],
        ..Default::default()
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("telegraf.sock");
    let _collector = UnixDatagram::bind(&socket_path).unwrap();

    let mut disabled = test_point("off", device.port(), 5, DataType::Reg16);
    disabled.enabled = false;

    let config = test_config(
        vec![test_point("on", device.port(), 1, DataType::Reg16), disabled],
        socket_path.to_str().unwrap(),
    );
    let service = AcquisitionService::new(config);
    let mut events = service.subscribe();
    service.start().await.unwrap();

    // Collect samples for a little while; none may come from the
    // disabled point.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut saw_enabled = false;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match timeout(remaining, events.recv()).await {
            Ok(Ok(ServiceEvent::SampleAcquired(sample))) => {
                assert_ne!(sample.point_name, "off");
                if sample.point_name == "on" {
                    saw_enabled = true;
                }
            },
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert!(saw_enabled);

    service.stop().await;
}
