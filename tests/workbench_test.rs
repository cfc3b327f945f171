//! Operation surface of the workbench over mock transports.

use gse_daq::instrument::{
    ArraySimulator, BusJig, DataLogger, PowerSensor, RepeatSetting,
};
use gse_daq::procedure::ObservationPlan;
use gse_daq::protocol::sas_frame::{OutputSetting, OutputState};
use gse_daq::remote::{LoggerFtpClient, MemoryConnector, RemoteCredentials, RemoteSessionAdapter};
use gse_daq::transport::{MockTransport, TransportChannel};
use gse_daq::workbench::{RemoteHost, Workbench, UNEXPECTED_MESSAGE};
use std::sync::Arc;
use std::time::Duration;

fn channel(mock: &MockTransport) -> TransportChannel {
    TransportChannel::new(Box::new(mock.clone()), Duration::from_millis(50))
}

async fn wait_until(busy: impl Fn() -> bool) {
    while busy() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_bus_jig_requires_connection() {
    let mock = MockTransport::new("COM4");
    let bench = Workbench::builder().bus_jig(BusJig::new(channel(&mock))).build();

    let outcome = bench.bus_jig_enable(true).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("Bus jig is not open"));

    assert_eq!(bench.connect_bus_jig().await.data, Some(true));
    let outcome = bench.bus_jig_enable(true).await;
    assert!(outcome.data.unwrap().is_enabled);

    assert_eq!(bench.disconnect_bus_jig().await.data, Some(false));
}

#[tokio::test]
async fn test_array_simulator_range_error_keeps_previous_setting() {
    let mock = MockTransport::new("COM5");
    let bench = Workbench::builder()
        .array_simulator(
            ArraySimulator::new(channel(&mock)),
            OutputSetting::default(),
            RepeatSetting::default(),
        )
        .build();
    bench.connect_array_simulator().await;

    let good = OutputSetting {
        voc: 80.0,
        isc: 2.0,
        fill_factor: 0.75,
    };
    let status = bench
        .sas_set_output(OutputState::On, Some(good))
        .await
        .data
        .unwrap();
    assert!(status.is_on);
    assert_eq!(mock.written().len(), 1);

    let bad = OutputSetting { voc: 49.9, ..good };
    let status = bench
        .sas_set_output(OutputState::On, Some(bad))
        .await
        .data
        .unwrap();
    assert!(status.is_range_error);
    assert_eq!(status.output_setting, good);
    assert_eq!(mock.written().len(), 1);

    let status = bench.sas_set_output(OutputState::Off, Some(good)).await.data.unwrap();
    assert!(!status.is_on);
    assert_eq!(status.output_setting, OutputSetting::default());
}

#[tokio::test]
async fn test_data_logger_fetch_strips_identity() {
    let mock = MockTransport::new("TCPIP0::10.0.0.3::8023::SOCKET");
    mock.respond_to("*IDN?", "*IDN GRAPHTEC,GL840,1,2.03\r\n");
    mock.respond_to(":MEAS:OUTP:ACK?", "#6000011+1.234,+5.6\r\n");
    let bench = Workbench::builder()
        .data_logger(DataLogger::new(channel(&mock)).unwrap())
        .build();

    assert_eq!(bench.connect_data_logger().await.data, Some(true));
    let data = bench.data_logger_fetch(true).await.data.unwrap();
    assert_eq!(data, b"#6000011+1.234,+5.6\r\n".to_vec());
}

#[tokio::test]
async fn test_logger_ftp_unreachable_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let bench = Workbench::builder()
        .logger_ftp(LoggerFtpClient::new("127.0.0.1", port, Duration::from_secs(1)))
        .build();

    let outcome = bench.data_logger_list_files("SD1\\DATA").await;
    assert!(!outcome.success);
    let message = outcome.error.unwrap();
    assert!(message.starts_with("Remote error: Failed to connect to 127.0.0.1"));
}

#[tokio::test]
async fn test_observation_is_single_flight() {
    let mock = MockTransport::new("TCPIP0::10.0.0.4::5025::SOCKET");
    mock.respond_to("*IDN?", "Keysight Technologies,U2002A,MY12345678,A1.03.05\n");
    mock.respond_to("fetc?", "-4.000000E+01\n");
    let bench = Workbench::builder()
        .power_sensor(PowerSensor::new(channel(&mock)).unwrap())
        .build();
    bench.connect_power_sensor().await;

    let plan = ObservationPlan {
        warmup: Duration::ZERO,
        samples: 3,
        sample_interval: Duration::from_millis(20),
        capture_trace: false,
    };
    let first = bench.start_observation(Some(plan));
    assert!(first.success);

    let second = bench.start_observation(Some(plan));
    assert!(!second.success);
    assert_eq!(
        second.error.as_deref(),
        Some("Observation procedure is already running")
    );

    wait_until(|| bench.observation_busy()).await;
    let report = bench.observation_report().data.unwrap();
    assert_eq!(Some(report.run_id), first.data);
    assert!(!report.cancelled);
    assert_eq!(report.result.unwrap().samples.len(), 3);
}

#[tokio::test]
async fn test_cancel_observation_publishes_partial_report() {
    let mock = MockTransport::new("mock");
    mock.respond_to("*IDN?", "Keysight Technologies,U2002A,MY12345678,A1.03.05\n");
    mock.respond_to("fetc?", "-4.000000E+01\n");
    let bench = Workbench::builder()
        .power_sensor(PowerSensor::new(channel(&mock)).unwrap())
        .build();
    bench.connect_power_sensor().await;

    let plan = ObservationPlan {
        warmup: Duration::ZERO,
        samples: 1000,
        sample_interval: Duration::from_millis(10),
        capture_trace: false,
    };
    assert!(bench.start_observation(Some(plan)).success);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bench.cancel_observation().success);
    wait_until(|| bench.observation_busy()).await;

    let report = bench.observation_report().data.unwrap();
    assert!(report.cancelled);
    let samples = report.result.unwrap().samples.len();
    assert!(samples > 0 && samples < 1000);

    assert!(!bench.cancel_observation().success);
}

#[tokio::test]
async fn test_remote_processing_fetches_outputs() {
    let connector = MemoryConnector::new();
    connector.add_file("rec/pass_07/iq.bin", b"\x01\x02");
    let adapter = RemoteSessionAdapter::new(
        RemoteCredentials::new("10.0.0.9", 22, "qdra", "hunter2-secret"),
        Arc::new(connector.clone()),
    );
    let bench = Workbench::builder()
        .remote(RemoteHost {
            adapter,
            script_dir: "proc".into(),
            script: "proc/convert.sh".into(),
        })
        .build();
    let local = tempfile::tempdir().unwrap();

    assert!(bench
        .start_remote_processing("pass_07", "rec/pass_07", local.path())
        .success);
    wait_until(|| bench.remote_processing_busy()).await;

    let report = bench.remote_processing_report().data.unwrap();
    assert_eq!(report.result.unwrap().fetched.len(), 1);
    assert_eq!(
        connector.executed()[0].1.as_deref(),
        Some("hunter2-secret")
    );
    assert_eq!(connector.executed()[0].0, "cd ~/proc ; ~/proc/convert.sh pass_07");
    assert!(local.path().join("iq.bin").exists());
}

fn processing_bench(connector: &MemoryConnector) -> Workbench {
    let adapter = RemoteSessionAdapter::new(
        RemoteCredentials::new("10.0.0.9", 22, "qdra", "pw"),
        Arc::new(connector.clone()),
    );
    Workbench::builder()
        .remote(RemoteHost {
            adapter,
            script_dir: "proc".into(),
            script: "proc/convert.sh".into(),
        })
        .build()
}

#[tokio::test]
async fn test_processing_report_hides_local_failure_detail() {
    let connector = MemoryConnector::new();
    connector.add_file("rec/pass_08/iq.bin", b"\x01");
    let bench = processing_bench(&connector);
    let blocker = tempfile::NamedTempFile::new().unwrap();
    // a regular file cannot be used as a directory
    let local_dir = blocker.path().join("out");

    assert!(bench
        .start_remote_processing("pass_08", "rec/pass_08", &local_dir)
        .success);
    wait_until(|| bench.remote_processing_busy()).await;

    let outcome = bench.remote_processing_report();
    let json = serde_json::to_string(&outcome).unwrap();
    let report = outcome.data.unwrap();
    assert_eq!(report.error.as_deref(), Some(UNEXPECTED_MESSAGE));
    assert!(report.result.unwrap().script.is_some());
    assert!(!json.contains(&blocker.path().display().to_string()));
}

#[tokio::test]
async fn test_observation_report_keeps_samples_after_disconnect() {
    let mock = MockTransport::new("mock");
    mock.respond_to("*IDN?", "Keysight Technologies,U2002A,MY12345678,A1.03.05\n");
    mock.respond_to("fetc?", "-4.000000E+01\n");
    let bench = Workbench::builder()
        .power_sensor(PowerSensor::new(channel(&mock)).unwrap())
        .build();
    bench.connect_power_sensor().await;

    let plan = ObservationPlan {
        warmup: Duration::ZERO,
        samples: 1000,
        sample_interval: Duration::from_millis(10),
        capture_trace: false,
    };
    assert!(bench.start_observation(Some(plan)).success);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bench.disconnect_power_sensor().await.data, Some(false));
    wait_until(|| bench.observation_busy()).await;

    let report = bench.observation_report().data.unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.error.as_deref(), Some("Power sensor is not open"));
    let samples = report.result.unwrap().samples.len();
    assert!(samples > 0 && samples < 1000);
}
