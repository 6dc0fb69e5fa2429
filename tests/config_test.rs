//! 配置加载与校验测试

use std::time::Duration;

use uranus_core::config::Config;
use uranus_core::error::{FatalPhase, UranusError};
use uranus_core::kafka::{Assignor, InitialOffset};
use uranus_core::runtime::TerminationSignal;
use uranus_core::telemetry::LogFormat;

#[test]
fn sample_configuration_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/uranus.toml");
    let config = Config::load_from_file(path).unwrap();

    assert_eq!(config.service.name, "uranus-demo");
    let grpc = config.grpc.as_ref().unwrap();
    assert_eq!(grpc.port, 50051);
    assert_eq!(grpc.app_name, "uranus-demo");
    assert!(grpc.reflection);
    let http = config.http.as_ref().unwrap();
    assert_eq!(http.port, 1323);
    assert_eq!(http.health_path, "/health");

    assert_eq!(config.shutdown.drain_wait, Duration::from_secs(5));
    assert_eq!(config.shutdown.hard_stop_wait, Duration::from_secs(10));
    assert_eq!(
        config.shutdown.signals,
        vec![
            TerminationSignal::Interrupt,
            TerminationSignal::Quit,
            TerminationSignal::Terminate
        ]
    );

    let consumer = config.consumer.as_ref().unwrap();
    assert_eq!(consumer.group_id(), "uranus-demo");
    assert_eq!(consumer.assignor(), Assignor::RoundRobin);
    assert_eq!(consumer.initial_offset(), InitialOffset::Oldest);
    assert_eq!(consumer.topics(), ["orders".to_string()]);
}

#[test]
fn minimal_configuration_uses_defaults() {
    let config = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [consumer]
        brokers = ["kafka-1:9092", "kafka-2:9092"]
        topics = ["invoices", "invoices", "refunds"]
        group_id = "billing"
        "#,
    )
    .unwrap();

    assert_eq!(config.log.level, "info");
    assert_eq!(config.log.format, LogFormat::Pretty);
    assert!(config.grpc.is_none());
    assert!(config.http.is_none());
    assert_eq!(config.shutdown.drain_wait, Duration::from_secs(5));
    assert_eq!(config.shutdown.hard_stop_wait, Duration::from_secs(10));
    assert_eq!(config.shutdown.delay, Duration::from_secs(10));
    assert_eq!(config.shutdown.shutdown_deadline, Duration::from_secs(30));

    let consumer = config.consumer.unwrap();
    assert_eq!(consumer.assignor(), Assignor::Range);
    assert_eq!(consumer.initial_offset(), InitialOffset::Newest);
    assert_eq!(consumer.session_timeout(), Duration::from_secs(30));
    assert_eq!(
        consumer.topics(),
        ["invoices".to_string(), "refunds".to_string()]
    );
}

#[test]
fn app_name_falls_back_to_service_name() {
    let config = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [grpc]
        port = 9000
        app_name = "billing-rpc"

        [http]
        port = 8080
        "#,
    )
    .unwrap();

    assert_eq!(config.grpc.unwrap().app_name, "billing-rpc");
    let http = config.http.unwrap();
    assert_eq!(http.app_name, "billing");
    assert_eq!(http.health_path, "/health");
}

#[test]
fn unknown_assignor_is_a_startup_error() {
    let err = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [consumer]
        brokers = ["localhost:9092"]
        topics = ["invoices"]
        group_id = "billing"
        assignor = "fifo"
        "#,
    )
    .unwrap_err();

    assert!(matches!(err, UranusError::UnrecognizedAssignor(ref name) if name == "fifo"));
    assert_eq!(err.phase(), FatalPhase::Startup);
}

#[test]
fn uncatchable_signal_is_rejected() {
    let err = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [shutdown]
        signals = ["SIGTERM", "SIGKILL"]
        "#,
    )
    .unwrap_err();

    assert!(matches!(err, UranusError::UnsupportedSignal(_)));
}

#[test]
fn empty_signal_list_is_rejected() {
    let err = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [shutdown]
        signals = []
        "#,
    )
    .unwrap_err();

    assert!(matches!(err, UranusError::InvalidConfig(_)));
}

#[test]
fn listeners_cannot_share_a_port() {
    let err = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [grpc]
        port = 8080

        [http]
        port = 8080
        "#,
    )
    .unwrap_err();

    assert!(matches!(err, UranusError::InvalidConfig(_)));
}

#[test]
fn unknown_log_format_is_rejected() {
    let err = Config::from_toml_str(
        r#"
        [service]
        name = "billing"

        [log]
        format = "xml"
        "#,
    )
    .unwrap_err();

    assert!(matches!(err, UranusError::InvalidConfig(_)));
}

#[test]
fn empty_service_name_is_rejected() {
    let err = Config::from_toml_str(
        r#"
        [service]
        name = "  "
        "#,
    )
    .unwrap_err();

    assert!(matches!(err, UranusError::InvalidConfig(_)));
}

#[test]
fn malformed_toml_is_reported() {
    let err = Config::from_toml_str("[service\nname = ").unwrap_err();
    assert!(matches!(err, UranusError::Toml(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = Config::load_from_file("/nonexistent/uranus.toml").unwrap_err();
    assert!(matches!(err, UranusError::Io(_)));
}
