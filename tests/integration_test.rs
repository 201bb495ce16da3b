use flate2::read::GzDecoder;
use meshsnap::capture::build_archive;
use meshsnap::config::{validate_primary_container, CaptureConfig, StopCondition};
use meshsnap::error::{Result, SnapError};
use std::fs::{self, File};
use std::io::Read;
use std::time::Duration;
use tar::Archive;

#[test]
fn test_error_types() {
    let err = SnapError::PodNotFound {
        name: "test-pod".to_string(),
        namespace: "default".to_string(),
    };

    assert!(err.to_string().contains("test-pod"));
    assert!(err.to_string().contains("default"));

    let err = SnapError::CaptureError {
        endpoint: "/stats".to_string(),
        attempts: 6,
    };
    assert_eq!(err.to_string(), "Failed to capture /stats after 6 attempts");
    assert!(!err.is_transient());
}

#[test]
fn test_version_const() {
    assert!(!meshsnap::VERSION.is_empty());
}

#[test]
fn test_archive_round_trip() -> Result<()> {
    let source = tempfile::tempdir()?;
    fs::write(source.path().join("stats.json"), "{}")?;
    fs::write(source.path().join("app-logs.txt"), "hello")?;

    let out = tempfile::tempdir()?;
    let archive_path = out.path().join("web-0_snapshot.tar.gz");
    build_archive(source.path(), &archive_path)?;

    let extracted = tempfile::tempdir()?;
    Archive::new(GzDecoder::new(File::open(&archive_path)?)).unpack(extracted.path())?;

    for (name, expected) in [("stats.json", "{}"), ("app-logs.txt", "hello")] {
        let mut body = String::new();
        File::open(extracted.path().join(name))?.read_to_string(&mut body)?;
        assert_eq!(body, expected);
    }
    Ok(())
}

#[test]
fn test_config_rejected_before_any_remote_call() {
    let config = CaptureConfig {
        interval: Duration::from_secs(1),
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(SnapError::ConfigValidationError(_))
    ));

    assert!(validate_primary_container("consul-dataplane").is_err());
    assert!(validate_primary_container("web").is_ok());
}

#[test]
fn test_repeat_takes_precedence_over_duration() {
    let config = CaptureConfig {
        repeat_count: 4,
        duration: Duration::from_secs(600),
        ..Default::default()
    };
    assert_eq!(config.stop_condition(), StopCondition::Repeat(4));
}
