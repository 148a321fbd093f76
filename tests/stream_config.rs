use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use vision_stream::{DecoderFlavor, EndOfStreamPolicy, StreamSettings};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VISION_STREAM_CONFIG",
        "VISION_STREAM_URI",
        "VISION_STREAM_USERNAME",
        "VISION_STREAM_PASSWORD",
        "VISION_STREAM_DEVICE",
        "VISION_STREAM_MAX_RETRIES",
        "VISION_STREAM_EOS_TERMINAL",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamSettings::load().expect("load defaults");
    assert_eq!(cfg.stream.uri, "stub://front_camera");
    assert!(cfg.stream.credentials.is_none());
    assert_eq!(cfg.stream.flavor, DecoderFlavor::Cuda);
    assert_eq!(cfg.policy.backoff_base, Duration::from_millis(200));
    assert_eq!(cfg.policy.backoff_cap, Duration::from_secs(5));
    assert_eq!(cfg.policy.max_retries, None);
    assert_eq!(cfg.policy.end_of_stream, EndOfStreamPolicy::Reconnect);
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "uri": "rtsp://10.0.0.7:554/stream1",
        "username": "viewer",
        "password": "from-file",
        "flavor": "deepstream",
        "device_index": 1,
        "reconnect": {
            "backoff_base_ms": 100,
            "backoff_cap_ms": 2000,
            "backoff_jitter": 0.0,
            "max_retries": 8,
            "stall_timeout_ms": 4000
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("VISION_STREAM_CONFIG", file.path());
    std::env::set_var("VISION_STREAM_PASSWORD", "from-env");
    std::env::set_var("VISION_STREAM_EOS_TERMINAL", "true");

    let cfg = StreamSettings::load().expect("load config");

    assert_eq!(cfg.stream.uri, "rtsp://10.0.0.7:554/stream1");
    let creds = cfg.stream.credentials.expect("credentials");
    assert_eq!(creds.username, "viewer");
    assert_eq!(creds.password.as_deref(), Some("from-env"));
    assert_eq!(cfg.stream.flavor, DecoderFlavor::DeepStream);
    assert_eq!(cfg.stream.device_index, 1);
    assert_eq!(cfg.policy.backoff_base, Duration::from_millis(100));
    assert_eq!(cfg.policy.backoff_cap, Duration::from_secs(2));
    assert_eq!(cfg.policy.backoff_jitter, 0.0);
    assert_eq!(cfg.policy.max_retries, Some(8));
    assert_eq!(cfg.policy.stall_timeout, Duration::from_secs(4));
    assert_eq!(cfg.policy.connect_timeout, Duration::from_secs(10));
    assert_eq!(cfg.policy.end_of_stream, EndOfStreamPolicy::Terminal);

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        uri = "rtsp://camera-2/live"

        [reconnect]
        max_retries = 3
        end_of_stream = "terminal"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("VISION_STREAM_URI", "rtsps://camera-3/live");
    let cfg = StreamSettings::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.stream.uri, "rtsps://camera-3/live");
    assert_eq!(cfg.policy.max_retries, Some(3));
    assert_eq!(cfg.policy.end_of_stream, EndOfStreamPolicy::Terminal);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISION_STREAM_URI", "http://camera/stream");
    assert!(StreamSettings::load().is_err());
    clear_env();

    std::env::set_var("VISION_STREAM_PASSWORD", "orphan");
    assert!(StreamSettings::load().is_err());
    clear_env();

    std::env::set_var("VISION_STREAM_MAX_RETRIES", "many");
    assert!(StreamSettings::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "reconnect": { "backoff_jitter": 2.0 } }"#)
        .expect("write config");
    std::env::set_var("VISION_STREAM_CONFIG", file.path());
    assert!(StreamSettings::load().is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_reported() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISION_STREAM_CONFIG", "/nonexistent/vision-stream.json");
    let err = StreamSettings::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
