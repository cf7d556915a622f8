use std::io::Write;

use millstream::config::{ConfigError, ConnectionKind, load_config};
use millstream::shared::{OffsetId, Point};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn full_config_round_trips() {
    let file = write_config(
        r#"
[connection]
kind = "socket"
host = "192.168.4.1"
port = 8880

[streaming]
ack_window = 6
exec_window = 4
coalesce_status_ok = false
reset_delay_ms = 100

[polling]
status_interval_ms = 200

[reconnect]
max_attempts = 3
jitter = false

[offsets]
active = "g55"

[offsets.slots]
G55 = [10.0, 20.0, -5.0]
G92 = [0.0, 0.0, 1.0]
"#,
    );
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.connection.kind, ConnectionKind::Socket);
    assert_eq!(config.connection.port, 8880);
    assert_eq!(config.streaming.ack_window, 6);
    assert_eq!(config.streaming.exec_window, 4);
    assert!(!config.streaming.coalesce_status_ok);
    assert_eq!(config.streaming.reset_delay().as_millis(), 100);
    assert_eq!(config.polling.status_interval().as_millis(), 200);
    assert_eq!(config.polling.modal_interval().as_millis(), 1000);
    assert_eq!(config.reconnect.max_attempts, 3);
    assert_eq!(config.reconnect.base_delay_ms, 500);

    assert_eq!(config.offsets.active_offset().unwrap(), OffsetId::G55);
    let table = config.offsets.table().unwrap();
    assert_eq!(table.get(OffsetId::G55), Point::new(10.0, 20.0, -5.0));
    assert_eq!(table.effective(OffsetId::G55), Point::new(10.0, 20.0, -4.0));
}

#[test]
fn serial_without_device_is_rejected() {
    let file = write_config("[connection]\nkind = \"serial\"\n");
    assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
}

#[test]
fn zero_windows_are_rejected() {
    let file = write_config("[connection]\nkind = \"simulated\"\n[streaming]\nack_window = 0\n");
    assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
}

#[test]
fn unknown_offset_slot_is_rejected() {
    let file = write_config("[connection]\nkind = \"simulated\"\n[offsets.slots]\nG60 = [1.0, 2.0, 3.0]\n");
    assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
}

#[test]
fn g92_cannot_be_the_active_offset() {
    let file = write_config("[connection]\nkind = \"simulated\"\n[offsets]\nactive = \"G92\"\n");
    assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let file = write_config("[connection\nkind = ");
    assert!(matches!(load_config(file.path()), Err(ConfigError::Toml(_))));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(load_config(dir.path().join("absent.toml")), Err(ConfigError::Io(_))));
}
