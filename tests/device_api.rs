use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{ConfigDocument, ConnectReturnCode, MessageClass};
use mock_device::{AppState, MockOptions};
use serde_json::json;
use squeezelite_panel::{
    network::ConnectOutcome,
    nvs::{self, ConfigEditor},
    prelude::*,
};

fn timeouts() -> Timeouts {
    Timeouts {
        status: Duration::from_millis(200),
        messages: Duration::from_millis(200),
        commands: Duration::from_secs(2),
        scan: Duration::from_secs(2),
    }
}

async fn start(options: MockOptions) -> (DeviceClient, AppState) {
    let (addr, state) = mock_device::spawn(options).await.unwrap();
    let client = DeviceClient::new(format!("http://{}/", addr), timeouts());
    (client, state)
}

async fn start_default() -> (DeviceClient, AppState) {
    start(MockOptions {
        reboot_duration: Duration::from_secs(1),
        connect_delay: Duration::from_millis(50),
    })
    .await
}

async fn set_switches(client: &DeviceClient, fields: serde_json::Value) {
    let fields = fields.as_object().cloned().unwrap();
    let reply = client.post_status(fields).await.unwrap();
    assert!(reply.is_success());
}

#[tokio::test]
async fn test_reads_device_documents() {
    let (client, _) = start_default().await;
    assert!(!client.base_url().ends_with('/'));

    let status = client.status().await.unwrap();
    assert!(!status.in_recovery());
    assert_eq!(status.platform_name.as_deref(), Some("I2S-4MFlash"));

    let config = client.config().await.unwrap();
    assert!(matches!(config, ConfigDocument::Full { .. }));
    assert!(!config.gpio().is_empty());
    assert!(config.get(nvs::AUTOEXEC1_KEY).is_some());

    let commands = client.commands().await.unwrap();
    assert!(commands.command("cfg-syst-name").is_some());

    let access_points = client.access_points().await.unwrap();
    assert!(!access_points.is_empty());
    client.scan().await.unwrap();
}

#[tokio::test]
async fn test_messages_are_drained() {
    let (client, _) = start_default().await;

    let first = client.messages().await.unwrap();
    assert!(first.iter().any(|m| m.class == MessageClass::Stats));
    assert!(first.iter().any(|m| m.class == MessageClass::Bt));

    let second = client.messages().await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_command_output_arrives_as_message() {
    let (client, _) = start_default().await;
    client.messages().await.unwrap();

    let reply = client
        .run_command(r#"cfg-syst-name --name "Living Room""#)
        .await
        .unwrap();
    assert!(reply.is_success());

    let messages = client.messages().await.unwrap();
    assert_eq!(messages.len(), 1);
    match Dispatch::decode(&messages[0]).unwrap() {
        Dispatch::CommandResult { command, text, .. } => {
            assert_eq!(command, "cfg-syst-name");
            assert!(text.contains("Received Options"));
            assert!(text.contains("Living Room"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_config_changes_are_stored() {
    let (client, _) = start_default().await;

    let document = client.config().await.unwrap();
    let mut editor = ConfigEditor::new(&document);
    editor.set(nvs::HOST_NAME_KEY, "kitchen").unwrap();
    editor.set("new_key", "42").unwrap();
    client.post_config(&editor.changes()).await.unwrap();

    let document = client.config().await.unwrap();
    assert_eq!(
        document.get(nvs::HOST_NAME_KEY).unwrap().value_string(),
        "kitchen"
    );
    assert_eq!(document.get("new_key").unwrap().value, json!("42"));
}

#[tokio::test]
async fn test_old_recovery_hides_endpoints() {
    let (client, _) = start_default().await;
    set_switches(&client, json!({"mock_old_recovery": "y", "recovery": 1})).await;

    assert!(client.commands().await.unwrap_err().is_not_found());
    assert!(client.messages().await.unwrap_err().is_not_found());
    assert!(client
        .run_command("restart")
        .await
        .unwrap_err()
        .is_not_found());

    // Older recovery images return the bare map
    let config = client.config().await.unwrap();
    assert!(matches!(config, ConfigDocument::Legacy(_)));
    assert!(config.gpio().is_empty());
}

#[tokio::test]
async fn test_upload_needs_recovery() {
    let (client, state) = start_default().await;
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), vec![0u8; 1024]).unwrap();

    let err = client.flash(file.path(), |_, _| {}).await.unwrap_err();
    assert!(err.is_not_found());

    set_switches(&client, json!({"recovery": 1})).await;
    let sent = Arc::new(AtomicU64::new(0));
    let seen = sent.clone();
    client
        .flash(file.path(), move |bytes, _| seen.store(bytes, Ordering::SeqCst))
        .await
        .unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 1024);
    assert!(state.status().await.in_recovery());
}

#[tokio::test]
async fn test_failed_recovery_request() {
    let (client, state) = start_default().await;
    set_switches(&client, json!({"mock_fail_recovery": "y"})).await;

    assert!(client.recovery().await.unwrap_err().is_not_found());
    assert!(!state.status().await.in_recovery());
}

#[tokio::test]
async fn test_rebooting_device_times_out() {
    let (client, _) = start_default().await;
    client.reboot(RebootKind::Normal).await.unwrap();

    let err = client.status().await.unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(client.status().await.is_ok());
}

#[tokio::test]
async fn test_connect_outcomes() {
    let (client, _) = start_default().await;

    client.connect("office", "secret").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = client.status().await.unwrap();
    assert_eq!(
        ConnectOutcome::from_status("office", &status),
        Some(ConnectOutcome::Connected)
    );

    // The device keeps its network when the new one fails
    client.connect("will-fail", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = client.status().await.unwrap();
    assert_eq!(status.connect_code(), Some(ConnectReturnCode::Restore));
    assert_eq!(
        ConnectOutcome::from_status("will-fail", &status),
        Some(ConnectOutcome::Restored)
    );

    client.disconnect().await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.ssid.as_deref(), Some(""));
}

#[tokio::test]
async fn test_unreachable_device() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = DeviceClient::new(format!("http://{}", addr), timeouts());
    let err = client.status().await.unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);
}
