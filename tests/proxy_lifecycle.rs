use std::net::TcpListener;
use std::time::Duration;

use burrow_proxy::api::proxy_api::{
    create_default_config, get_proxy_status, init_core, start_proxy, stop_proxy, StartOptions,
};
use burrow_proxy::EndpointConfig;
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn proxy_start_stop_transitions_state() {
    let storage_dir = tempfile::tempdir().unwrap();
    init_core(Some(storage_dir.path().to_string_lossy().to_string())).unwrap();

    let mut config = create_default_config();
    config.storage_path = Some(storage_dir.path().to_path_buf());
    config.endpoints = vec![EndpointConfig::explicit("127.0.0.1", available_port())];

    start_proxy(config, StartOptions::default())
        .await
        .expect("proxy starts");
    let status = get_proxy_status();
    assert!(status.is_running);
    assert_eq!(status.bind_address, "127.0.0.1");
    assert!(storage_dir.path().join("burrow_proxy_ca.pem").exists());

    stop_proxy().await.expect("proxy stops");
    assert!(!get_proxy_status().is_running);

    // Stopping twice is harmless.
    stop_proxy().await.expect("second stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn taken_port_falls_back_to_next_free_one() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut config = create_default_config();
    config.endpoints = vec![EndpointConfig::explicit("127.0.0.1", port)];
    config.endpoints[0].decrypt_ssl = false;

    start_proxy(config, StartOptions::default())
        .await
        .expect("proxy starts");
    let status = get_proxy_status();
    assert!(status.is_running);
    assert_ne!(status.port, port);

    stop_proxy().await.expect("proxy stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn running_proxy_counts_requests() {
    let mut config = create_default_config();
    config.endpoints = vec![EndpointConfig::explicit("127.0.0.1", available_port())];
    config.endpoints[0].decrypt_ssl = false;

    start_proxy(config, StartOptions::default())
        .await
        .expect("proxy starts");
    let status = get_proxy_status();

    let mut client = TcpStream::connect(("127.0.0.1", status.port)).await.unwrap();
    client
        .write_all(b"GET /relative HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .expect("proxy answers")
        .unwrap();
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 400"));
    assert_eq!(get_proxy_status().total_requests, 1);

    stop_proxy().await.expect("proxy stops");
}
