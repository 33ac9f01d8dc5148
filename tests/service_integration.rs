//! End-to-end tests: host, in-process workers, channels and the front-end bridge.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use upm_core::host::{front_end_link, LocalSpawner, ServiceState, WorkerSpawner};
use upm_core::port::PortListener;
use upm_core::types::{ClientId, ServiceName, SpawnOptions};
use upm_core::{Config, Error, ServiceHost};

upm_core::declare_operation!(Ping = "ping", (String) -> String);

fn spawner() -> Arc<dyn WorkerSpawner> {
    let spawner = LocalSpawner::new();
    spawner
        .register("main", |dispatcher, _| {
            dispatcher.add_request_handler("ping", |ctx| async move {
                let name: String = ctx.arg(0)?;
                Ok(Value::String(format!("pong: {}", name)))
            });
            dispatcher.add_request_handler("hang", |_| std::future::pending::<upm_core::worker::HandlerResult>());
            dispatcher.add_event_handler(|ctx, data| {
                if data.get("echo").is_some() {
                    let _ = ctx.send_event(data.clone());
                    return true;
                }
                false
            });
            Ok(())
        })
        .register("crashing", |_, _| Err("missing module".into()));
    Arc::new(spawner)
}

fn name(s: &str) -> ServiceName {
    s.parse().unwrap()
}

#[tokio::test]
async fn ping_round_trip_through_service() {
    let host = ServiceHost::new(spawner(), Config::default());
    let service = host
        .create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();

    let result = service.execute_request("ping", vec![json!("main")]).await.unwrap();
    assert_eq!(result, json!("pong: main"));

    let typed = service.service_client().invoke::<Ping>(("typed".to_string(),)).await.unwrap();
    assert_eq!(typed, "pong: typed");
}

#[tokio::test]
async fn unknown_operation_reports_worker_error() {
    let host = ServiceHost::new(spawner(), Config::default());
    let service = host
        .create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();

    let err = service.execute_request("nope", Vec::new()).await.unwrap_err();
    assert_eq!(err.code(), "REMOTE");
    assert_eq!(err.to_string(), "unregistered handler: nope");
}

#[tokio::test]
async fn unhandled_event_is_not_an_error() {
    let host = ServiceHost::new(spawner(), Config::default());
    let service = host
        .create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();

    service.send_event(json!({ "test": "x" })).unwrap();
    // Still serving afterwards.
    let result = service.execute_request("ping", vec![json!("after")]).await.unwrap();
    assert_eq!(result, json!("pong: after"));
}

#[tokio::test]
async fn startup_failure_leaves_no_service() {
    let host = ServiceHost::new(spawner(), Config::default());
    let err = host
        .create_service(name("broken"), "crashing", SpawnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StartupExit(1)));
    assert!(host.get_service(&name("broken")).is_none());

    // The name is free again.
    host.create_service(name("broken"), "main", SpawnOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn destroy_abandons_pending_and_frees_name() {
    let host = ServiceHost::new(spawner(), Config::default());
    let service = host
        .create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();
    let client = service.create_main_client("worker-client".parse().unwrap()).unwrap();

    let from_service = tokio::spawn({
        let service = service.clone();
        async move { service.execute_request("hang", Vec::new()).await }
    });
    let from_client = tokio::spawn({
        let client = client.clone();
        async move { client.execute_request("hang", Vec::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    host.destroy_service(&name("main")).await.unwrap();

    assert!(from_service.await.unwrap().unwrap_err().is_abandoned());
    assert!(from_client.await.unwrap().unwrap_err().is_abandoned());
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(service.info().channels.is_empty());
    assert!(host.list_services().is_empty());

    host.create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn main_client_talks_on_its_own_channel() {
    let host = ServiceHost::new(spawner(), Config::default());
    host.create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();

    let client = host
        .create_main_client(&name("main"), "renderer-1".parse().unwrap())
        .unwrap();
    let result = client.execute_request("ping", vec![json!("renderer")]).await.unwrap();
    assert_eq!(result, json!("pong: renderer"));

    let service = host.get_service(&name("main")).unwrap();
    assert_eq!(service.info().channels, vec!["renderer-1".parse::<ClientId>().unwrap()]);
}

#[tokio::test]
async fn worker_event_handler_replies_on_raw_channel() {
    let host = ServiceHost::new(spawner(), Config::default());
    host.create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();

    let port = host
        .create_message_channel(&name("main"), "raw".parse().unwrap())
        .unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    port.add_listener(PortListener::new(move |frame| {
        let _ = tx.send(frame);
    }));
    port.start();
    port.post_message(upm_core::envelope::Envelope::event(0, json!({ "echo": 1 })).into())
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .into_envelope()
        .unwrap();
    assert_eq!(reply.event_data, Some(json!({ "echo": 1 })));
}

#[tokio::test]
async fn front_end_bridge_grants_working_client() {
    let config = Config::default();
    let host = ServiceHost::new(spawner(), config.clone());
    host.create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();

    let (link, endpoint) = front_end_link(&config);
    let bridge = host.serve_front_end(endpoint);

    let client = link
        .create_client(name("main"), "front-1".parse().unwrap())
        .await
        .unwrap();
    let result = client.execute_request("ping", vec![json!("front")]).await.unwrap();
    assert_eq!(result, json!("pong: front"));

    let err = link
        .create_client(name("absent"), "front-2".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "not found: service absent");

    drop(link);
    bridge.await.unwrap();
}

#[tokio::test]
async fn destroy_all_tears_down_every_service() {
    let host = ServiceHost::new(spawner(), Config::default());
    for n in ["one", "two", "three"] {
        host.create_service(name(n), "main", SpawnOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(host.list_services().len(), 3);

    assert_eq!(host.destroy_all().await, 3);
    assert!(host.list_services().is_empty());
}

#[tokio::test]
async fn dropped_clients_reconnect_under_same_id() {
    let config = Config::default();
    let host = ServiceHost::new(spawner(), config.clone());
    host.create_service(name("main"), "main", SpawnOptions::default())
        .await
        .unwrap();
    let (link, endpoint) = front_end_link(&config);
    let _bridge = host.serve_front_end(endpoint);

    for _ in 0..2 {
        let front = link
            .create_client(name("main"), "front".parse().unwrap())
            .await
            .unwrap();
        let pong = front.execute_request("ping", vec![json!("front")]).await.unwrap();
        assert_eq!(pong, json!("pong: front"));

        let main = host
            .create_main_client(&name("main"), "renderer".parse().unwrap())
            .unwrap();
        let pong = main.execute_request("ping", vec![json!("renderer")]).await.unwrap();
        assert_eq!(pong, json!("pong: renderer"));
    }

    let service = host.get_service(&name("main")).unwrap();
    assert_eq!(
        service.info().channels,
        vec!["front".parse::<ClientId>().unwrap(), "renderer".parse().unwrap()]
    );
}
