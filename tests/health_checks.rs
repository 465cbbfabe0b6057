//! Health checking against real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ribbon::config::{ClientConfig, ConfigKey};
use ribbon::error::ListenerError;
use ribbon::lifecycle::Shutdown;
use ribbon::load_balancer::dynamic::{ConfigServerList, DynamicServerListLoadBalancer};
use ribbon::load_balancer::ping::{HttpPing, ParallelPingStrategy, TcpPing};
use ribbon::load_balancer::server::Server;
use ribbon::observability::NoopMetrics;
use ribbon::{BaseLoadBalancer, LoadBalancer, Registry};

mod common;

fn ids(servers: &[Arc<Server>]) -> Vec<String> {
    let mut ids: Vec<String> = servers.iter().map(|s| s.id().to_string()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_tcp_ping_evicts_stopped_backend() {
    let b1 = common::start_mock_backend(200).await;
    let b2 = common::start_mock_backend(200).await;
    let (id1, id2) = (b1.id(), b2.id());

    let lb = BaseLoadBalancer::builder(ClientConfig::new("tcp"))
        .ping(Arc::new(TcpPing::new(Duration::from_millis(500))))
        .ping_strategy(Arc::new(ParallelPingStrategy))
        .build();

    let went_down = Arc::new(AtomicUsize::new(0));
    let wd = went_down.clone();
    lb.add_server_status_change_listener(Arc::new(
        move |changed: &[Arc<Server>]| -> Result<(), ListenerError> {
            wd.fetch_add(changed.iter().filter(|s| !s.is_alive()).count(), Ordering::SeqCst);
            Ok(())
        },
    ));

    lb.set_servers_list(vec![id1.clone(), id2.clone()]);
    assert!(lb.reachable_servers().is_empty());

    lb.force_quick_ping().await;
    assert_eq!(lb.reachable_servers().len(), 2);

    b2.stop().await;
    lb.force_quick_ping().await;

    assert_eq!(ids(&lb.reachable_servers()), vec![id1.clone()]);
    assert_eq!(went_down.load(Ordering::SeqCst), 1);
    for _ in 0..10 {
        assert_eq!(lb.choose_server(None).unwrap().id(), id1);
    }
    b1.stop().await;
}

#[tokio::test]
async fn test_http_ping_requires_success_status() {
    let healthy = common::start_mock_backend(200).await;
    let failing = common::start_mock_backend(503).await;
    let closed = common::closed_addr().await;

    let lb = BaseLoadBalancer::builder(ClientConfig::new("http"))
        .ping(Arc::new(HttpPing::new("/health", Duration::from_millis(500))))
        .build();
    lb.set_servers_list(vec![healthy.id(), failing.id(), closed.to_string()]);
    lb.force_quick_ping().await;

    assert_eq!(ids(&lb.reachable_servers()), vec![healthy.id()]);
    assert_eq!(lb.all_servers().len(), 3);
}

#[tokio::test]
async fn test_ping_task_quick_pings_after_list_change() {
    let backend = common::start_mock_backend(200).await;

    let lb = BaseLoadBalancer::builder(ClientConfig::new("quick").with(ConfigKey::PingIntervalSecs, 60))
        .ping(Arc::new(TcpPing::new(Duration::from_millis(500))))
        .build();
    let shutdown = Shutdown::new();
    lb.start_ping_task(shutdown.subscribe());
    assert!(lb.is_ping_task_running());

    // Let the immediate first tick run against the empty list.
    tokio::time::sleep(Duration::from_millis(50)).await;

    lb.set_servers_list(vec![backend.id()]);
    let up = common::wait_until(Duration::from_secs(3), || lb.reachable_servers().len() == 1).await;
    assert!(up, "new server should be confirmed long before the next tick");

    shutdown.trigger();
    let stopped = common::wait_until(Duration::from_secs(2), || !lb.is_ping_task_running()).await;
    assert!(stopped);
}

#[tokio::test]
async fn test_config_driven_pool_follows_file() {
    let b1 = common::start_mock_backend(200).await;
    let b2 = common::start_mock_backend(200).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ribbon.toml");
    let write = |servers: &[String]| {
        let list: Vec<String> = servers.iter().map(|s| format!("\"{}\"", s)).collect();
        std::fs::write(
            &path,
            format!(
                "[client]\nname = \"svc\"\nservers = [{}]\n\n[client.properties]\nping = \"tcp\"\nrule = \"availability_filtering\"\n",
                list.join(", ")
            ),
        )
        .unwrap();
    };
    write(&[b1.id()]);

    let config = ribbon::config::loader::load_config(&path).unwrap();
    let base = BaseLoadBalancer::from_config(
        config.client.client_config(),
        &Registry::default(),
        Arc::new(NoopMetrics),
    )
    .unwrap();
    assert_eq!(base.rule_name(), Some("availability_filtering"));

    let lb = DynamicServerListLoadBalancer::new(base, Arc::new(ConfigServerList::new(&path)), None);
    assert_eq!(lb.initialize().unwrap(), 1);
    lb.base().force_quick_ping().await;
    assert_eq!(lb.choose_server(None).unwrap().id(), b1.id());

    write(&[b1.id(), b2.id()]);
    assert_eq!(lb.update_list_of_servers().unwrap(), Some(2));
    lb.base().force_quick_ping().await;
    assert_eq!(ids(&lb.reachable_servers()), {
        let mut expected = vec![b1.id(), b2.id()];
        expected.sort();
        expected
    });

    // A broken edit keeps the current list.
    std::fs::write(&path, "[client\nbroken").unwrap();
    assert!(lb.update_list_of_servers().is_err());
    assert_eq!(lb.all_servers().len(), 2);
}
