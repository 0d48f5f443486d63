//! End-to-end behaviour through the public API against in-process fake
//! servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use graphwire::message::ClientMessage;
use graphwire::testkit::{FakeCluster, Reply, routing_table};
use graphwire::types::{BoltDict, BoltValue};
use graphwire::{AccessMode, Config, Driver, DriverError, SessionConfig, StaleRoutingPolicy};

fn three_node_cluster() -> FakeCluster {
    let cluster = FakeCluster::new();
    let rt = routing_table(
        300,
        &["core1:7687", "core2:7687"],
        &["core2:7687", "core3:7687"],
        &["core1:7687"],
    );
    cluster.server("core1:7687").set_routing_table(rt.clone());
    cluster.server("core2:7687").set_routing_table(rt);
    cluster
}

fn routing_driver(cluster: &FakeCluster, config: Config) -> Driver {
    Driver::with_opener("neo4j://core1:7687", config, Arc::new(cluster.clone())).unwrap()
}

fn bookmarks_sent(cluster: &FakeCluster, address: &str) -> Vec<Vec<BoltValue>> {
    cluster
        .server(address)
        .received()
        .into_iter()
        .filter_map(|msg| match msg {
            ClientMessage::Begin { extra } => Some(
                extra
                    .get("bookmarks")
                    .and_then(BoltValue::as_list)
                    .map(<[BoltValue]>::to_vec)
                    .unwrap_or_default(),
            ),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn write_then_read_across_sessions_is_causally_chained() {
    let cluster = three_node_cluster();
    let driver = routing_driver(&cluster, Config::default());

    let mut writer = driver.session(SessionConfig::default());
    writer
        .execute_write(|tx| {
            Box::pin(async move {
                tx.run("CREATE (:Person {name: 'Ada'})", BoltDict::new())
                    .await?
                    .consume()
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    let bookmarks = writer.last_bookmarks();
    writer.close().await.unwrap();
    assert_eq!(bookmarks.len(), 1);

    let mut reader = driver.session(
        SessionConfig::builder()
            .access_mode(AccessMode::Read)
            .bookmarks(bookmarks.clone())
            .build(),
    );
    reader
        .execute_read(|tx| {
            Box::pin(async move {
                tx.run("MATCH (p:Person) RETURN p", BoltDict::new())
                    .await?
                    .collect()
                    .await
            })
        })
        .await
        .unwrap();
    reader.close().await.unwrap();

    let sent = bookmarks_sent(&cluster, "core2:7687");
    assert_eq!(sent, vec![vec![BoltValue::from(bookmarks[0].as_str())]]);
    assert_eq!(cluster.opened("core3:7687"), 0);
    driver.close().await;
}

#[tokio::test(start_paused = true)]
async fn failed_router_falls_back_to_the_next() {
    let cluster = three_node_cluster();
    let driver = routing_driver(&cluster, Config::default());

    let mut session = driver.session(SessionConfig::default());
    session
        .run("CREATE ()", BoltDict::new())
        .await
        .unwrap()
        .consume()
        .await
        .unwrap();
    session.close().await.unwrap();

    // Once the table expires, core2 is asked first and is gone.
    tokio::time::advance(Duration::from_secs(301)).await;
    cluster.set_unreachable("core2:7687", true);

    let mut session = driver.session(SessionConfig::builder().access_mode(AccessMode::Read).build());
    session
        .run("RETURN 1", BoltDict::new())
        .await
        .unwrap()
        .consume()
        .await
        .unwrap();
    session.close().await.unwrap();

    assert_eq!(cluster.server("core1:7687").count("ROUTE"), 2);
    assert_eq!(cluster.opened("core3:7687"), 1);
}

#[tokio::test]
async fn unreachable_cluster_is_service_unavailable() {
    let cluster = FakeCluster::new();
    cluster.set_unreachable("core1:7687", true);
    let driver = routing_driver(&cluster, Config::default());

    let err = driver.verify_connectivity().await.unwrap_err();
    assert!(matches!(err, DriverError::ServiceUnavailable { .. }), "{err}");
}

#[tokio::test]
async fn database_not_found_fails_fast() {
    let cluster = three_node_cluster();
    cluster
        .server("core1:7687")
        .fail_routing("Neo.ClientError.Database.DatabaseNotFound", "no such database");
    let driver = routing_driver(&cluster, Config::default());

    let mut session = driver.session(SessionConfig::builder().database("nope").build());
    let err = session.run("RETURN 1", BoltDict::new()).await.unwrap_err();
    assert_eq!(err.code(), Some("Neo.ClientError.Database.DatabaseNotFound"));
    assert_eq!(cluster.server("core2:7687").count("ROUTE"), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_table_is_served_when_allowed() {
    let cluster = FakeCluster::new();
    cluster.server("core1:7687").set_routing_table(routing_table(
        10,
        &["core1:7687"],
        &["core2:7687"],
        &["core1:7687"],
    ));
    let config = Config::builder()
        .stale_routing_policy(StaleRoutingPolicy::ServeExpired)
        .build();
    let driver = routing_driver(&cluster, config);
    driver.verify_connectivity().await.unwrap();

    tokio::time::advance(Duration::from_secs(20)).await;
    cluster
        .server("core1:7687")
        .fail_routing("Neo.DatabaseError.General.UnknownError", "routing broke");

    let mut session = driver.session(SessionConfig::builder().access_mode(AccessMode::Read).build());
    session
        .run("RETURN 1", BoltDict::new())
        .await
        .unwrap()
        .consume()
        .await
        .unwrap();
    session.close().await.unwrap();
    assert_eq!(cluster.server("core1:7687").count("ROUTE"), 2);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_when_the_budget_is_spent() {
    let cluster = FakeCluster::new();
    let server = cluster.server("db:7687");
    for _ in 0..10 {
        server.push_reply(Reply::failure(
            "Neo.TransientError.General.DatabaseUnavailable",
            "still starting",
        ));
    }
    let config = Config::builder()
        .max_transaction_retry_time(Duration::from_secs(5))
        .build();
    let driver = Driver::with_opener("bolt://db:7687", config, Arc::new(cluster.clone())).unwrap();
    let mut session = driver.session(SessionConfig::default());

    let calls = AtomicUsize::new(0);
    let err = session
        .execute_write(|tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tx.run("RETURN 1", BoltDict::new()).await?.consume().await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();

    // Delays of 1, 2 and 4 seconds fit the budget; the failure after that
    // is returned as is.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        err.code(),
        Some("Neo.TransientError.General.DatabaseUnavailable")
    );
}

#[test]
fn blocking_driver_runs_queries() {
    let cluster = FakeCluster::new();
    cluster.server("db:7687").push_reply(Reply::records(
        &["greeting"],
        vec![vec![BoltValue::from("hello")]],
    ));
    let driver = graphwire::blocking::Driver::with_opener(
        "bolt://db:7687",
        Config::default(),
        Arc::new(cluster.clone()),
    )
    .unwrap();

    let mut session = driver.session(SessionConfig::default());
    let result = session.run("RETURN 'hello' AS greeting", BoltDict::new()).unwrap();
    assert_eq!(
        result.records[0].get("greeting"),
        Some(&BoltValue::from("hello"))
    );
    session.close().unwrap();
    driver.close();
}
