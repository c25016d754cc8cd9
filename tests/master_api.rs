//! Integration tests for the coordinator RPC surface.
//!
//! Each test runs its own coordinator on an ephemeral port and talks to
//! it through [`MasterClient`] alone — the same path the CLI tools use.

use rosbus::{Master, MasterClient, NodeIdentity};

/// Start a coordinator on an ephemeral port; returns a client for it.
async fn spawn_master() -> MasterClient {
    let master = Master::bind("127.0.0.1:0").await.expect("bind master");
    let addr = master.local_addr();
    tokio::spawn(master.serve());
    MasterClient::new(addr.to_string())
}

fn node(name: &str, port: u16) -> NodeIdentity {
    NodeIdentity::new(name, "127.0.0.1", port)
}

#[tokio::test]
async fn registrations_are_visible_through_queries() {
    let client = spawn_master().await;

    client
        .register_publisher("/odom", "demo.Odometry", &node("driver", 59001))
        .await
        .unwrap();
    let publishers = client
        .subscribe("/odom", "demo.Odometry", &node("viz", 59002))
        .await
        .unwrap();
    assert_eq!(publishers, vec![node("driver", 59001)]);

    let nodes = client.get_nodes("").await.unwrap();
    assert_eq!(nodes.len(), 2);

    let filtered = client.get_nodes("viz").await.unwrap();
    assert_eq!(filtered, vec![node("viz", 59002)]);

    let topics = client.get_topics("").await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].topic_name, "/odom");
    assert_eq!(topics[0].msg_type, "demo.Odometry");

    let (msg_type, publishers, subscribers) = client.get_topic_info("/odom").await.unwrap();
    assert_eq!(msg_type, "demo.Odometry");
    assert_eq!(publishers, vec![node("driver", 59001)]);
    assert_eq!(subscribers, vec![node("viz", 59002)]);

    let (info, publishes, subscribes) = client.get_node_info("driver").await.unwrap();
    assert_eq!(info, node("driver", 59001));
    assert_eq!(publishes.len(), 1);
    assert!(subscribes.is_empty());
}

#[tokio::test]
async fn missing_node_and_topic_are_errors() {
    let client = spawn_master().await;

    let err = client.get_node_info("ghost").await.unwrap_err();
    assert!(err.to_string().contains("Node not found"));

    let err = client.get_topic_info("/ghost").await.unwrap_err();
    assert!(err.to_string().contains("Topic not found"));
}

#[tokio::test]
async fn subscribe_twice_is_idempotent() {
    let client = spawn_master().await;
    let sub = node("viz", 59011);

    client.subscribe("/odom", "demo.Odometry", &sub).await.unwrap();
    client.subscribe("/odom", "demo.Odometry", &sub).await.unwrap();

    let (_, _, subscribers) = client.get_topic_info("/odom").await.unwrap();
    assert_eq!(subscribers, vec![sub.clone()]);

    // A single unsubscribe undoes it completely.
    client.unsubscribe("/odom", "demo.Odometry", &sub).await.unwrap();
    assert!(client.get_topic_info("/odom").await.is_err());
    assert!(client.get_nodes("").await.unwrap().is_empty());
}

#[tokio::test]
async fn full_unregistration_removes_the_node() {
    let client = spawn_master().await;
    let n = node("worker", 59021);

    client.register_publisher("/a", "demo.A", &n).await.unwrap();
    client.subscribe("/b", "demo.B", &n).await.unwrap();

    client.unregister_publisher("/a", "demo.A", &n).await.unwrap();
    // Still subscribed: the node survives.
    assert_eq!(client.get_nodes("").await.unwrap().len(), 1);

    client.unsubscribe("/b", "demo.B", &n).await.unwrap();
    assert!(client.get_nodes("").await.unwrap().is_empty());
}

#[tokio::test]
async fn sequential_requests_share_a_connection_shape() {
    // Several calls through one client instance; each opens its own
    // connection, and the coordinator serves them all.
    let client = spawn_master().await;
    for i in 0..10u16 {
        client
            .register_publisher("/burst", "demo.X", &node(&format!("n{i}"), 59100 + i))
            .await
            .unwrap();
    }
    assert_eq!(client.get_nodes("").await.unwrap().len(), 10);
    let (_, publishers, _) = client.get_topic_info("/burst").await.unwrap();
    assert_eq!(publishers.len(), 10);
}

#[tokio::test]
async fn unreachable_coordinator_propagates() {
    // Nothing listens here; registration must fail loudly.
    let client = MasterClient::new("127.0.0.1:1");
    let err = client
        .register_publisher("/t", "demo.X", &node("n", 59031))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connecting to coordinator"));
}
