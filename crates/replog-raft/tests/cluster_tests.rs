//! Cluster tests on the in-memory network
//!
//! All tests run with a paused tokio clock, so election timeouts and
//! request timeouts elapse instantly once every task is idle.

use replog_raft::{
    LogStream, LoggedEvent, MemoryLogStream, MemoryNetwork, NodeAddr, RaftConfig, RaftError,
    RaftHandle, RaftNodeConfig, RaftState, RaftStatus,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn address(port: u16) -> NodeAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 26600 + port)
}

struct Node {
    address: NodeAddr,
    raft: RaftHandle,
    log: Arc<MemoryLogStream>,
}

impl Node {
    fn start(network: &MemoryNetwork, config: RaftNodeConfig) -> Self {
        let log = Arc::new(MemoryLogStream::with_max_event_size(
            config.partition_id,
            config.raft.max_event_size,
        ));
        let address = config.local_address;
        let raft = RaftHandle::spawn(config, log.clone(), network.transport(address)).unwrap();
        Self { address, raft, log }
    }

    fn status(&self) -> RaftStatus {
        self.raft.status()
    }
}

fn start_cluster(network: &MemoryNetwork, size: u16) -> Vec<Node> {
    start_cluster_with(network, size, RaftConfig::default())
}

fn start_cluster_with(network: &MemoryNetwork, size: u16, raft_config: RaftConfig) -> Vec<Node> {
    let addresses: Vec<NodeAddr> = (1..=size).map(address).collect();
    addresses
        .iter()
        .map(|&local| {
            let members = addresses.iter().copied().filter(|a| *a != local).collect();
            let config = RaftNodeConfig::new(0, local, members).with_raft_config(raft_config.clone());
            Node::start(network, config)
        })
        .collect()
}

/// Index of the ready leader among `nodes`
async fn wait_for_leader(nodes: &[Node]) -> usize {
    timeout(Duration::from_secs(60), async {
        loop {
            if let Some(index) = nodes.iter().position(|node| node.status().ready) {
                return index;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no leader elected")
}

async fn wait_for_commit(node: &Node, position: i64) {
    timeout(
        Duration::from_secs(60),
        node.raft.wait_for(|status| status.commit_position >= position),
    )
    .await
    .expect("commit position not reached")
    .unwrap();
}

fn contents(log: &MemoryLogStream) -> Vec<(i64, u64, Vec<u8>)> {
    log.events()
        .into_iter()
        .map(|LoggedEvent { position, term, payload, .. }| (position, term, payload))
        .collect()
}

async fn close_all(nodes: &[Node]) {
    for node in nodes {
        node.raft.close().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_nodes_elect_exactly_one_leader() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);

    let leader = wait_for_leader(&nodes).await;
    let term = nodes[leader].status().term;
    let leader_address = nodes[leader].address;

    for node in &nodes {
        let status = timeout(
            Duration::from_secs(10),
            node.raft.wait_for(|status| status.leader == Some(leader_address)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.term, term);
    }

    let leaders = nodes
        .iter()
        .filter(|node| node.status().state == RaftState::Leader)
        .count();
    assert_eq!(leaders, 1);

    close_all(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_appended_events_replicate_and_commit() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);
    let leader = wait_for_leader(&nodes).await;

    let mut last = -1;
    for i in 0..10u8 {
        last = nodes[leader].raft.append(vec![i; 16]).await.unwrap();
    }

    for node in &nodes {
        wait_for_commit(node, last).await;
    }

    let expected = contents(&nodes[leader].log);
    for node in &nodes {
        assert_eq!(contents(&node.log), expected);
        assert_eq!(node.log.commit_position(), last);
    }

    close_all(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_isolated_follower_does_not_disrupt_leader() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);
    let leader = wait_for_leader(&nodes).await;
    let term = nodes[leader].status().term;
    let follower = (leader + 1) % nodes.len();
    wait_for_commit(&nodes[follower], 0).await;

    network.isolate(nodes[follower].address);
    sleep(Duration::from_secs(5)).await;

    // polls never succeed, so the term does not move
    assert_eq!(nodes[follower].status().term, term);
    assert_eq!(nodes[follower].status().state, RaftState::Follower);
    assert!(network.requests_sent(nodes[follower].address) > 0);

    let position = nodes[leader].raft.append(b"while isolated".to_vec()).await.unwrap();
    wait_for_commit(&nodes[leader], position).await;

    network.heal(nodes[follower].address);
    wait_for_commit(&nodes[follower], position).await;

    assert_eq!(nodes[leader].status().term, term);
    assert!(nodes[leader].status().is_leader());

    close_all(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_new_leader_after_leader_closed() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);
    let leader = wait_for_leader(&nodes).await;
    let term = nodes[leader].status().term;

    let position = nodes[leader].raft.append(b"before".to_vec()).await.unwrap();
    for node in &nodes {
        wait_for_commit(node, position).await;
    }
    nodes[leader].raft.close().await.unwrap();

    let survivors: Vec<Node> = nodes
        .into_iter()
        .enumerate()
        .filter(|(index, _)| *index != leader)
        .map(|(_, node)| node)
        .collect();
    let new_leader = wait_for_leader(&survivors).await;
    assert!(survivors[new_leader].status().term > term);

    let after = survivors[new_leader].raft.append(b"after".to_vec()).await.unwrap();
    for node in &survivors {
        wait_for_commit(node, after).await;
        // committed events survive the change of leadership
        assert_eq!(node.log.entry(position).map(|e| e.payload), Some(b"before".to_vec()));
    }

    close_all(&survivors).await;
}

#[tokio::test(start_paused = true)]
async fn test_node_joins_running_cluster() {
    init_tracing();
    let network = MemoryNetwork::new();
    let first = Node::start(&network, RaftNodeConfig::new(0, address(1), vec![]));
    first.raft.wait_for(|status| status.ready).await.unwrap();
    let position = first.raft.append(b"early".to_vec()).await.unwrap();

    let second = Node::start(
        &network,
        RaftNodeConfig::joining(0, address(2), vec![address(1)]),
    );
    assert!(!second.status().joined);

    timeout(Duration::from_secs(30), second.raft.join())
        .await
        .unwrap()
        .unwrap();

    assert!(second.status().joined);
    assert_eq!(second.status().members, vec![address(2), address(1)]);
    assert_eq!(first.status().members, vec![address(1), address(2)]);

    // joining again is a no-op
    second.raft.join().await.unwrap();

    let later = first.raft.append(b"late".to_vec()).await.unwrap();
    wait_for_commit(&second, later).await;
    assert_eq!(second.log.entry(position).map(|e| e.payload), Some(b"early".to_vec()));

    close_all(&[first, second]).await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_leaves_cluster() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);
    let leader = wait_for_leader(&nodes).await;
    let follower = (leader + 1) % nodes.len();
    let leaving = nodes[follower].address;

    timeout(Duration::from_secs(30), nodes[follower].raft.leave())
        .await
        .unwrap()
        .unwrap();

    let status = nodes[follower].status();
    assert!(!status.joined);
    assert_eq!(status.members, vec![leaving]);

    timeout(
        Duration::from_secs(10),
        nodes[leader].raft.wait_for(|status| !status.members.contains(&leaving)),
    )
    .await
    .unwrap()
    .unwrap();

    // the remaining two still commit
    let position = nodes[leader].raft.append(b"after leave".to_vec()).await.unwrap();
    wait_for_commit(&nodes[leader], position).await;

    close_all(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_cannot_leave() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);
    let leader = wait_for_leader(&nodes).await;

    let result = nodes[leader].raft.leave().await;
    assert!(matches!(result, Err(RaftError::LeaveWhileLeader)));
    assert!(nodes[leader].status().joined);

    close_all(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_throttled_leader_catches_up() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3);
    let leader = wait_for_leader(&nodes).await;
    let term = nodes[leader].status().term;

    network.throttle(nodes[leader].address);
    let mut last = -1;
    for i in 0..5u8 {
        last = nodes[leader].raft.append(vec![i]).await.unwrap();
    }
    // shorter than the minimum election timeout
    sleep(Duration::from_millis(60)).await;
    network.unthrottle(nodes[leader].address);

    for node in &nodes {
        wait_for_commit(node, last).await;
        assert_eq!(contents(&node.log), contents(&nodes[leader].log));
    }
    assert_eq!(nodes[leader].status().term, term);

    close_all(&nodes).await;
}

#[tokio::test(start_paused = true)]
async fn test_events_up_to_the_window_size_commit() {
    init_tracing();
    let network = MemoryNetwork::new();
    let raft_config = RaftConfig {
        receive_buffer_size: 512 * 1024,
        max_event_size: 256 * 1024,
        ..RaftConfig::default()
    };
    let nodes = start_cluster_with(&network, 3, raft_config);
    let leader = wait_for_leader(&nodes).await;

    // each event fills most of the 256KiB window on its own
    let mut last = -1;
    for i in 0..4u8 {
        last = nodes[leader].raft.append(vec![i; 200 * 1024]).await.unwrap();
    }

    for node in &nodes {
        wait_for_commit(node, last).await;
        assert_eq!(contents(&node.log), contents(&nodes[leader].log));
    }

    close_all(&nodes).await;
}

#[tokio::test]
async fn test_log_accepting_events_beyond_window_is_refused() {
    let network = MemoryNetwork::new();
    let config = RaftNodeConfig::new(0, address(1), vec![address(2)]).with_raft_config(RaftConfig {
        receive_buffer_size: 512 * 1024,
        max_event_size: 256 * 1024,
        ..RaftConfig::default()
    });

    let result = RaftHandle::spawn(
        config,
        Arc::new(MemoryLogStream::new(0)),
        network.transport(address(1)),
    );
    assert!(matches!(result, Err(RaftError::ConfigError(_))));
}
