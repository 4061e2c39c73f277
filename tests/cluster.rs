//! Cluster-level scenarios over the in-process loopback transport: leader
//! election, replication and apply ordering, stale-term rejection, joint
//! consensus, and linearized read deadlines.

use braid::encoding::bincode;
use braid::error::{Error, Result};
use braid::raft::{GroupConfig, NodeId, RaftInput, Role, StateMachine};
use braid::server::{GroupStatus, LoopbackNet, RaftGroup, Server, ServerOptions};

use crossbeam::channel::{bounded, unbounded, Receiver};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GROUP: u32 = 1;

/// The test key/value state machine; applied (index, key) pairs are
/// emitted for ordering assertions.
struct Kv {
    data: BTreeMap<String, String>,
    applied: crossbeam::channel::Sender<(u64, String)>,
}

impl StateMachine for Kv {
    fn decode(&self, _biz_type: u16, body: &[u8]) -> Result<Box<dyn Any + Send>> {
        let (key, value): (String, String) = bincode::deserialize(body)?;
        Ok(Box::new((key, value)))
    }

    fn exec(&mut self, index: u64, input: &RaftInput) -> Result<Box<dyn Any + Send>> {
        if input.read_only {
            let key: String = bincode::deserialize(&input.body)?;
            return Ok(Box::new(self.data.get(&key).cloned()));
        }
        let (key, value): (String, String) = match input.decoded.as_ref() {
            Some(decoded) => {
                decoded.downcast_ref::<(String, String)>().expect("bad decode").clone()
            }
            None => bincode::deserialize(&input.body)?,
        };
        self.data.insert(key.clone(), value);
        let _ = self.applied.send((index, key));
        Ok(Box::new(index))
    }

    fn take_snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.data)
    }

    fn install_snapshot(&mut self, _index: u64, _term: u32, data: &[u8]) -> Result<()> {
        self.data = bincode::deserialize(data)?;
        Ok(())
    }
}

struct Node {
    id: NodeId,
    server: Server,
    group: RaftGroup,
    applied: Receiver<(u64, String)>,
    _dir: tempfile::TempDir,
}

struct Cluster {
    net: Arc<LoopbackNet>,
    nodes: Vec<Node>,
}

impl Cluster {
    /// Starts an n-node cluster with fast election timing.
    fn start(n: usize) -> Cluster {
        let net = LoopbackNet::new();
        let member_ids: Vec<NodeId> = (1..=n as NodeId).collect();
        let mut nodes = Vec::new();
        for id in member_ids.iter().copied() {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut opts = ServerOptions::new(dir.path());
            opts.dispatchers = 1;
            opts.io_threads = 2;
            let mut server = Server::new(opts);

            let mut config = GroupConfig::new(GROUP, id, member_ids.clone());
            config.elect_timeout = Duration::from_millis(400);
            config.heartbeat_interval = Duration::from_millis(50);
            config.ping_interval = Duration::from_millis(50);
            config.rpc_timeout = Duration::from_secs(2);

            let (applied_tx, applied_rx) = unbounded();
            let kv = Kv { data: BTreeMap::new(), applied: applied_tx };
            let group = server
                .add_group(config, Box::new(kv), net.transport(id))
                .expect("group start failed");
            net.register(id, group.clone());
            nodes.push(Node { id, server, group, applied: applied_rx, _dir: dir });
        }
        Cluster { net, nodes }
    }

    fn status(&self, id: NodeId) -> GroupStatus {
        let (tx, rx) = bounded(1);
        self.node(id)
            .group
            .status(move |status| {
                let _ = tx.send(status);
            })
            .expect("status failed");
        rx.recv_timeout(Duration::from_secs(5)).expect("no status")
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes.iter().find(|n| n.id == id).expect("unknown node")
    }

    /// Waits until some node is leader and returns its ID.
    fn wait_leader(&self) -> NodeId {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            for node in &self.nodes {
                if self.status(node.id).role == Role::Leader {
                    return node.id;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("no leader elected");
    }

    fn put(&self, id: NodeId, key: &str, value: &str) -> Result<u64> {
        let body = bincode::serialize(&(key, value)).expect("encode failed");
        let (tx, rx) = bounded(1);
        self.node(id)
            .group
            .submit(RaftInput::write(0, Vec::new(), body), move |result| {
                let _ = tx.send(result.map(|output| output.index));
            })
            .expect("submit failed");
        rx.recv_timeout(Duration::from_secs(10)).expect("no reply")
    }

    fn get(&self, id: NodeId, key: &str, deadline: Option<Instant>) -> Result<Option<String>> {
        let body = bincode::serialize(&key).expect("encode failed");
        let (tx, rx) = bounded(1);
        self.node(id)
            .group
            .submit(RaftInput::read(0, body, deadline), move |result| {
                let _ = tx.send(result.map(|output| {
                    output.result.downcast::<Option<String>>().map(|v| *v).unwrap_or(None)
                }));
            })
            .expect("submit failed");
        rx.recv_timeout(Duration::from_secs(10)).expect("no reply")
    }

    fn shutdown(self) {
        for node in self.nodes {
            node.server.shutdown();
        }
    }
}

#[test]
fn single_node_applies_in_order() {
    let cluster = Cluster::start(1);
    let leader = cluster.wait_leader();

    assert!(cluster.put(leader, "a", "1").is_ok());
    assert!(cluster.put(leader, "b", "2").is_ok());
    assert!(cluster.put(leader, "c", "3").is_ok());

    // The state machine saw strictly ordered, gapless indexes. Index 1 is
    // the leader's no-op, so the writes land at 2, 3, 4.
    let node = cluster.node(leader);
    let mut applied = Vec::new();
    while let Ok(entry) = node.applied.recv_timeout(Duration::from_secs(5)) {
        applied.push(entry);
        if applied.len() == 3 {
            break;
        }
    }
    let indexes: Vec<u64> = applied.iter().map(|(index, _)| *index).collect();
    let keys: Vec<&str> = applied.iter().map(|(_, key)| key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(indexes, vec![2, 3, 4]);

    let status = cluster.status(leader);
    assert_eq!(status.last_applied, 4);
    assert_eq!(status.commit_index, 4);

    cluster.shutdown();
}

#[test]
fn three_node_election_and_replication() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_leader();

    // The leader won a real vote: term advanced past 0, and all nodes
    // converge on the same leader and term.
    let leader_status = cluster.status(leader);
    assert_eq!(leader_status.role, Role::Leader);
    assert!(leader_status.term >= 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let agreed = cluster.nodes.iter().all(|n| {
            let status = cluster.status(n.id);
            status.leader_id == leader && status.term == leader_status.term
        });
        if agreed {
            break;
        }
        assert!(Instant::now() < deadline, "nodes never agreed on the leader");
        std::thread::sleep(Duration::from_millis(50));
    }

    // A write through the leader reaches every state machine.
    let index = cluster.put(leader, "name", "braid").expect("put failed");
    for node in &cluster.nodes {
        let (applied_index, key) =
            node.applied.recv_timeout(Duration::from_secs(5)).expect("not applied");
        assert_eq!((applied_index, key.as_str()), (index, "name"));
    }

    // Linearized read through the leader observes the write.
    assert_eq!(cluster.get(leader, "name", None), Ok(Some("braid".to_string())));

    cluster.shutdown();
}

#[test]
fn submits_to_followers_are_rejected() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_leader();
    let follower = cluster.nodes.iter().map(|n| n.id).find(|id| *id != leader).expect("no follower");

    match cluster.put(follower, "x", "y") {
        Err(Error::NotLeader(hint)) => {
            // The follower knows the leader by the time it has one.
            assert!(hint == leader || hint == 0, "unexpected leader hint {hint}");
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
    cluster.shutdown();
}

#[test]
fn stale_term_append_is_rejected() {
    use braid::raft::message::AppendEntriesReq;

    let cluster = Cluster::start(3);
    let leader = cluster.wait_leader();
    let term = cluster.status(leader).term;

    // Inject an AppendEntries from a would-be leader of an older term; the
    // receiver must reject with its own, higher term.
    let (tx, rx) = bounded(1);
    let req = AppendEntriesReq {
        group_id: GROUP,
        term: term.saturating_sub(1),
        leader_id: 99,
        prev_log_index: 0,
        prev_log_term: 0,
        leader_commit: 0,
        entries: Vec::new(),
    };
    cluster
        .node(leader)
        .group
        .append_entries(req, Box::new(move |resp| {
            let _ = tx.send(resp);
        }))
        .expect("append failed");
    let resp = rx.recv_timeout(Duration::from_secs(5)).expect("no reply").expect("rpc failed");
    assert!(!resp.success);
    assert_eq!(resp.term, term);

    cluster.shutdown();
}

#[test]
fn joint_consensus_requires_both_quorums() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_leader();

    // Cold,new: grow from {1,2,3} to {1,2,3,4,5}. Nodes 4 and 5 don't
    // exist, so the prepared set can't reach quorum and writes must stall.
    let (tx, rx) = bounded(1);
    cluster
        .node(leader)
        .group
        .prepare_member_change(vec![1, 2, 3, 4, 5], move |result| {
            let _ = tx.send(result.map(|output| output.index));
        })
        .expect("prepare failed");
    // The Cold,new entry itself can't commit without 3-of-5 of the new
    // set, so the reply stays pending; give the entry time to append.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = cluster.status(leader);
        if status.prepared_member_ids == vec![1, 2, 3, 4, 5] {
            break;
        }
        assert!(Instant::now() < deadline, "joint consensus never installed");
        std::thread::sleep(Duration::from_millis(50));
    }

    // Commit index must not advance past the pre-change point even though
    // 3-of-3 old members have the entry: 2-of-5 new members is no quorum.
    let commit_before = cluster.status(leader).commit_index;
    std::thread::sleep(Duration::from_millis(500));
    let status = cluster.status(leader);
    assert_eq!(status.commit_index, commit_before);
    assert!(status.last_log_index > status.commit_index);

    cluster.shutdown();
}

#[test]
fn leader_partition_triggers_reelection() {
    let cluster = Cluster::start(3);
    let old_leader = cluster.wait_leader();

    // Cut the leader off from both followers.
    for node in &cluster.nodes {
        if node.id != old_leader {
            cluster.net.disconnect(old_leader, node.id);
        }
    }

    // The remaining majority elects a new leader in a higher term.
    let deadline = Instant::now() + Duration::from_secs(10);
    let new_leader = loop {
        let winner = cluster
            .nodes
            .iter()
            .filter(|n| n.id != old_leader)
            .find(|n| cluster.status(n.id).role == Role::Leader);
        if let Some(node) = winner {
            break node.id;
        }
        assert!(Instant::now() < deadline, "no replacement leader elected");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_ne!(new_leader, old_leader);

    // The isolated leader loses its quorum lease and steps down.
    let deadline = Instant::now() + Duration::from_secs(10);
    while cluster.status(old_leader).role == Role::Leader {
        assert!(Instant::now() < deadline, "old leader never stepped down");
        std::thread::sleep(Duration::from_millis(50));
    }

    // After healing, the old leader adopts the new leader and its term.
    for node in &cluster.nodes {
        cluster.net.heal(old_leader, node.id);
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = cluster.status(old_leader);
        if status.leader_id == new_leader && status.role == Role::Follower {
            break;
        }
        assert!(Instant::now() < deadline, "old leader never rejoined");
        std::thread::sleep(Duration::from_millis(50));
    }

    cluster.shutdown();
}

#[test]
fn expired_read_times_out_without_exec() {
    let cluster = Cluster::start(1);
    let leader = cluster.wait_leader();
    assert!(cluster.put(leader, "k", "v").is_ok());

    // A read whose deadline has already passed completes with a timeout
    // instead of reaching the state machine.
    let deadline = Some(Instant::now() - Duration::from_millis(1));
    assert_eq!(cluster.get(leader, "k", deadline), Err(Error::Timeout));

    // A live read still works.
    assert_eq!(cluster.get(leader, "k", None), Ok(Some("v".to_string())));

    cluster.shutdown();
}

#[test]
fn restart_preserves_log_and_term() {
    let dir = tempfile::tempdir().expect("tempdir");
    let net = LoopbackNet::new();

    let start = |net: &Arc<LoopbackNet>| -> (Server, RaftGroup, Receiver<(u64, String)>) {
        let mut opts = ServerOptions::new(dir.path());
        opts.dispatchers = 1;
        opts.io_threads = 2;
        let mut server = Server::new(opts);
        let mut config = GroupConfig::new(GROUP, 1, vec![1]);
        config.elect_timeout = Duration::from_millis(300);
        let (applied_tx, applied_rx) = unbounded();
        let kv = Kv { data: BTreeMap::new(), applied: applied_tx };
        let group = server.add_group(config, Box::new(kv), net.transport(1)).expect("start");
        net.register(1, group.clone());
        (server, group, applied_rx)
    };

    let (server, group, applied) = start(&net);
    let put = |group: &RaftGroup, key: &str, value: &str| {
        let body = bincode::serialize(&(key, value)).expect("encode");
        let (tx, rx) = bounded(1);
        group
            .submit(RaftInput::write(0, Vec::new(), body), move |result| {
                let _ = tx.send(result.map(|o| o.index));
            })
            .expect("submit");
        rx.recv_timeout(Duration::from_secs(10)).expect("no reply")
    };

    // Wait for leadership, write, and remember where things stood.
    let wait_status = |group: &RaftGroup| -> GroupStatus {
        let (tx, rx) = bounded(1);
        group
            .status(move |s| {
                let _ = tx.send(s);
            })
            .expect("status");
        rx.recv_timeout(Duration::from_secs(5)).expect("no status")
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while wait_status(&group).role != Role::Leader {
        assert!(Instant::now() < deadline, "no leader");
        std::thread::sleep(Duration::from_millis(50));
    }
    let index = put(&group, "persist", "me").expect("put failed");
    let term_before = wait_status(&group).term;
    drop(applied);
    server.shutdown();

    // Restart from the same data directory: the term never regresses and
    // the log replays through the previous write.
    let (server, group, applied) = start(&net);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = wait_status(&group);
        if status.role == Role::Leader && status.last_applied >= index {
            assert!(status.term >= term_before, "term regressed");
            break;
        }
        assert!(Instant::now() < deadline, "restart never recovered");
        std::thread::sleep(Duration::from_millis(50));
    }
    // The write was re-applied from the restored log.
    let replayed: Vec<String> = applied.try_iter().map(|(_, key)| key).collect();
    assert!(replayed.contains(&"persist".to_string()), "write not replayed: {replayed:?}");

    server.shutdown();
}
