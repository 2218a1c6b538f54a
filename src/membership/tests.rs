use std::net::SocketAddr;

use super::service::MembershipService;
use super::types::NodeState;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn new_service_knows_itself() {
    let service = MembershipService::new(loopback(), "127.0.0.1:6100".parse().unwrap(), vec![])
        .await
        .expect("failed to create service");

    assert_eq!(service.members.len(), 1);

    let members = service.get_alive_members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].state, NodeState::Alive);
    assert_eq!(members[0].id, service.local_node.id);
}

#[tokio::test]
async fn unknown_http_addr_counts_as_dead() {
    let http_addr: SocketAddr = "127.0.0.1:6200".parse().unwrap();
    let service = MembershipService::new(loopback(), http_addr, vec![])
        .await
        .unwrap();

    // Our own address is alive, an address nobody serves is dead.
    assert!(!service.is_dead_node(http_addr));
    assert!(service.is_dead_node("127.0.0.1:1".parse().unwrap()));
}

#[tokio::test]
async fn get_member_resolves_local_node() {
    let service = MembershipService::new(loopback(), "127.0.0.1:6300".parse().unwrap(), vec![])
        .await
        .unwrap();

    let found = service.get_member(&service.local_node.id);
    assert!(found.is_some());
    assert_eq!(found.unwrap().http_addr, service.local_node.http_addr);
}
