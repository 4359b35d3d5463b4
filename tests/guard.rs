//! End-to-end guard scenarios against the in-memory rule engine.
//!
//! Time is paused so the eviction tick can be driven deterministically.

use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

use destguard::config::{FirewallConfiguration, Mode};
use destguard::guard::DestinationGuard;
use destguard::netfilter::{
    ip_to_bytes, AddressFamily, Command, Match, MemoryEngine, SetElement, Table,
};
use destguard::range::range_of;

fn table() -> Table {
    Table::new("destguard")
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn bytes(s: &str) -> Vec<u8> {
    ip_to_bytes(ip(s))
}

/// Element additions committed so far, per commit.
fn add_commits(engine: &MemoryEngine) -> Vec<Vec<(String, Vec<SetElement>)>> {
    engine
        .commits()
        .into_iter()
        .map(|tx| {
            tx.commands
                .into_iter()
                .filter_map(|c| match c {
                    Command::AddElements { set, elements } => Some((set, elements)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .filter(|adds| !adds.is_empty())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn scenario_a_single_answer() {
    let engine = MemoryEngine::new();
    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Local), engine.clone()).unwrap();

    let start = Instant::now();
    guard.observed_answer(vec![bytes("192.168.1.1")], 300).await.unwrap();

    let entries = guard.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].address, ip("192.168.1.1"));
    assert_eq!(entries[0].expires_at, start + Duration::from_secs(330));

    let adds = add_commits(&engine);
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].len(), 1);
    assert_eq!(adds[0][0].0, "allow_v4");
    assert_eq!(engine.addresses(&table(), "allow_v4"), vec![ip("192.168.1.1")]);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_reobservation_extends_without_kernel_write() {
    let engine = MemoryEngine::new();
    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Local), engine.clone()).unwrap();

    let start = Instant::now();
    guard.observed_answer(vec![bytes("192.168.1.1")], 60).await.unwrap();
    guard.observed_answer(vec![bytes("192.168.1.1")], 300).await.unwrap();

    let entries = guard.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].expires_at, start + Duration::from_secs(330));
    assert_eq!(add_commits(&engine).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_shorter_ttl_second() {
    let engine = MemoryEngine::new();
    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Local), engine.clone()).unwrap();

    let start = Instant::now();
    guard.observed_answer(vec![bytes("2001:db8::1")], 300).await.unwrap();
    guard.observed_answer(vec![bytes("2001:db8::1")], 60).await.unwrap();

    let entries = guard.entries().await.unwrap();
    assert_eq!(entries[0].expires_at, start + Duration::from_secs(330));
    assert_eq!(add_commits(&engine).len(), 1);
    assert_eq!(engine.addresses(&table(), "allow_v6"), vec![ip("2001:db8::1")]);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_permanent_interval_set() {
    let engine = MemoryEngine::new();
    let mut config = FirewallConfiguration::new(Mode::Local);
    config.allowed.v4.push(range_of("10.0.0.0/24").unwrap());
    let (_guard, _worker) = DestinationGuard::start(&config, engine.clone()).unwrap();

    let set = engine
        .rules(&table(), "output")
        .into_iter()
        .find_map(|rule| match rule.matcher {
            Some(Match::Destination {
                family: AddressFamily::V4,
                set,
            }) if set != "allow_v4" => Some(set),
            _ => None,
        })
        .unwrap();

    let (definition, elements) = engine.set(&table(), &set).unwrap();
    assert!(definition.interval);
    assert_eq!(
        elements,
        vec![
            SetElement::new(vec![10, 0, 0, 0]),
            SetElement::interval_end(vec![10, 0, 1, 0]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_d_recovered_entry_evicted_after_grace() {
    let engine = MemoryEngine::new();
    engine.seed_set(&table(), "allow_v4", AddressFamily::V4, &[ip("203.0.113.7")]);

    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Local), engine.clone()).unwrap();
    assert_eq!(guard.entries().await.unwrap().len(), 1);

    // Recovered with a 330s grace: still there just before it runs out
    tokio::time::sleep(Duration::from_secs(329)).await;
    guard.sync().await.unwrap();
    assert_eq!(engine.addresses(&table(), "allow_v4"), vec![ip("203.0.113.7")]);

    // The first tick past the grace window removes it
    tokio::time::sleep(Duration::from_secs(32)).await;
    guard.sync().await.unwrap();
    assert!(guard.entries().await.unwrap().is_empty());
    assert!(engine.addresses(&table(), "allow_v4").is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_d_reconfirmed_entry_survives() {
    let engine = MemoryEngine::new();
    engine.seed_set(&table(), "allow_v4", AddressFamily::V4, &[ip("203.0.113.7")]);

    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Local), engine.clone()).unwrap();
    guard.observed_answer(vec![bytes("203.0.113.7")], 3600).await.unwrap();

    tokio::time::sleep(Duration::from_secs(400)).await;
    guard.sync().await.unwrap();
    assert_eq!(engine.addresses(&table(), "allow_v4"), vec![ip("203.0.113.7")]);
    // Already in the kernel: re-confirmation wrote nothing
    assert!(add_commits(&engine).is_empty());
}

#[tokio::test(start_paused = true)]
async fn kernel_failure_heals_on_next_event() {
    let engine = MemoryEngine::new();
    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Both), engine.clone()).unwrap();

    engine.fail_next_commits(1);
    guard.observed_answer(vec![bytes("198.51.100.1")], 600).await.unwrap();
    guard.sync().await.unwrap();
    assert!(engine.addresses(&table(), "allow_v4").is_empty());
    assert_eq!(guard.entries().await.unwrap().len(), 1);

    // Next tick carries the missed addition
    tokio::time::sleep(Duration::from_secs(31)).await;
    guard.sync().await.unwrap();
    assert_eq!(engine.addresses(&table(), "allow_v4"), vec![ip("198.51.100.1")]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_producers_share_one_store() {
    let engine = MemoryEngine::new();
    let (guard, _worker) =
        DestinationGuard::start(&FirewallConfiguration::new(Mode::Gateway), engine.clone())
            .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let guard = guard.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..16u8 {
                guard
                    .observed_answer(vec![vec![10, 1, i, j], vec![10, 1, 0, 0]], 120)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    guard.sync().await.unwrap();
    // 10.1.0.0 is also produced by i = 0, j = 0
    assert_eq!(guard.entries().await.unwrap().len(), 128);
    assert_eq!(engine.addresses(&table(), "allow_v4").len(), 128);
}
