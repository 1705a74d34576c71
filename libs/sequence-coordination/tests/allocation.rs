//! Many simulated instances sharing one in-memory coordination tree.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sequence_coordination::{
    ConnectionManager, CoordinationError, MemoryEnsemble, ReadinessPolicy, SequenceAllocator,
    SessionWatcher,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const ROOT: &str = "/sequence";

fn instance(ensemble: &MemoryEnsemble, name: &str, attempts: u32) -> SequenceAllocator<MemoryEnsemble> {
    let connection = ConnectionManager::new(
        ensemble.clone(),
        SessionWatcher::new(),
        ReadinessPolicy::default(),
    );
    SequenceAllocator::new(connection, ROOT, name, attempts)
}

async fn session_id(alloc: &SequenceAllocator<MemoryEnsemble>) -> u64 {
    alloc.connection().active_session().await.unwrap().id()
}

#[tokio::test]
async fn gap_in_claims_is_filled() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed_claims(ROOT, &[1, 2, 4]);

    let alloc = instance(&ensemble, "host-c", 5);
    let number = alloc.ensure_assigned(&CancellationToken::new()).await.unwrap();

    assert_eq!(number, 3);
    assert_eq!(ensemble.claims(ROOT).get(&3).unwrap(), "host-c");
}

#[tokio::test]
async fn number_is_reused_after_departure() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed_claims(ROOT, &[1, 3]);
    let cancel = CancellationToken::new();

    let leaving = instance(&ensemble, "host-leaving", 5);
    assert_eq!(leaving.ensure_assigned(&cancel).await.unwrap(), 2);

    let id = session_id(&leaving).await;
    ensemble.disconnect(id).await;
    assert_eq!(leaving.assigned(), None);
    assert_eq!(ensemble.claims(ROOT).keys().copied().collect::<Vec<_>>(), vec![1, 3]);

    let joining = instance(&ensemble, "host-joining", 5);
    assert_eq!(joining.ensure_assigned(&cancel).await.unwrap(), 2);
    assert_eq!(ensemble.claims(ROOT).get(&2).unwrap(), "host-joining");
}

#[tokio::test]
async fn session_loss_forces_a_fresh_claim() {
    let ensemble = MemoryEnsemble::new();
    let cancel = CancellationToken::new();
    let alloc = instance(&ensemble, "host-a", 5);

    assert_eq!(alloc.ensure_assigned(&cancel).await.unwrap(), 1);

    // still connected: cached, no round trips
    let before = ensemble.stats();
    assert_eq!(alloc.ensure_assigned(&cancel).await.unwrap(), 1);
    assert_eq!(ensemble.stats(), before);

    let id = session_id(&alloc).await;
    ensemble.expire(id).await;
    assert_eq!(alloc.assigned(), None);

    // another instance takes 1 while we are away
    let other = instance(&ensemble, "host-b", 5);
    assert_eq!(other.ensure_assigned(&cancel).await.unwrap(), 1);

    let before = ensemble.stats();
    assert_eq!(alloc.ensure_assigned(&cancel).await.unwrap(), 2);
    let after = ensemble.stats();
    assert_eq!(after.children, before.children + 1);
    // root is checked again on the new session
    assert_eq!(after.exists, before.exists + 1);
    assert_eq!(ensemble.sessions_opened(), 3);
}

#[tokio::test]
async fn every_create_colliding_exhausts_the_budget() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed_claims(ROOT, &[]);
    ensemble.collide_all_creates(true);
    let alloc = instance(&ensemble, "host-a", 5);

    let err = alloc
        .ensure_assigned(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinationError::AllocationExhausted { attempts: 5 }));
    let stats = ensemble.stats();
    assert_eq!(stats.creates, 5);
    assert_eq!(stats.children, 5);
    assert_eq!(alloc.assigned(), None);
}

#[tokio::test]
async fn lost_races_are_recomputed() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed_claims(ROOT, &[]);
    ensemble.steal_next_claims(2);
    let alloc = instance(&ensemble, "host-a", 5);

    let number = alloc
        .ensure_assigned(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(number, 3);
    assert_eq!(ensemble.stats().children, 3);
}

#[tokio::test]
async fn concurrent_instances_get_unique_dense_numbers() {
    const INSTANCES: u32 = 6;
    let ensemble = MemoryEnsemble::new();

    let mut allocators = Vec::new();
    let mut tasks = JoinSet::new();
    for i in 0..INSTANCES {
        let alloc = Arc::new(instance(&ensemble, &format!("host-{i}"), INSTANCES));
        allocators.push(Arc::clone(&alloc));
        tasks.spawn(async move { alloc.ensure_assigned(&CancellationToken::new()).await });
    }

    let mut numbers = BTreeSet::new();
    while let Some(res) = tasks.join_next().await {
        assert!(numbers.insert(res.unwrap().unwrap()));
    }
    assert_eq!(numbers, (1..=INSTANCES).collect::<BTreeSet<_>>());

    // two instances leave, two new ones fill their numbers
    let mut departed = BTreeSet::new();
    for alloc in allocators.iter().filter(|a| matches!(a.assigned(), Some(2) | Some(5))) {
        departed.insert(alloc.assigned().unwrap());
        let id = session_id(alloc).await;
        ensemble.expire(id).await;
    }
    assert_eq!(departed, BTreeSet::from([2, 5]));

    // the new instances stay alive: dropping one closes its session
    let mut joined = Vec::new();
    let mut tasks = JoinSet::new();
    for i in 0..2 {
        let alloc = Arc::new(instance(&ensemble, &format!("host-new-{i}"), INSTANCES));
        joined.push(Arc::clone(&alloc));
        tasks.spawn(async move { alloc.ensure_assigned(&CancellationToken::new()).await });
    }
    let mut refilled = BTreeSet::new();
    while let Some(res) = tasks.join_next().await {
        assert!(refilled.insert(res.unwrap().unwrap()));
    }
    assert_eq!(refilled, departed);
    assert_eq!(
        ensemble.claims(ROOT).keys().copied().collect::<BTreeSet<_>>(),
        (1..=INSTANCES).collect::<BTreeSet<_>>()
    );
    assert_eq!(
        joined.iter().filter_map(|a| a.assigned()).collect::<BTreeSet<_>>(),
        departed
    );
}

#[tokio::test]
async fn concurrent_root_creation_is_tolerated() {
    let ensemble = MemoryEnsemble::new();
    let a = instance(&ensemble, "host-a", 5);
    let b = instance(&ensemble, "host-b", 5);
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(a.ensure_assigned(&cancel), b.ensure_assigned(&cancel));

    let mut numbers = vec![first.unwrap(), second.unwrap()];
    numbers.sort();
    assert_eq!(numbers, vec![1, 2]);
    assert!(ensemble.node_exists(ROOT));
}

#[tokio::test]
async fn concurrent_requests_in_one_process_claim_once() {
    let ensemble = MemoryEnsemble::new();
    let alloc = instance(&ensemble, "host-a", 5);
    let cancel = CancellationToken::new();

    let (a, b, c) = tokio::join!(
        alloc.ensure_assigned(&cancel),
        alloc.ensure_assigned(&cancel),
        alloc.ensure_assigned(&cancel)
    );

    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
    assert_eq!(ensemble.claims(ROOT).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_ensemble_times_out() {
    let ensemble = MemoryEnsemble::unreachable();
    let alloc = instance(&ensemble, "host-a", 5);
    let start = tokio::time::Instant::now();

    let err = alloc
        .ensure_assigned(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(5), "gave up early: {waited:?}");
    assert!(waited < Duration::from_millis(5100), "waited too long: {waited:?}");
    assert_eq!(ensemble.stats().creates, 0);
}

#[tokio::test]
async fn shutdown_releases_the_claim() {
    let ensemble = MemoryEnsemble::new();
    let cancel = CancellationToken::new();

    let first = instance(&ensemble, "host-first", 5);
    assert_eq!(first.ensure_assigned(&cancel).await.unwrap(), 1);
    first.connection().shutdown();
    assert!(ensemble.claims(ROOT).is_empty());

    let second = instance(&ensemble, "host-second", 5);
    assert_eq!(second.ensure_assigned(&cancel).await.unwrap(), 1);
}
