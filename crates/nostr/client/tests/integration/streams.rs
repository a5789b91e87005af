//! Local + network streams

use super::*;
use nostr_client::memory::NegentropyPolicy;
use nostr_client::{
    AdvancedStream, CloseReason, EndpointId, EventId, Filter, Optimization, StoreGate, StreamItem,
    StreamMode, SubscriptionEngine,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use tokio::time::{Instant, timeout};

struct Delivered {
    before_local_eose: Vec<EventId>,
    after_local_eose: Vec<EventId>,
    markers: Vec<StreamItem>,
}

async fn drain(mut stream: AdvancedStream) -> Delivered {
    let mut delivered = Delivered {
        before_local_eose: Vec::new(),
        after_local_eose: Vec::new(),
        markers: Vec::new(),
    };
    let mut local_done = false;
    while let Some(item) = timeout(Duration::from_secs(10), stream.recv())
        .await
        .expect("stream did not finish")
    {
        match item {
            StreamItem::Event(lender) if local_done => delivered.after_local_eose.push(lender.id()),
            StreamItem::Event(lender) => delivered.before_local_eose.push(lender.id()),
            StreamItem::LocalEose => {
                local_done = true;
                delivered.markers.push(StreamItem::LocalEose);
            }
            marker => delivered.markers.push(marker),
        }
    }
    delivered
}

fn engine_for(
    relays: &[MemoryRelay],
    transport: &MemoryTransport,
) -> (SubscriptionEngine, Arc<StoreGate>) {
    let mut config = test_config();
    config.subscription.endpoints = relays.iter().map(|r| r.endpoint()).collect();
    config.subscription.connect_timeout = Duration::from_millis(500);
    config.subscription.eose_timeout = Duration::from_secs(1);
    config.reconciliation.first_response_timeout = Duration::from_millis(200);
    config.reconciliation.fetch_timeout = Duration::from_secs(1);

    let store = Arc::new(StoreGate::memory(config.subscription.local_read_timeout));
    let engine = SubscriptionEngine::new(pool(transport, &config), Arc::clone(&store), &config);
    (engine, store)
}

fn notes() -> Vec<Filter> {
    vec![Filter::new().kinds(vec![1])]
}

#[tokio::test]
async fn test_reconciliation_stream_yields_local_then_missing() {
    let (transport, relays) = network(&["wss://sync.example"]);
    let (a, b) = (note(1, "A"), note(2, "B"));
    relays[0].add_events([a.clone(), b.clone()]);
    let (engine, store) = engine_for(&relays, &transport);
    store.write(a.clone()).await.unwrap();

    let delivered = drain(engine.advanced_stream(
        notes(),
        StreamMode::LocalAndNetworkParallel(Optimization::Reconciliation),
        None,
    ))
    .await;

    assert_eq!(delivered.before_local_eose, vec![a.id]);
    assert_eq!(delivered.after_local_eose, vec![b.id]);
    assert_eq!(
        delivered.markers,
        vec![StreamItem::LocalEose, StreamItem::NetworkEose, StreamItem::Eose]
    );
    assert!(store.lookup(&b.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_parallel_stream_never_repeats_an_event() {
    let (transport, relays) = network(&["wss://one.example", "wss://two.example"]);
    let events: Vec<Event> = (0..12).map(|i| note(i, &format!("n{}", i))).collect();
    relays[0].add_events(events[..8].iter().cloned());
    relays[1].add_events(events[4..].iter().cloned());
    let (engine, store) = engine_for(&relays, &transport);
    for event in events.iter().step_by(3) {
        store.write(event.clone()).await.unwrap();
    }

    for optimization in [Optimization::None, Optimization::Reconciliation] {
        // Network events from the previous run were persisted.
        let local: HashSet<EventId> = store
            .enumerate(&notes())
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        let delivered = drain(engine.advanced_stream(
            notes(),
            StreamMode::LocalAndNetworkParallel(optimization),
            None,
        ))
        .await;

        let all: Vec<EventId> = delivered
            .before_local_eose
            .iter()
            .chain(&delivered.after_local_eose)
            .copied()
            .collect();
        let unique: HashSet<EventId> = all.iter().copied().collect();
        assert_eq!(all.len(), unique.len(), "{:?} repeated an event", optimization);
        assert_eq!(unique.len(), events.len());
        assert!(delivered.before_local_eose.iter().all(|id| local.contains(id)));
    }
}

#[tokio::test]
async fn test_stalled_reconciliation_still_covers_the_filter() {
    let (transport, relays) = network(&["wss://stalled.example"]);
    relays[0].set_negentropy_policy(NegentropyPolicy::Silent);
    let remote: Vec<Event> = (0..5).map(|i| note(i, &format!("r{}", i))).collect();
    relays[0].add_events(remote.clone());
    let (engine, _store) = engine_for(&relays, &transport);

    let delivered = drain(engine.advanced_stream(
        notes(),
        StreamMode::LocalAndNetworkParallel(Optimization::Reconciliation),
        None,
    ))
    .await;

    let got: HashSet<EventId> = delivered.after_local_eose.into_iter().collect();
    let want: HashSet<EventId> = remote.iter().map(|e| e.id).collect();
    assert_eq!(got, want);
}

#[tokio::test]
async fn test_unreachable_endpoints_resolve_in_time() {
    let (transport, _relays) = network(&[]);
    let mut config = test_config();
    config.subscription.endpoints = vec![
        EndpointId::parse("wss://nowhere-1.example").unwrap(),
        EndpointId::parse("wss://nowhere-2.example").unwrap(),
    ];
    config.subscription.connect_timeout = Duration::from_millis(300);
    let store = Arc::new(StoreGate::memory(Duration::from_secs(1)));
    let engine = SubscriptionEngine::new(pool(&transport, &config), store, &config);

    for mode in [
        StreamMode::NetworkOnly,
        StreamMode::LocalThenNetworkSequential,
        StreamMode::LocalAndNetworkParallel(Optimization::None),
        StreamMode::LocalAndNetworkParallel(Optimization::Reconciliation),
    ] {
        let started = Instant::now();
        let delivered = drain(engine.advanced_stream(notes(), mode, None)).await;
        assert!(started.elapsed() < Duration::from_secs(2), "{:?} took too long", mode);
        assert_eq!(delivered.markers.last(), Some(&StreamItem::Eose));
    }
}

#[tokio::test]
async fn test_store_close_ends_local_phase() {
    let (transport, relays) = network(&["wss://any.example"]);
    let (engine, store) = engine_for(&relays, &transport);
    store.close().await;

    let delivered = drain(engine.advanced_stream(
        notes(),
        StreamMode::LocalThenNetworkSequential,
        None,
    ))
    .await;
    assert_eq!(
        delivered.markers,
        vec![StreamItem::Closed(CloseReason::StoreClosed)]
    );
}
