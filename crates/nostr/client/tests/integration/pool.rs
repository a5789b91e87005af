//! Pool membership, leases and subscription routing

use super::*;
use nostr_client::{EndpointId, Filter, PoolSubscription, RelayMessage, RelayNotification};
use pretty_assertions::assert_eq;
use tokio::time::{Instant, sleep, timeout};

async fn next(sub: &mut PoolSubscription) -> (EndpointId, RelayNotification) {
    timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("notification timed out")
        .expect("subscription ended")
}

async fn until_eose(sub: &mut PoolSubscription) {
    loop {
        if let (_, RelayNotification::Eose) = next(sub).await {
            return;
        }
    }
}

#[tokio::test]
async fn test_lease_counting_with_grace_window() {
    let (transport, relays) = network(&["wss://hint.example"]);
    let pool = pool(&transport, &test_config());
    let id = relays[0].endpoint();
    pool.add_endpoint(EndpointDescriptor::ephemeral(id.clone()))
        .unwrap();

    pool.acquire_lease([&id]);
    pool.acquire_lease([&id]);
    pool.release_lease([&id]);
    sleep(Duration::from_millis(200)).await;
    assert!(pool.descriptor(&id).is_some());

    pool.release_lease([&id]);
    assert!(pool.descriptor(&id).is_some());
    sleep(Duration::from_millis(250)).await;
    assert!(pool.descriptor(&id).is_none());
    assert!(pool.all_descriptors().is_empty());
}

#[tokio::test]
async fn test_ensure_connected_never_hangs() {
    let (transport, _relays) = network(&[]);
    let pool = pool(&transport, &test_config());
    let ids: Vec<EndpointId> = ["wss://gone-1.example", "wss://gone-2.example"]
        .iter()
        .map(|u| EndpointId::parse(u).unwrap())
        .collect();

    let started = Instant::now();
    let connected = pool.ensure_connected(&ids, Duration::from_millis(300)).await;
    assert!(connected.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.all_descriptors().len(), 2);
}

#[tokio::test]
async fn test_mismatched_subscription_id_does_not_end_stream() {
    let (transport, relays) = network(&["wss://routing.example"]);
    let relay = relays[0].clone();
    let pool = member_pool(&transport, &test_config(), &relays);

    let mut sub = pool
        .subscribe("correct", vec![Filter::new().kinds(vec![1])], [relay.endpoint()])
        .unwrap();
    until_eose(&mut sub).await;

    let event = note(42, "routed");
    relay.inject(&RelayMessage::Event {
        subscription_id: "wrong".to_string(),
        event: event.clone(),
    });
    relay.inject(&RelayMessage::Event {
        subscription_id: "correct".to_string(),
        event: event.clone(),
    });

    assert_eq!(next(&mut sub).await, (relay.endpoint(), RelayNotification::Event(event)));
}

#[tokio::test]
async fn test_interleaved_subscriptions_stay_isolated() {
    let (transport, relays) = network(&["wss://shared.example"]);
    let relay = relays[0].clone();
    let pool = member_pool(&transport, &test_config(), &relays);

    let mut notes = pool
        .subscribe("notes", vec![Filter::new().kinds(vec![1])], [relay.endpoint()])
        .unwrap();
    let mut reactions = pool
        .subscribe("reactions", vec![Filter::new().kinds(vec![7])], [relay.endpoint()])
        .unwrap();
    until_eose(&mut notes).await;
    until_eose(&mut reactions).await;

    for i in 0..10 {
        let (subscription_id, event) = if i % 2 == 0 {
            ("notes", note(i, &format!("note {}", i)))
        } else {
            ("reactions", kind_event(i, 7, &format!("reaction {}", i)))
        };
        relay.inject(&RelayMessage::Event {
            subscription_id: subscription_id.to_string(),
            event,
        });
    }

    for (kind, sub) in [(1u16, &mut notes), (7, &mut reactions)] {
        for _ in 0..5 {
            match next(sub).await {
                (_, RelayNotification::Event(event)) => assert_eq!(event.kind, kind),
                other => panic!("Unexpected notification {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn test_close_terminates_live_handlers() {
    let (transport, relays) = network(&["wss://closing.example"]);
    let pool = member_pool(&transport, &test_config(), &relays);
    let mut sub = pool
        .subscribe("doomed", vec![Filter::new()], [relays[0].endpoint()])
        .unwrap();
    until_eose(&mut sub).await;

    pool.close();
    loop {
        match timeout(Duration::from_secs(2), sub.recv()).await.unwrap() {
            Some((_, RelayNotification::Terminated)) => break,
            Some(_) => continue,
            None => panic!("handler dropped without a terminal marker"),
        }
    }
}
