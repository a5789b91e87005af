//! Reliable publishing across several relays

use super::*;
use nostr_client::memory::AckPolicy;
use nostr_client::{ClientError, FlushOutcome, Outbox, OutboxConfig, SendOptions};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::timeout;

#[tokio::test]
async fn test_partial_then_full_acknowledgement() {
    let (transport, relays) = network(&["wss://r1.example", "wss://r2.example"]);
    let (r1, r2) = (relays[0].clone(), relays[1].clone());
    r2.set_ack_policy(AckPolicy::Silent);

    let outbox = Outbox::new(
        member_pool(&transport, &test_config(), &relays),
        OutboxConfig::default(),
    );
    let event = note(100, "scenario a");
    let fired = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&fired);
    let handle = outbox.send(
        event.clone(),
        [r1.endpoint(), r2.endpoint()],
        SendOptions::default().on_flush(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // r1 acks on its own once connected.
    let mut remaining = BTreeSet::new();
    for _ in 0..100 {
        remaining = outbox.entry(&event.id).map(|e| e.remaining).unwrap_or_default();
        if remaining.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining, BTreeSet::from([r2.endpoint()]));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    outbox.handle_ack(&r2.endpoint(), &event.id, true, "");
    let outcome = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

    assert!(outbox.entry(&event.id).is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(outcome.is_flushed());
    assert_eq!(outcome.report().acks.len(), 2);
}

#[tokio::test]
async fn test_negative_ack_is_reported_not_raised() {
    let (transport, relays) = network(&["wss://strict.example"]);
    relays[0].set_ack_policy(AckPolicy::Reject("blocked: spam".into()));

    let outbox = Outbox::new(
        member_pool(&transport, &test_config(), &relays),
        OutboxConfig::default(),
    );
    let event = note(1, "rejected");
    let outcome = timeout(
        Duration::from_secs(2),
        outbox.send(event.clone(), [relays[0].endpoint()], SendOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();

    let errors = outcome.report().errors();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        ClientError::Ack { message, event_id, .. } => {
            assert_eq!(message, "blocked: spam");
            assert_eq!(*event_id, event.id);
        }
        other => panic!("Expected Ack error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resend_merges_into_one_entry() {
    let (transport, relays) = network(&["wss://a.example", "wss://b.example"]);
    for relay in &relays {
        relay.set_ack_policy(AckPolicy::Silent);
    }
    let outbox = Outbox::new(
        member_pool(&transport, &test_config(), &relays),
        OutboxConfig::default(),
    );
    let event = note(5, "merged");

    let first = outbox.send(event.clone(), [relays[0].endpoint()], SendOptions::default());
    let second = outbox.send(event.clone(), [relays[1].endpoint()], SendOptions::default());
    assert_eq!(outbox.pending_ids(), vec![event.id]);
    assert_eq!(outbox.entry(&event.id).unwrap().remaining.len(), 2);

    outbox.handle_ack(&relays[0].endpoint(), &event.id, true, "");
    outbox.handle_ack(&relays[1].endpoint(), &event.id, true, "");
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn test_offline_target_is_held_until_reconnect() {
    let (transport, relays) = network(&["wss://flaky.example"]);
    let relay = relays[0].clone();
    relay.set_accepting(false);

    let outbox = Outbox::new(
        member_pool(&transport, &test_config(), &relays),
        OutboxConfig::default(),
    );
    let event = note(9, "held");
    let handle = outbox.send(event.clone(), [relay.endpoint()], SendOptions::default());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(outbox.entry(&event.id).is_some());
    assert!(relay.events().is_empty());

    relay.set_accepting(true);
    let outcome = timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    assert!(outcome.is_flushed());
    assert_eq!(relay.events(), vec![event]);
}

#[tokio::test]
async fn test_cancel_is_distinguishable_from_flush() {
    let (transport, relays) = network(&["wss://slow.example"]);
    relays[0].set_ack_policy(AckPolicy::Silent);
    let outbox = Outbox::new(
        member_pool(&transport, &test_config(), &relays),
        OutboxConfig::default(),
    );
    let event = note(3, "cancelled");

    let handle = outbox.send(
        event.clone(),
        [relays[0].endpoint()],
        SendOptions::delayed(Duration::from_secs(60)),
    );
    outbox.cancel(&event.id).unwrap();
    assert!(matches!(outbox.cancel(&event.id), Err(ClientError::NotFound(_))));

    match handle.await.unwrap() {
        FlushOutcome::Cancelled(report) => {
            assert_eq!(report.unanswered, BTreeSet::from([relays[0].endpoint()]))
        }
        other => panic!("Expected Cancelled, got {:?}", other),
    }
}
