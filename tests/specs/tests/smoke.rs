// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests driving the client against in-process mock relays:
//! subscription strategies, pool reconciliation, publication acks, and
//! disposal.

use std::time::Duration;

use serde_json::json;

use nostrmux::{
    ClientConfig, ConnectionState, EventParams, Filter, NostrClient, ReqSource,
};
use nostrmux_specs::{event_json, wait_for_state, MockRelay, TIMEOUT};

const SK_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

/// A short window in which nothing is expected to happen.
const QUIET: Duration = Duration::from_millis(300);

async fn connected_client(relay: &MockRelay) -> anyhow::Result<NostrClient> {
    let client = NostrClient::new(ClientConfig::default());
    client.add_relay(relay.url());
    wait_for_state(&client, relay.url(), ConnectionState::Ongoing).await?;
    Ok(client)
}

// -- backward -----------------------------------------------------------------

#[tokio::test]
async fn backward_eose_triggers_close() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::backward("sub");
    let mut events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([0]).limit(5)]);

    let req = relay.recv_frame().await?;
    assert_eq!(req, json!(["REQ", "sub:0", {"kinds": [0], "limit": 5}]));

    relay.send(r#"["EOSE","sub:0"]"#);
    let close = relay.recv_frame().await?;
    assert_eq!(close, json!(["CLOSE", "sub:0"]));

    // The emitter is still alive: the caller's stream stays open.
    let pending = tokio::time::timeout(QUIET, events.recv()).await;
    assert!(pending.is_err(), "backward stream completed early");

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn backward_closes_follow_eose_order() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::backward("sub");
    let _events = client.subscribe(source);
    for limit in [3u64, 2, 1] {
        emitter.emit(vec![Filter::kinds([0]).limit(limit)]);
    }

    for (index, limit) in [(0, 3u64), (1, 2), (2, 1)] {
        let req = relay.recv_frame().await?;
        assert_eq!(req, json!(["REQ", format!("sub:{index}"), {"kinds": [0], "limit": limit}]));
    }

    // The smallest query drains first; CLOSEs track EOSE arrival order.
    for index in [2, 1, 0] {
        relay.send(format!(r#"["EOSE","sub:{index}"]"#));
        let close = relay.recv_frame().await?;
        assert_eq!(close, json!(["CLOSE", format!("sub:{index}")]));
    }

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn backward_drops_events_after_eose() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::backward("sub");
    let mut events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([1])]);
    relay.recv_frame().await?; // REQ

    relay.send(json!(["EVENT", "sub:0", event_json(1, 1)]).to_string());
    relay.send(r#"["EOSE","sub:0"]"#);
    relay.recv_frame().await?; // CLOSE
    relay.send(json!(["EVENT", "sub:0", event_json(2, 1)]).to_string());

    let first = tokio::time::timeout(TIMEOUT, events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("stream completed before first event"))?;
    assert_eq!(first.event.content, "event 1");

    // The post-EOSE event never surfaces.
    let pending = tokio::time::timeout(QUIET, events.recv()).await;
    assert!(pending.is_err(), "event leaked past EOSE");

    client.dispose();
    Ok(())
}

// -- forward ------------------------------------------------------------------

#[tokio::test]
async fn forward_reuses_sub_id_and_closes_once() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::forward("sub");
    let events = client.subscribe(source);
    for limit in [3u64, 2, 1] {
        emitter.emit(vec![Filter::kinds([0]).limit(limit)]);
    }

    for limit in [3u64, 2, 1] {
        let req = relay.recv_frame().await?;
        assert_eq!(req, json!(["REQ", "sub:0", {"kinds": [0], "limit": limit}]));
    }

    drop(events);
    let close = relay.recv_frame().await?;
    assert_eq!(close, json!(["CLOSE", "sub:0"]));
    relay.expect_silence(QUIET).await?;

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn forward_delivers_matching_events() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::forward("live");
    let mut events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([1])]);
    relay.recv_frame().await?; // REQ

    relay.send(json!(["EVENT", "live:0", event_json(7, 1)]).to_string());
    // Frames for other subscriptions are not routed here.
    relay.send(json!(["EVENT", "other:0", event_json(8, 1)]).to_string());

    let packet = tokio::time::timeout(TIMEOUT, events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("forward stream completed"))?;
    assert_eq!(packet.sub_id, "live:0");
    assert_eq!(packet.from, relay.url());
    assert_eq!(packet.event.content, "event 7");

    let pending = tokio::time::timeout(QUIET, events.recv()).await;
    assert!(pending.is_err(), "foreign event leaked into the stream");

    client.dispose();
    Ok(())
}

// -- oneshot ------------------------------------------------------------------

#[tokio::test]
async fn oneshot_completes_on_eose() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::oneshot("once");
    let mut events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([0])]);
    relay.recv_frame().await?; // REQ

    relay.send(r#"["EOSE","once:0"]"#);
    let close = relay.recv_frame().await?;
    assert_eq!(close, json!(["CLOSE", "once:0"]));

    let done = tokio::time::timeout(TIMEOUT, events.recv()).await?;
    assert!(done.is_none(), "oneshot stream should complete after EOSE");

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn oneshot_honors_only_the_first_emission() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::oneshot("once");
    let _events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([0]).limit(1)]);
    emitter.emit(vec![Filter::kinds([9]).limit(9)]);

    let req = relay.recv_frame().await?;
    assert_eq!(req, json!(["REQ", "once:0", {"kinds": [0], "limit": 1}]));
    relay.expect_silence(QUIET).await?;

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn oneshot_aggregates_mixed_speed_relays() -> anyhow::Result<()> {
    let fast = MockRelay::start().await?;
    let slow = MockRelay::start().await?;

    let client = NostrClient::new(ClientConfig::default());
    client.switch_relays([fast.url(), slow.url()]);
    wait_for_state(&client, fast.url(), ConnectionState::Ongoing).await?;
    wait_for_state(&client, slow.url(), ConnectionState::Ongoing).await?;

    let (source, emitter) = ReqSource::oneshot("mixed");
    let mut events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([1]).limit(3)]);

    fast.recv_frame().await?; // REQ
    slow.recv_frame().await?; // REQ

    let feed_fast = async {
        for seed in 1..=3u8 {
            fast.send(json!(["EVENT", "mixed:0", event_json(seed, 1)]).to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fast.send(r#"["EOSE","mixed:0"]"#);
    };
    let feed_slow = async {
        for seed in 11..=13u8 {
            slow.send(json!(["EVENT", "mixed:0", event_json(seed, 1)]).to_string());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        slow.send(r#"["EOSE","mixed:0"]"#);
    };
    tokio::join!(feed_fast, feed_slow);

    let mut collected = 0usize;
    while let Some(packet) =
        tokio::time::timeout(TIMEOUT, events.recv()).await?
    {
        assert_eq!(packet.sub_id, "mixed:0");
        collected += 1;
    }
    assert_eq!(collected, 6, "expected all events from both relays");

    client.dispose();
    Ok(())
}

// -- pool ---------------------------------------------------------------------

#[tokio::test]
async fn pool_add_rehydrates_forward_req() -> anyhow::Result<()> {
    let first = MockRelay::start().await?;
    let client = connected_client(&first).await?;

    let (source, emitter) = ReqSource::forward("sub");
    let _events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([0]).limit(5)]);
    let req = first.recv_frame().await?;

    let second = MockRelay::start().await?;
    client.add_relay(second.url());

    // The new relay receives the most recent REQ, exactly once.
    let replayed = second.recv_frame().await?;
    assert_eq!(replayed, req);
    second.expect_silence(QUIET).await?;

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn remove_relay_finalizes_active_subs() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let (source, emitter) = ReqSource::forward("sub");
    let _events = client.subscribe(source);
    emitter.emit(vec![Filter::kinds([0])]);
    relay.recv_frame().await?; // REQ

    client.remove_relay(relay.url());
    let close = relay.recv_frame().await?;
    assert_eq!(close, json!(["CLOSE", "sub:0"]));

    assert!(client.relay_state(relay.url()).is_err());

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn connection_states_surface_on_the_aggregator() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = NostrClient::new(ClientConfig::default());
    let mut states = client.connection_states();

    client.add_relay(relay.url());

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !seen.contains(&ConnectionState::Ongoing) {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("never observed ongoing; saw {seen:?}");
        }
        if let Ok(Ok(packet)) =
            tokio::time::timeout(Duration::from_millis(100), states.recv()).await
        {
            assert_eq!(packet.from, relay.url());
            seen.push(packet.state);
        }
    }
    assert_eq!(seen.first(), Some(&ConnectionState::Starting));

    client.dispose();
    Ok(())
}

// -- publication --------------------------------------------------------------

#[tokio::test]
async fn publish_collects_matching_ok() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let params = EventParams { kind: 1, content: "ship it".to_owned(), ..Default::default() };
    let mut acks = client.publish_with_key(params, SK_ONE).await?;
    let event_id = acks.event().id.clone();

    let frame = relay.recv_frame().await?;
    assert_eq!(frame[0], "EVENT");
    assert_eq!(frame[1]["id"].as_str(), Some(event_id.as_str()));

    // An OK for some other publication must not be collected.
    relay.send(json!(["OK", "ff".repeat(32), true, ""]).to_string());
    relay.send(json!(["OK", event_id.clone(), true, "saved"]).to_string());

    let packet = tokio::time::timeout(TIMEOUT, acks.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no acknowledgement"))?;
    assert_eq!(packet.from, relay.url());
    assert_eq!(packet.id, event_id);
    assert!(packet.accepted);

    // One writable relay: the stream completes after one packet.
    let done = tokio::time::timeout(TIMEOUT, acks.recv()).await?;
    assert!(done.is_none());

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn auth_frame_reaches_the_challenged_relay() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let params = EventParams { kind: 22242, content: String::new(), ..Default::default() };
    let signed = nostrmux::KeySigner::from_hex(SK_ONE)?.sign_params(&params);
    client.send_auth(relay.url(), signed.clone())?;

    let frame = relay.recv_frame().await?;
    assert_eq!(frame[0], "AUTH");
    assert_eq!(frame[1]["id"].as_str(), Some(signed.id.as_str()));

    assert!(client.send_auth("wss://not.in.pool", signed).is_err());

    client.dispose();
    Ok(())
}

#[tokio::test]
async fn publish_without_key_or_signer_fails() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    let result = client.publish(EventParams::default()).await;
    assert!(result.is_err());

    client.dispose();
    Ok(())
}

// -- disposal -----------------------------------------------------------------

#[tokio::test]
async fn dispose_is_idempotent_and_quiesces() -> anyhow::Result<()> {
    let relay = MockRelay::start().await?;
    let client = connected_client(&relay).await?;

    client.dispose();
    client.dispose(); // second call is a no-op

    // Mutations after dispose do nothing.
    client.add_relay(relay.url());
    assert!(client.relays().is_empty());

    // Fan-in streams are complete.
    let mut messages = client.all_messages();
    assert!(matches!(
        messages.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    ));

    // New subscriptions complete immediately.
    let (source, _emitter) = ReqSource::backward("late");
    let mut events = client.subscribe(source);
    let done = tokio::time::timeout(TIMEOUT, events.recv()).await?;
    assert!(done.is_none());

    Ok(())
}
