//! Integration tests: links, sampling and routing over a real TCP
//! connection on localhost.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tether_core::{
    BusMessage, ControlCommand, ControllerSampler, DisconnectReason, Endpoint, ErrorKind,
    FrameHandler, LinkEvent, LinkEvents, LinkOptions, LinkSession, LinkState, NeutralDevice,
    SamplerConfig, TopicRouter, Waypoint,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;

// ── Helpers ──────────────────────────────────────────────────────

/// Spin up a listener on an OS-assigned port and return its endpoint.
async fn ephemeral_listener() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, Endpoint::new(addr.ip().to_string(), addr.port()))
}

fn fast_options() -> LinkOptions {
    LinkOptions {
        read_timeout: Duration::from_millis(100),
        ..LinkOptions::default()
    }
}

/// Collect events until the session reports its end.
async fn drain(events: &mut LinkEvents) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no disconnect within 5s");
        match event {
            Some(e @ LinkEvent::Disconnected { .. }) => {
                seen.push(e);
                return seen;
            }
            Some(e) => seen.push(e),
            None => return seen,
        }
    }
}

// ── Downlink ─────────────────────────────────────────────────────

#[tokio::test]
async fn downlink_feeds_router() {
    let (listener, endpoint) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(&mut stream);

        // The console asks for a snapshot first.
        let mut first = String::new();
        reader.read_line(&mut first).await.unwrap();

        // Split a frame across writes and slip in bad lines.
        let lines = concat!(
            "{\"topic\":\"fc_data\",\"timestamp\":1.0,\"data\":{\"roll\":0.1}}\n",
            "{\"topic\":\"fc_data\",\"timestamp\":2.0,",
        );
        stream.write_all(lines.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
            .write_all(b"\"data\":{\"roll\":0.2}}\nnot json\n{\"topic\":7}\n{\"data\":{}}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        first
    });

    let router = Arc::new(TopicRouter::new());
    let handler: Arc<dyn FrameHandler> = router.clone();
    let (session, mut events) = LinkSession::with_handler(endpoint, fast_options(), handler);
    session.open().await.unwrap();
    session
        .send(&ControlCommand::RequestFullState.into_message())
        .await
        .unwrap();

    let seen = drain(&mut events).await;
    let first = server.await.unwrap();
    let request: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(request["topic"], "request_broadcast_all_params");

    // One parse error, then exactly one disconnect.
    assert!(matches!(seen[0], LinkEvent::ParseError(_)));
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::Disconnected {
            reason: DisconnectReason::RemoteClosed
        })
    );
    assert_eq!(seen.len(), 2);

    let history = router.history("fc_data");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].data["roll"], 0.1);
    assert_eq!(history[1].timestamp, 2.0);
    assert_eq!(router.count("unknown"), 1);
    assert_eq!(router.rejected(), 1);

    assert_eq!(session.state(), LinkState::Closed);
    assert_eq!(session.stats().parse_errors, 1);
    assert!(timeout(Duration::from_secs(1), events.recv()).await.unwrap().is_none());
}

// ── Uplink ───────────────────────────────────────────────────────

#[tokio::test]
async fn sampler_streams_to_server() {
    let (listener, endpoint) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let mut samples = Vec::new();
        while samples.len() < 5 {
            match lines.next_line().await.unwrap() {
                Some(line) => samples.push(serde_json::from_str::<Value>(&line).unwrap()),
                None => break,
            }
        }
        samples
    });

    let (session, _events) = LinkSession::connect(endpoint, fast_options()).await.unwrap();
    let config = SamplerConfig {
        rate_hz: 50.0,
        ..SamplerConfig::default()
    };
    let mut sampler = ControllerSampler::spawn(NeutralDevice::new(), session.clone(), config).unwrap();

    let samples = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    sampler.stop().await.ok();
    session.close().await;

    assert_eq!(samples.len(), 5);
    for sample in &samples {
        assert_eq!(sample["left_stick_x"], 0.0);
        assert_eq!(sample["left_trigger"], -1.0);
        assert_eq!(sample["dpad_y"], 0);
        assert_eq!(sample["a_button"], false);
        assert_eq!(sample["buttons"]["button_0"], false);
        assert!(sample["timestamp"].as_f64().unwrap() > 0.0);
    }
}

#[tokio::test]
async fn sampler_stops_when_peer_goes_away() {
    let (listener, endpoint) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let (session, mut events) = LinkSession::connect(endpoint, fast_options()).await.unwrap();
    server.await.unwrap();
    let seen = drain(&mut events).await;
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::Disconnected {
            reason: DisconnectReason::RemoteClosed
        })
    );

    let mut sampler =
        ControllerSampler::spawn(NeutralDevice::new(), session.clone(), SamplerConfig::default())
            .unwrap();
    let err = timeout(Duration::from_secs(5), sampler.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinkBroken);
    assert_eq!(sampler.samples_sent(), 0);
}

// ── Commands ─────────────────────────────────────────────────────

#[tokio::test]
async fn waypoint_command_round_trip() {
    let (listener, endpoint) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        lines.next_line().await.unwrap().unwrap()
    });

    let route = vec![Waypoint::new(59.3293, 18.0686), Waypoint::new(59.3300, 18.0700)];
    let (session, _events) = LinkSession::connect(endpoint, fast_options()).await.unwrap();
    session
        .send(&ControlCommand::NavSetWaypoints(route.clone()).into_message())
        .await
        .unwrap();

    let line = server.await.unwrap();
    let raw: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(raw["data"]["waypoints"], json!([[59.3293, 18.0686], [59.33, 18.07]]));

    let message = BusMessage::from_value(raw).unwrap();
    assert_eq!(
        ControlCommand::parse(&message).unwrap(),
        ControlCommand::NavSetWaypoints(route)
    );
    session.close().await;
}

// ── Teardown ─────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_close_emits_one_disconnect() {
    let (listener, endpoint) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Hold the connection open until the client leaves.
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let (session, mut events) = LinkSession::connect(endpoint, fast_options()).await.unwrap();
    let other = session.clone();
    tokio::join!(session.close(), other.close(), session.close());
    assert_eq!(session.state(), LinkState::Closed);

    let seen = drain(&mut events).await;
    assert_eq!(
        seen,
        vec![LinkEvent::Disconnected {
            reason: DisconnectReason::Local
        }]
    );
    assert!(events.recv().await.is_none());

    let err = session.send(&json!({"topic": "late"})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinkBroken);
    server.await.unwrap();
}
