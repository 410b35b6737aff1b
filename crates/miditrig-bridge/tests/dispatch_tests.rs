//! Dispatch Tests
//!
//! Rule evaluation across the three inbound paths:
//! - MIDI note events fanning out to MQTT publishes and HTTP requests
//! - MQTT messages on trigger topics, `<base>/send` and `<base>/status/check`
//! - HTTP requests on trigger URIs

use miditrig_bridge::{MidiRouter, ResourceState, RouterContext};
use miditrig_core::{
    MqttConfig, NoteEvent, NoteMessage, NoteTrigger, RequestTrigger, RouterConfig,
};
use miditrig_test_utils::{
    wait_for, MockConnector, MockPortProvider, RequestRecorder, DEFAULT_CHECK_INTERVAL,
    DEFAULT_TIMEOUT,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEVICE: &str = "nanoPAD2 MIDI 1";
const BASE: &str = "studio/pads";

fn mqtt() -> MqttConfig {
    MqttConfig {
        host: "localhost".into(),
        port: 1883,
        client_id: "pads".into(),
        topic: BASE.into(),
        ..Default::default()
    }
}

fn router_config() -> RouterConfig {
    RouterConfig {
        name: "Pads".into(),
        device: "^nanoPAD2".into(),
        ..Default::default()
    }
}

struct Harness {
    router: MidiRouter,
    provider: Arc<MockPortProvider>,
    connector: Arc<MockConnector>,
}

impl Harness {
    async fn start(config: RouterConfig) -> Self {
        let provider = Arc::new(MockPortProvider::new(&[DEVICE]));
        let connector = Arc::new(MockConnector::new());
        let context = RouterContext::new(provider.clone(), connector.clone())
            .with_retry_interval(Duration::from_millis(20));

        let router = MidiRouter::new(config, context).expect("router should build");
        router.connect().expect("connect should start");

        let harness = Self {
            router,
            provider,
            connector,
        };
        harness.wait_until_bound().await;
        harness
    }

    /// Wait for every sub-resource the configuration asks for
    async fn wait_until_bound(&self) {
        let config = self.router.config().clone();
        let ready = wait_for(
            || {
                let state = self.router.state();
                (!config.needs_output() || state.output == ResourceState::Bound)
                    && (!config.needs_listener() || state.listener == ResourceState::Bound)
                    && (!config.mqtt.is_enabled() || state.mqtt == ResourceState::Bound)
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await;
        assert!(ready, "router should bind: {:?}", self.router.state());
    }

    async fn wait_for_published(&self, topic: &str, n: usize) -> bool {
        let publisher = self.connector.publisher();
        wait_for(
            || publisher.published_on(topic).len() >= n,
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    }

    async fn wait_for_sent(&self, n: usize) -> bool {
        wait_for(
            || self.provider.sent_count() >= n,
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    }
}

fn note_json(channel: u8, note: u8, velocity: u8) -> Vec<u8> {
    serde_json::to_vec(&json!({"channel": channel, "note": note, "velocity": velocity})).unwrap()
}

// ============================================================================
// MIDI event path
// ============================================================================

#[tokio::test]
async fn test_note_trigger_fires_single_get() {
    let recorder = RequestRecorder::start().await;

    let mut config = router_config();
    config.note_triggers.push(NoteTrigger {
        channel: 0,
        note: 60,
        match_all_velocities: true,
        url: Some(recorder.url("/y")),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    assert!(harness.provider.inject(NoteEvent::start(0, 60, 90)));
    assert!(
        recorder.wait_for_count(1, DEFAULT_TIMEOUT).await,
        "matching note should fire a request"
    );

    assert!(harness.provider.inject(NoteEvent::start(0, 61, 90)));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let requests = recorder.requests();
    assert_eq!(requests.len(), 1, "non-matching note must not fire");
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/y");
    assert_eq!(requests[0].query, None);

    harness.router.disconnect().await;
}

#[tokio::test]
async fn test_http_action_carries_method_body_headers_and_midi_info() {
    let recorder = RequestRecorder::start().await;

    let mut config = router_config();
    config.note_triggers.push(NoteTrigger {
        channel: 2,
        match_all_notes: true,
        match_all_velocities: true,
        url: Some(recorder.url("/scene?id=4")),
        method: "post".into(),
        body: Some(r#"{"go":true}"#.into()),
        headers: [("X-Api-Key".to_string(), "secret".to_string())].into(),
        midi_info_in_request: true,
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    harness.router.on_note_event(NoteEvent::start(2, 64, 100)).await;
    assert!(recorder.wait_for_count(1, DEFAULT_TIMEOUT).await);

    let request = &recorder.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/scene");
    assert_eq!(
        request.query.as_deref(),
        Some("id=4&channel=2&note=64&velocity=100")
    );
    assert_eq!(request.body, r#"{"go":true}"#);
    assert!(request
        .headers
        .contains(&("x-api-key".to_string(), "secret".to_string())));
}

#[tokio::test]
async fn test_failed_request_does_not_abort_sibling_triggers() {
    let recorder = RequestRecorder::start().await;

    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.note_triggers = vec![
        NoteTrigger {
            match_all_channels: true,
            match_all_notes: true,
            match_all_velocities: true,
            url: Some("::not a url".into()),
            ..Default::default()
        },
        NoteTrigger {
            match_all_channels: true,
            match_all_notes: true,
            match_all_velocities: true,
            // Nothing listens on port 9 locally
            url: Some("http://127.0.0.1:9/down".into()),
            ..Default::default()
        },
        NoteTrigger {
            match_all_channels: true,
            match_all_notes: true,
            match_all_velocities: true,
            url: Some(recorder.url("/ok")),
            mqtt_topic: Some("after".into()),
            ..Default::default()
        },
    ];
    let harness = Harness::start(config).await;

    harness.router.on_note_event(NoteEvent::start(0, 1, 1)).await;

    assert!(recorder.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert!(harness.wait_for_published("after", 1).await);
}

#[tokio::test]
async fn test_firehose_once_per_event() {
    let mut config = router_config();
    config.mqtt = mqtt();
    for topic in ["lights/a", "lights/b"] {
        config.note_triggers.push(NoteTrigger {
            match_all_channels: true,
            match_all_notes: true,
            match_all_velocities: true,
            mqtt_topic: Some(topic.into()),
            ..Default::default()
        });
    }
    let harness = Harness::start(config).await;

    assert!(harness.provider.inject(NoteEvent::start(1, 36, 127)));
    assert!(harness.wait_for_published("lights/b", 1).await);

    let publisher = harness.connector.publisher();
    let cmd = publisher.published_on(&format!("{}/cmd", BASE));
    assert_eq!(cmd, vec![note_json(1, 36, 127)], "one firehose publish per event");
    assert_eq!(publisher.published_on("lights/a"), vec![note_json(1, 36, 127)]);
    assert_eq!(publisher.published_on("lights/b"), vec![note_json(1, 36, 127)]);
}

#[tokio::test]
async fn test_firehose_disabled() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.note_triggers.push(NoteTrigger {
        match_all_channels: true,
        match_all_notes: true,
        match_all_velocities: true,
        mqtt_topic: Some("lights".into()),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    harness.router.on_note_event(NoteEvent::start(0, 60, 10)).await;
    assert!(harness.wait_for_published("lights", 1).await);
    assert!(harness
        .connector
        .publisher()
        .published_on(&format!("{}/cmd", BASE))
        .is_empty());
}

#[tokio::test]
async fn test_literal_payload_replaces_note_record() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.note_triggers.push(NoteTrigger {
        note: 40,
        match_all_velocities: true,
        mqtt_topic: Some("scene/set".into()),
        mqtt_payload: Some(json!({"scene": 3, "fade": 1.5})),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    harness.router.on_note_event(NoteEvent::start(0, 40, 99)).await;

    let published = harness.connector.publisher().published_on("scene/set");
    assert_eq!(published.len(), 1);
    let value: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(value, json!({"scene": 3, "fade": 1.5}));
}

#[tokio::test]
async fn test_match_all_covers_note_start_and_end_on_channel() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.note_triggers.push(NoteTrigger {
        channel: 5,
        match_all_notes: true,
        match_all_velocities: true,
        mqtt_topic: Some("ch5".into()),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    harness.router.on_note_event(NoteEvent::start(5, 0, 1)).await;
    harness.router.on_note_event(NoteEvent::start(5, 127, 127)).await;
    harness.router.on_note_event(NoteEvent::end(5, 64)).await;
    harness.router.on_note_event(NoteEvent::start(4, 64, 64)).await;

    assert_eq!(
        harness.connector.publisher().published_on("ch5"),
        vec![note_json(5, 0, 1), note_json(5, 127, 127), note_json(5, 64, 0)]
    );
}

#[tokio::test]
async fn test_inert_trigger_has_no_effect() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.mqtt.disable_config_send = true;
    config.note_triggers.push(NoteTrigger {
        match_all_channels: true,
        match_all_notes: true,
        match_all_velocities: true,
        delay_before_ms: 5,
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    for note in 0..10 {
        harness.router.on_note_event(NoteEvent::start(0, note, 100)).await;
    }

    assert!(harness.connector.publisher().published().is_empty());
    assert_eq!(harness.provider.sent_count(), 0);
}

#[tokio::test]
async fn test_delays_serialize_one_event_only() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.note_triggers.push(NoteTrigger {
        note: 1,
        match_all_velocities: true,
        delay_before_ms: 300,
        mqtt_topic: Some("slow".into()),
        ..Default::default()
    });
    config.note_triggers.push(NoteTrigger {
        note: 2,
        match_all_velocities: true,
        mqtt_topic: Some("fast".into()),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    assert!(harness.provider.inject(NoteEvent::start(0, 1, 1)));
    assert!(harness.provider.inject(NoteEvent::start(0, 2, 1)));

    // The second event is not held up behind the first event's delay
    assert!(harness.wait_for_published("fast", 1).await);
    assert!(harness.connector.publisher().published_on("slow").is_empty());
    assert!(harness.wait_for_published("slow", 1).await);
}

#[tokio::test]
async fn test_triggers_run_in_order_after_each_delay_after() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_midi_firehose = true;
    config.note_triggers.push(NoteTrigger {
        note: 5,
        match_all_velocities: true,
        delay_before_ms: 100,
        delay_after_ms: 300,
        mqtt_topic: Some("first".into()),
        ..Default::default()
    });
    config.note_triggers.push(NoteTrigger {
        note: 5,
        match_all_velocities: true,
        mqtt_topic: Some("second".into()),
        ..Default::default()
    });
    let harness = Harness::start(config).await;
    let publisher = harness.connector.publisher();

    let start = Instant::now();
    let watch = async {
        assert!(harness.wait_for_published("first", 1).await);
        // Still inside the first trigger's delay_after
        publisher.published_on("second").is_empty()
    };
    let ((), second_held_back) = tokio::join!(
        harness.router.on_note_event(NoteEvent::start(0, 5, 64)),
        watch
    );

    assert!(second_held_back, "second trigger must wait out the first one's delay_after");
    assert!(start.elapsed() >= Duration::from_millis(400));

    let topics: Vec<String> = publisher
        .published()
        .into_iter()
        .map(|(topic, _)| topic)
        .filter(|topic| topic == "first" || topic == "second")
        .collect();
    assert_eq!(topics, vec!["first", "second"]);
}

#[tokio::test]
async fn test_self_signed_target_needs_insecure_skip_verify() {
    let recorder = RequestRecorder::start_tls().await;

    let mut config = router_config();
    config.note_triggers.push(NoteTrigger {
        note: 70,
        match_all_velocities: true,
        url: Some(recorder.url("/verified")),
        ..Default::default()
    });
    config.note_triggers.push(NoteTrigger {
        note: 71,
        match_all_velocities: true,
        url: Some(recorder.url("/unverified")),
        insecure_skip_verify: true,
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    harness.router.on_note_event(NoteEvent::start(0, 70, 100)).await;
    assert_eq!(recorder.count(), 0, "verifying client must reject the certificate");

    harness.router.on_note_event(NoteEvent::start(0, 71, 100)).await;
    assert!(recorder.wait_for_count(1, DEFAULT_TIMEOUT).await);

    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/unverified");
}

// ============================================================================
// MQTT message path
// ============================================================================

#[tokio::test]
async fn test_subscriptions() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.request_triggers = vec![
        RequestTrigger {
            mqtt_topic: Some("house/doorbell".into()),
            ..Default::default()
        },
        RequestTrigger {
            mqtt_sub_topic: Some("fire".into()),
            ..Default::default()
        },
    ];
    let harness = Harness::start(config).await;

    assert_eq!(
        harness.connector.subscriptions(),
        vec![
            format!("{}/send", BASE),
            format!("{}/status/check", BASE),
            "house/doorbell".to_string(),
            format!("{}/fire", BASE),
        ]
    );
}

#[tokio::test]
async fn test_sub_topic_payload_overrides_defaults() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.request_triggers.push(RequestTrigger {
        channel: 9,
        note: 1,
        velocity: 1,
        mqtt_sub_topic: Some("fire".into()),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    assert!(harness
        .connector
        .push(&format!("{}/fire", BASE), &note_json(2, 64, 100)));
    assert!(harness.wait_for_sent(1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        harness.provider.sent(),
        vec![NoteMessage::On {
            channel: 2,
            note: 64,
            velocity: 100
        }]
    );
}

#[tokio::test]
async fn test_empty_or_disallowed_payload_uses_defaults() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.request_triggers = vec![
        RequestTrigger {
            channel: 1,
            note: 10,
            velocity: 20,
            mqtt_topic: Some("plain".into()),
            ..Default::default()
        },
        RequestTrigger {
            channel: 1,
            note: 11,
            velocity: 21,
            mqtt_topic: Some("locked".into()),
            disallow_payload: true,
            ..Default::default()
        },
    ];
    let harness = Harness::start(config).await;

    assert!(harness.connector.push("plain", b""));
    assert!(harness.wait_for_sent(1).await);
    assert!(harness.connector.push("locked", &note_json(2, 64, 100)));
    assert!(harness.wait_for_sent(2).await);

    assert_eq!(
        harness.provider.sent(),
        vec![
            NoteMessage::On {
                channel: 1,
                note: 10,
                velocity: 20
            },
            NoteMessage::On {
                channel: 1,
                note: 11,
                velocity: 21
            },
        ]
    );
}

#[tokio::test]
async fn test_undecodable_payload_skips_only_that_trigger() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.request_triggers = vec![
        RequestTrigger {
            note: 1,
            velocity: 1,
            mqtt_topic: Some("shared".into()),
            ..Default::default()
        },
        RequestTrigger {
            note: 2,
            velocity: 2,
            mqtt_topic: Some("shared".into()),
            disallow_payload: true,
            ..Default::default()
        },
    ];
    let harness = Harness::start(config).await;

    // Partial records are rejected, not merged with defaults
    assert!(harness.connector.push("shared", br#"{"note":70}"#));
    assert!(harness.wait_for_sent(1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        harness.provider.sent(),
        vec![NoteMessage::On {
            channel: 0,
            note: 2,
            velocity: 2
        }]
    );
}

#[tokio::test]
async fn test_send_topic_delivers_directly() {
    let mut config = router_config();
    config.mqtt = mqtt();
    // An output port is only opened for routers with request triggers
    config.request_triggers.push(RequestTrigger {
        uri: Some("/unused".into()),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    let send = format!("{}/send", BASE);
    assert!(harness.connector.push(&send, &note_json(3, 50, 60)));
    assert!(harness.connector.push(&send, b""));
    assert!(harness.connector.push(&send, b"garbage"));
    assert!(harness.connector.push(&send, &note_json(3, 50, 0)));
    assert!(harness.wait_for_sent(2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        harness.provider.sent(),
        vec![
            NoteMessage::On {
                channel: 3,
                note: 50,
                velocity: 60
            },
            NoteMessage::Off {
                channel: 3,
                note: 50
            },
        ]
    );
}

#[tokio::test]
async fn test_send_topic_overlapping_trigger_delivers_twice() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.request_triggers.push(RequestTrigger {
        mqtt_topic: Some(format!("{}/send", BASE)),
        ..Default::default()
    });
    let harness = Harness::start(config).await;

    assert!(harness
        .connector
        .push(&format!("{}/send", BASE), &note_json(0, 60, 1)));
    assert!(harness.wait_for_sent(2).await);
    assert_eq!(harness.provider.sent_count(), 2);
}

#[tokio::test]
async fn test_status_published_on_connect_and_check() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.user = Some("bob".into());
    config.mqtt.password = Some("hunter2".into());
    let harness = Harness::start(config).await;

    let status = format!("{}/status", BASE);
    assert!(harness.wait_for_published(&status, 1).await);

    assert!(harness
        .connector
        .push(&format!("{}/status/check", BASE), b""));
    assert!(harness.wait_for_published(&status, 2).await);

    let published = harness.connector.publisher().published_on(&status);
    let value: serde_json::Value = serde_json::from_slice(&published[1]).unwrap();
    assert_eq!(value["name"], "Pads");
    assert_eq!(value["mqtt"]["user"], "bob");
    assert!(value["mqtt"].get("password").is_none(), "password must not leak");
}

#[tokio::test]
async fn test_status_disabled() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.mqtt.disable_config_send = true;
    let harness = Harness::start(config).await;

    assert!(harness
        .connector
        .push(&format!("{}/status/check", BASE), b""));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness
        .connector
        .publisher()
        .published_on(&format!("{}/status", BASE))
        .is_empty());
}

// ============================================================================
// HTTP request path
// ============================================================================

fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_http_request_sends_defaults_or_overrides() {
    let mut config = router_config();
    config.request_triggers = vec![
        RequestTrigger {
            channel: 1,
            note: 60,
            velocity: 100,
            uri: Some("/fixed".into()),
            ..Default::default()
        },
        RequestTrigger {
            channel: 1,
            note: 60,
            velocity: 100,
            midi_info_in_request: true,
            uri: Some("/open".into()),
            ..Default::default()
        },
    ];
    let harness = Harness::start(config).await;

    let status = harness
        .router
        .on_http_request("/fixed", &query(&[("note", "70")]))
        .await;
    assert_eq!(status.as_u16(), 204);

    let status = harness
        .router
        .on_http_request("/open", &query(&[("note", "abc"), ("velocity", "200")]))
        .await;
    assert_eq!(status.as_u16(), 204);

    let status = harness
        .router
        .on_http_request("/open", &query(&[("channel", "2"), ("note", "254")]))
        .await;
    assert_eq!(status.as_u16(), 204);

    assert_eq!(
        harness.provider.sent(),
        vec![
            NoteMessage::On {
                channel: 1,
                note: 60,
                velocity: 100
            },
            NoteMessage::On {
                channel: 1,
                note: 60,
                velocity: 100
            },
            NoteMessage::from_parts(2, 254, 100),
        ]
    );
}

#[tokio::test]
async fn test_velocity_zero_sends_note_off_on_every_path() {
    let mut config = router_config();
    config.mqtt = mqtt();
    config.request_triggers = vec![
        RequestTrigger {
            channel: 4,
            note: 30,
            velocity: 0,
            uri: Some("/off".into()),
            ..Default::default()
        },
        RequestTrigger {
            channel: 4,
            note: 31,
            velocity: 90,
            mqtt_sub_topic: Some("off".into()),
            ..Default::default()
        },
    ];
    let harness = Harness::start(config).await;

    let status = harness.router.on_http_request("/off", &HashMap::new()).await;
    assert_eq!(status.as_u16(), 204);

    assert!(harness
        .connector
        .push(&format!("{}/off", BASE), &note_json(4, 31, 0)));
    assert!(harness.wait_for_sent(2).await);

    assert!(harness
        .connector
        .push(&format!("{}/send", BASE), &note_json(4, 32, 0)));
    assert!(harness.wait_for_sent(3).await);

    let sent = harness.provider.sent();
    assert!(sent.iter().all(|m| !m.is_on()), "got {:?}", sent);
    assert_eq!(sent[0].to_bytes(), [0x84, 30, 0]);
}

#[tokio::test]
async fn test_http_request_without_output_is_server_error() {
    let provider = Arc::new(MockPortProvider::new(&["Some Other Device"]));
    let connector = Arc::new(MockConnector::new());
    let context = RouterContext::new(provider.clone(), connector.clone())
        .with_retry_interval(Duration::from_secs(60));

    let mut config = router_config();
    config.request_triggers.push(RequestTrigger {
        uri: Some("/go".into()),
        ..Default::default()
    });
    let router = MidiRouter::new(config, context).unwrap();
    router.connect().unwrap();

    assert!(wait_for_attempt(&provider).await);
    assert_eq!(router.on_http_request("/go", &HashMap::new()).await.as_u16(), 500);
    assert_eq!(router.on_http_request("/nope", &HashMap::new()).await.as_u16(), 404);

    router.disconnect().await;
}

async fn wait_for_attempt(provider: &MockPortProvider) -> bool {
    wait_for(
        || provider.output_attempts().load(Ordering::SeqCst) >= 1,
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await
}
