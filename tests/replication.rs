//! Service-level replication scenarios: publish, notify, subscribe, push.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedsync::codec::{decode_feed, ATOM_NS, REPORT_NS};
use feedsync::signer::hub_signature;
use feedsync::{
    Config, EntryInput, FeedError, FeedRole, FeedService, FetchResponse, HubClient, HubMode,
    PushOutcome, Timestamp,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Records form posts; answers from a script, then 204.
struct ScriptedHub {
    statuses: Mutex<Vec<u16>>,
    calls: Mutex<Vec<BTreeMap<String, String>>>,
}

impl ScriptedHub {
    fn new(statuses: Vec<u16>) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn param(&self, call: usize, name: &str) -> Option<String> {
        self.calls.lock().get(call)?.get(name).cloned()
    }
}

#[async_trait]
impl HubClient for ScriptedHub {
    async fn post_form(&self, _url: &str, params: &[(&str, &str)]) -> feedsync::Result<u16> {
        self.calls.lock().push(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let mut statuses = self.statuses.lock();
        Ok(if statuses.is_empty() {
            204
        } else {
            statuses.remove(0)
        })
    }
}

fn config(dir: &TempDir, public_url: &str, feeds: &[(&str, FeedRole)]) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
        public_url: public_url.to_string(),
        hub_url: "http://hub.example.org".to_string(),
        feeds: feeds
            .iter()
            .map(|(name, role)| (name.to_string(), *role))
            .collect(),
        hub_timeout: Duration::from_secs(5),
        admin_token: None,
    }
}

fn report(feed: &str, subject: &str, beds: u32) -> EntryInput {
    EntryInput::new(
        feed,
        "{urn:relief}status",
        subject,
        "mailto:nurse@example.org",
        Timestamp::from_rfc3339("2010-01-12T21:53:00Z").unwrap(),
        format!(r#"<status xmlns="urn:relief"><beds>{beds}</beds></status>"#),
    )
    .with_title(format!("{subject} status"))
}

fn feed_body(response: FetchResponse) -> String {
    match response {
        FetchResponse::Feed { body, .. } => body,
        other => panic!("expected a feed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_queues_and_delivers_notification() {
    let dir = TempDir::new().unwrap();
    let hub = ScriptedHub::new(vec![]);
    let service = FeedService::open(
        &config(&dir, "http://a.example.org", &[("delta", FeedRole::Publisher)]),
        hub.clone(),
    )
    .unwrap();

    service.publish(report("delta", "facility/1", 3)).unwrap();
    service.publish(report("delta", "facility/2", 4)).unwrap();
    // Coalesced while undelivered.
    assert_eq!(service.notifier().pending(), 1);

    let delivery = service.notifier().deliver_pending().await;
    assert_eq!(delivery.delivered, 1);
    assert_eq!(service.notifier().pending(), 0);
    assert_eq!(hub.param(0, "hub.mode").as_deref(), Some("publish"));
    assert_eq!(
        hub.param(0, "hub.url").as_deref(),
        Some("http://a.example.org/feeds/delta")
    );
}

#[tokio::test]
async fn test_unreachable_hub_does_not_block_publish() {
    let dir = TempDir::new().unwrap();
    let hub = ScriptedHub::new(vec![503, 503]);
    let service = FeedService::open(
        &config(&dir, "http://a.example.org", &[("delta", FeedRole::Publisher)]),
        hub,
    )
    .unwrap();

    service.publish(report("delta", "facility/1", 3)).unwrap();
    let delivery = service.notifier().deliver_pending().await;
    assert_eq!(delivery.retrying, 1);

    // Writes and reads are unaffected.
    service.publish(report("delta", "facility/2", 4)).unwrap();
    let body = feed_body(service.fetch("delta", None).unwrap());
    assert_eq!(decode_feed(&body, None).unwrap().entries.len(), 2);
    assert_eq!(service.notifier().pending(), 1);
}

#[test]
fn test_pending_notification_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, "http://a.example.org", &[("delta", FeedRole::Publisher)]);

    {
        let service = FeedService::open(&cfg, ScriptedHub::new(vec![])).unwrap();
        service.publish(report("delta", "facility/1", 3)).unwrap();
    }

    let service = FeedService::open(&cfg, ScriptedHub::new(vec![])).unwrap();
    assert_eq!(service.notifier().pending(), 1);
    assert_eq!(service.store().feed_len("delta"), 1);
}

#[tokio::test]
async fn test_push_replication_between_instances() {
    let up_dir = TempDir::new().unwrap();
    let upstream = FeedService::open(
        &config(&up_dir, "http://a.example.org", &[("delta", FeedRole::Publisher)]),
        ScriptedHub::new(vec![]),
    )
    .unwrap();

    let down_dir = TempDir::new().unwrap();
    let down_hub = ScriptedHub::new(vec![]);
    let downstream = FeedService::open(
        &config(&down_dir, "http://b.example.org", &[("mirror", FeedRole::Subscriber)]),
        down_hub.clone(),
    )
    .unwrap();

    let topic = upstream.feed_uri("delta");
    downstream
        .subscribe("mirror", &topic, HubMode::Subscribe)
        .await
        .unwrap();
    assert_eq!(down_hub.param(0, "hub.verify").as_deref(), Some("sync"));
    let secret = down_hub.param(0, "hub.secret").unwrap();

    let original = upstream.publish(report("delta", "facility/1", 3)).unwrap();
    let body = feed_body(upstream.fetch("delta", None).unwrap());
    let signature = hub_signature(secret.as_bytes(), body.as_bytes()).unwrap();

    let outcome = downstream
        .receive_push("mirror", body.as_bytes(), Some(&signature))
        .unwrap();
    let PushOutcome::Accepted(report) = outcome else {
        panic!("push was not authenticated");
    };
    assert_eq!(report.stored, 1);

    let mirrored = downstream
        .store()
        .latest_arrived("mirror", Some(&topic), None, None)
        .unwrap();
    assert_eq!(mirrored.len(), 1);
    let copy = &mirrored[0];
    assert_eq!(copy.subject_id, original.subject_id);
    assert_eq!(copy.content, original.content);
    assert_eq!(copy.observed, original.observed);
    assert_eq!(copy.title, original.title);
    assert_eq!(copy.atom_id("http://b.example.org/feeds/mirror"), original.atom_id(&topic));

    // The mirror, served onward, still names where the entry came from.
    let onward = feed_body(downstream.fetch("mirror", None).unwrap());
    assert!(onward.contains(&format!("<source><id>{topic}</id></source>")));

    // Redelivery stores nothing new.
    let outcome = downstream
        .receive_push("mirror", body.as_bytes(), Some(&signature))
        .unwrap();
    assert_eq!(
        outcome,
        PushOutcome::Accepted(feedsync::IngestReport {
            stored: 0,
            duplicates: 1,
            skipped: 0,
        })
    );
    assert_eq!(downstream.store().feed_len("mirror"), 1);
}

#[tokio::test]
async fn test_own_entries_echoed_back_are_skipped() {
    let dir = TempDir::new().unwrap();
    let hub = ScriptedHub::new(vec![]);
    let service = FeedService::open(
        &config(
            &dir,
            "http://a.example.org",
            &[("delta", FeedRole::Publisher), ("mirror", FeedRole::Subscriber)],
        ),
        hub.clone(),
    )
    .unwrap();

    let topic = service.feed_uri("delta");
    service
        .subscribe("mirror", &topic, HubMode::Subscribe)
        .await
        .unwrap();
    let secret = hub.param(0, "hub.secret").unwrap();

    service.publish(report("delta", "facility/1", 3)).unwrap();
    let body = feed_body(service.fetch("delta", None).unwrap());
    let signature = hub_signature(secret.as_bytes(), body.as_bytes()).unwrap();

    let outcome = service
        .receive_push("mirror", body.as_bytes(), Some(&signature))
        .unwrap();
    assert_eq!(
        outcome,
        PushOutcome::Accepted(feedsync::IngestReport {
            stored: 0,
            duplicates: 0,
            skipped: 1,
        })
    );
    assert_eq!(service.store().feed_len("mirror"), 0);
}

#[tokio::test]
async fn test_authentic_malformed_push_rejected() {
    let dir = TempDir::new().unwrap();
    let hub = ScriptedHub::new(vec![]);
    let service = FeedService::open(
        &config(&dir, "http://b.example.org", &[("mirror", FeedRole::Subscriber)]),
        hub.clone(),
    )
    .unwrap();
    service
        .subscribe("mirror", "http://a.example.org/feeds/delta", HubMode::Subscribe)
        .await
        .unwrap();
    let secret = hub.param(0, "hub.secret").unwrap();

    let body = format!(
        r#"<feed xmlns="{ATOM_NS}" xmlns:r="{REPORT_NS}"><id>http://a.example.org/feeds/delta</id>
           <entry><id>http://a.example.org/feeds/delta/1</id>
           <author><uri>mailto:a@example.org</uri></author>
           <r:observed>2010-01-01T00:00:00Z</r:observed>
           <r:content type="{{urn:v}}v"><v xmlns="urn:v"/></r:content></entry></feed>"#
    );
    let signature = hub_signature(secret.as_bytes(), body.as_bytes()).unwrap();

    let err = service
        .receive_push("mirror", body.as_bytes(), Some(&signature))
        .unwrap_err();
    assert!(matches!(err, FeedError::MissingElement(ref m) if m == "entry contains no subject"));
    assert!(err.is_client_error());
    assert_eq!(service.store().feed_len("mirror"), 0);
}

#[tokio::test]
async fn test_rejected_subscription_not_recorded() {
    let dir = TempDir::new().unwrap();
    let service = FeedService::open(
        &config(&dir, "http://b.example.org", &[("mirror", FeedRole::Subscriber)]),
        ScriptedHub::new(vec![409]),
    )
    .unwrap();

    let err = service
        .subscribe("mirror", "http://a.example.org/feeds/delta", HubMode::Subscribe)
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::HubRejected(409)));
    assert!(service.subscriptions("mirror").unwrap().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_accepting_pushes() {
    let dir = TempDir::new().unwrap();
    let hub = ScriptedHub::new(vec![]);
    let cfg = config(&dir, "http://b.example.org", &[("mirror", FeedRole::Subscriber)]);
    let topic = "http://a.example.org/feeds/delta";

    let secret = {
        let service = FeedService::open(&cfg, hub.clone()).unwrap();
        service
            .subscribe("mirror", topic, HubMode::Subscribe)
            .await
            .unwrap();
        hub.param(0, "hub.secret").unwrap()
    };

    // Subscriptions and topic secrets persist.
    let service = FeedService::open(&cfg, hub.clone()).unwrap();
    assert_eq!(service.subscriptions("mirror").unwrap().len(), 1);

    let body = format!(r#"<feed xmlns="{ATOM_NS}"><id>{topic}</id></feed>"#);
    let signature = hub_signature(secret.as_bytes(), body.as_bytes()).unwrap();
    assert!(matches!(
        service.receive_push("mirror", body.as_bytes(), Some(&signature)),
        Ok(PushOutcome::Accepted(_))
    ));

    service
        .subscribe("mirror", topic, HubMode::Unsubscribe)
        .await
        .unwrap();
    assert_eq!(hub.param(1, "hub.mode").as_deref(), Some("unsubscribe"));
    assert!(hub.param(1, "hub.secret").is_none());
    assert!(service.subscriptions("mirror").unwrap().is_empty());
    assert_eq!(
        service
            .receive_push("mirror", body.as_bytes(), Some(&signature))
            .unwrap(),
        PushOutcome::Unauthenticated
    );
}

#[test]
fn test_unknown_feed_rejected() {
    let dir = TempDir::new().unwrap();
    let service = FeedService::open(
        &config(&dir, "http://a.example.org", &[("delta", FeedRole::Publisher)]),
        ScriptedHub::new(vec![]),
    )
    .unwrap();

    assert!(matches!(
        service.publish(report("other", "facility/1", 1)),
        Err(FeedError::FeedNotFound(_))
    ));
    assert!(matches!(service.fetch("other", None), Err(FeedError::FeedNotFound(_))));
    assert_eq!(service.store().count(), 0);
}

#[test]
fn test_publish_rejects_content_that_could_break_the_feed() {
    let dir = TempDir::new().unwrap();
    let service = FeedService::open(
        &config(&dir, "http://a.example.org", &[("delta", FeedRole::Publisher)]),
        ScriptedHub::new(vec![]),
    )
    .unwrap();
    service.publish(report("delta", "facility/1", 3)).unwrap();

    for content in [
        "AT&T < 5",
        r#"<status xmlns="urn:relief"/></report:content></entry><entry><id>http://evil.example.org/1</id>"#,
        "<status><beds>3</beds></status>",
    ] {
        let mut input = report("delta", "facility/2", 4);
        input.content = content.to_string();
        assert!(
            matches!(service.publish(input), Err(FeedError::InvalidEntry(_))),
            "{content:?} should be rejected"
        );
    }

    // The feed still decodes and holds only the valid entry.
    let body = feed_body(service.fetch("delta", None).unwrap());
    let decoded = decode_feed(&body, None).unwrap();
    assert_eq!(decoded.entries.len(), 1);
    assert_eq!(decoded.entries[0].subject_id, "facility/1");
}

#[tokio::test]
async fn test_feed_level_prefix_survives_two_hops() {
    let upstream = "http://a.example.org/feeds/delta";

    // Instance B mirrors A, whose feed declares the payload prefix on <feed>.
    let b_dir = TempDir::new().unwrap();
    let b_hub = ScriptedHub::new(vec![]);
    let b = FeedService::open(
        &config(&b_dir, "http://b.example.org", &[("mirror", FeedRole::Subscriber)]),
        b_hub.clone(),
    )
    .unwrap();
    b.subscribe("mirror", upstream, HubMode::Subscribe).await.unwrap();
    let b_secret = b_hub.param(0, "hub.secret").unwrap();

    let body = format!(
        r#"<feed xmlns="{ATOM_NS}" xmlns:r="{REPORT_NS}" xmlns:h="urn:relief"><id>{upstream}</id>
           <entry><id>{upstream}/1</id><author><uri>mailto:a@example.org</uri></author>
           <r:subject>facility/1</r:subject><r:observed>2010-01-01T00:00:00Z</r:observed>
           <r:content type="{{urn:relief}}status"><h:status><h:beds>7</h:beds></h:status></r:content>
           </entry></feed>"#
    );
    let signature = hub_signature(b_secret.as_bytes(), body.as_bytes()).unwrap();
    b.receive_push("mirror", body.as_bytes(), Some(&signature))
        .unwrap();

    let stored = b.store().latest_arrived("mirror", None, None, None).unwrap();
    let expected = r#"<h:status xmlns:h="urn:relief"><h:beds>7</h:beds></h:status>"#;
    assert_eq!(stored[0].content, expected);

    // Instance C mirrors B.
    let c_dir = TempDir::new().unwrap();
    let c_hub = ScriptedHub::new(vec![]);
    let c = FeedService::open(
        &config(&c_dir, "http://c.example.org", &[("mirror", FeedRole::Subscriber)]),
        c_hub.clone(),
    )
    .unwrap();
    let b_topic = b.feed_uri("mirror");
    c.subscribe("mirror", &b_topic, HubMode::Subscribe).await.unwrap();
    let c_secret = c_hub.param(0, "hub.secret").unwrap();

    let onward = feed_body(b.fetch("mirror", None).unwrap());
    let signature = hub_signature(c_secret.as_bytes(), onward.as_bytes()).unwrap();
    let outcome = c
        .receive_push("mirror", onward.as_bytes(), Some(&signature))
        .unwrap();
    assert!(matches!(outcome, PushOutcome::Accepted(ref r) if r.stored == 1));

    let relayed = c.store().latest_arrived("mirror", None, None, None).unwrap();
    assert_eq!(relayed[0].type_name, "{urn:relief}status");
    assert_eq!(relayed[0].content, expected);
}
