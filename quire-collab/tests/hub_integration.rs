//! Hub behaviour against in-memory connections.
//!
//! Each connection is a `ConnectionHandle` whose receiving end the test
//! keeps. Broadcasts queue synchronously, so every assertion can drain the
//! receivers with `try_recv` right after the call returns.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use quire_collab::{
    AllowAll, CollaborationHub, CommentAdded, ConnectionHandle, ConnectionRegistry, Envelope,
    FrameOutcome, MessageType, Outbound, PageMutation, Recipients, Session,
    StaticIdentityProvider, UserIdentity,
};

struct Peer {
    session: Session,
    rx: UnboundedReceiver<Outbound>,
}

impl Peer {
    fn received(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Outbound::Frame(text) = item {
                out.push(Envelope::decode(&text).unwrap());
            }
        }
        out
    }
}

fn test_hub() -> CollaborationHub {
    let mut identities = StaticIdentityProvider::new();
    for name in ["alice", "bob", "carol", "dave", "erin"] {
        identities.insert(format!("t-{name}"), UserIdentity::new(format!("u-{name}"), name));
    }
    CollaborationHub::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(identities),
        Arc::new(AllowAll),
    )
}

/// Connect a peer and drain its `page_users` snapshot.
async fn join(hub: &CollaborationHub, name: &str, page: &str) -> Peer {
    let (handle, rx) = ConnectionHandle::channel();
    let session = hub.connect(handle, page, &format!("t-{name}")).await.unwrap();
    let mut peer = Peer { session, rx };
    let _ = peer.received();
    peer
}

#[tokio::test]
async fn test_page_update_reaches_others_not_sender() {
    let hub = test_hub();
    let mut a = join(&hub, "alice", "p1").await;
    let mut b = join(&hub, "bob", "p1").await;
    let _ = a.received(); // user_joined for bob

    let outcome = hub
        .handle_frame(&a.session, r#"{"type":"page_update","data":{"content":"hello"}}"#)
        .await;
    assert!(matches!(outcome, FrameOutcome::Relayed(ref r) if r.delivered == 1));

    let got = b.received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].msg_type, MessageType::PageUpdate);
    assert_eq!(got[0].data_str("content"), Some("hello"));
    assert_eq!(got[0].user_id.as_deref(), Some("u-alice"));
    assert_eq!(got[0].data_str("username"), Some("alice"));
    assert!(got[0].data_str("timestamp").is_some());

    assert!(a.received().is_empty(), "sender must not get its own update");
}

#[tokio::test]
async fn test_page_update_fans_out_to_every_other_member() {
    let hub = test_hub();
    let a = join(&hub, "alice", "p1").await;
    let mut others = vec![
        join(&hub, "bob", "p1").await,
        join(&hub, "carol", "p1").await,
        join(&hub, "dave", "p1").await,
    ];
    let mut elsewhere = join(&hub, "erin", "p2").await;
    for peer in others.iter_mut() {
        let _ = peer.received();
    }

    hub.handle_frame(&a.session, r#"{"type":"page_update","data":{"content":"v2"}}"#)
        .await;

    for peer in others.iter_mut() {
        let got = peer.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data_str("content"), Some("v2"));
    }
    assert!(elsewhere.received().is_empty(), "other pages are isolated");
}

#[tokio::test]
async fn test_first_joiner_snapshot_contains_itself() {
    let hub = test_hub();
    let (handle, mut rx) = ConnectionHandle::channel();
    let _session = hub.connect(handle, "p1", "t-alice").await.unwrap();

    let Ok(Outbound::Frame(text)) = rx.try_recv() else {
        panic!("Expected page_users frame");
    };
    let snapshot = Envelope::decode(&text).unwrap();
    assert_eq!(snapshot.msg_type, MessageType::PageUsers);
    let users = snapshot.data["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["user_id"], "u-alice");
    assert_eq!(users[0]["username"], "alice");
    assert!(rx.try_recv().is_err(), "snapshot is the only frame");
}

#[tokio::test]
async fn test_join_announced_to_others_with_snapshot_for_joiner() {
    let hub = test_hub();
    let mut a = join(&hub, "alice", "p1").await;

    let (handle, mut rx) = ConnectionHandle::channel();
    let _bob = hub.connect(handle, "p1", "t-bob").await.unwrap();

    let got = a.received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].msg_type, MessageType::UserJoined);
    assert_eq!(got[0].data_str("user_id"), Some("u-bob"));
    assert_eq!(got[0].data_str("message"), Some("bob joined the page"));

    let Ok(Outbound::Frame(text)) = rx.try_recv() else {
        panic!("Expected page_users frame");
    };
    let snapshot = Envelope::decode(&text).unwrap();
    assert_eq!(snapshot.msg_type, MessageType::PageUsers);
    let names: HashSet<&str> = snapshot.data["users"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["username"].as_str())
        .collect();
    assert_eq!(names, HashSet::from(["alice", "bob"]));
    assert!(rx.try_recv().is_err(), "joiner gets no user_joined about itself");
}

#[tokio::test]
async fn test_bogus_type_changes_nothing() {
    let hub = test_hub();
    let a = join(&hub, "alice", "p1").await;
    let mut b = join(&hub, "bob", "p1").await;
    let before = hub.registry().members_of("p1").await.len();

    for frame in [
        r#"{"type":"bogus_type","data":{}}"#,
        r#"{"type":"user_joined","data":{"username":"mallory"}}"#,
        r#"{"type":"page_update"}"#,
        "{{{{",
        "",
    ] {
        let outcome = hub.handle_frame(&a.session, frame).await;
        assert!(matches!(outcome, FrameOutcome::Dropped(_)), "{frame} should be dropped");
    }

    assert!(b.received().is_empty());
    assert!(a.session.is_active());
    assert_eq!(hub.registry().members_of("p1").await.len(), before);

    // The connection keeps working afterwards
    hub.handle_frame(&a.session, r#"{"type":"typing_start"}"#).await;
    assert_eq!(b.received().len(), 1);
}

#[tokio::test]
async fn test_cursor_and_typing_exclude_sender() {
    let hub = test_hub();
    let mut a = join(&hub, "alice", "p1").await;
    let mut b = join(&hub, "bob", "p1").await;
    let _ = a.received();

    hub.handle_frame(
        &a.session,
        r#"{"type":"cursor_position","data":{"position":{"index":12,"length":0}}}"#,
    )
    .await;
    hub.handle_frame(&a.session, r#"{"type":"typing_start","data":{}}"#).await;
    hub.handle_frame(&a.session, r#"{"type":"typing_stop","data":{}}"#).await;

    let got = b.received();
    let types: Vec<MessageType> = got.iter().map(|e| e.msg_type).collect();
    assert_eq!(
        types,
        vec![
            MessageType::CursorPosition,
            MessageType::TypingStart,
            MessageType::TypingStop
        ]
    );
    assert_eq!(got[0].data["position"]["index"], 12);
    assert_eq!(got[0].data_str("username"), Some("alice"));
    assert_eq!(got[1].data_str("user_id"), Some("u-alice"));

    assert!(a.received().is_empty());
}

#[tokio::test]
async fn test_frames_from_one_sender_keep_order() {
    let hub = test_hub();
    let a = join(&hub, "alice", "p1").await;
    let mut b = join(&hub, "bob", "p1").await;

    for i in 0..50 {
        let frame = format!(r#"{{"type":"page_update","data":{{"content":"rev-{i}"}}}}"#);
        hub.handle_frame(&a.session, &frame).await;
    }

    let contents: Vec<String> = b
        .received()
        .iter()
        .filter_map(|e| e.data_str("content").map(str::to_string))
        .collect();
    let expected: Vec<String> = (0..50).map(|i| format!("rev-{i}")).collect();
    assert_eq!(contents, expected);
}

#[tokio::test]
async fn test_failing_member_removed_others_still_served() {
    let hub = test_hub();
    let sender = join(&hub, "alice", "p1").await;
    let mut healthy = vec![join(&hub, "bob", "p1").await, join(&hub, "carol", "p1").await];
    let dead = join(&hub, "dave", "p1").await;
    for peer in healthy.iter_mut() {
        let _ = peer.received();
    }

    let dead_id = dead.session.id();
    drop(dead.rx);

    let outcome = hub
        .handle_frame(&sender.session, r#"{"type":"page_update","data":{"content":"x"}}"#)
        .await;
    let FrameOutcome::Relayed(report) = outcome else {
        panic!("Expected relay");
    };
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, vec![dead_id]);

    let members: HashSet<_> = hub
        .registry()
        .members_of("p1")
        .await
        .iter()
        .map(|h| h.id())
        .collect();
    assert!(!members.contains(&dead_id));
    assert_eq!(members.len(), 3);

    for peer in healthy.iter_mut() {
        let got = peer.received();
        let types: Vec<MessageType> = got.iter().map(|e| e.msg_type).collect();
        assert_eq!(types, vec![MessageType::PageUpdate, MessageType::UserLeft]);
        assert_eq!(got[1].data_str("username"), Some("dave"));
    }
    assert_eq!(hub.stats().send_failures, 1);
}

#[tokio::test]
async fn test_cascading_failures_heal() {
    let hub = test_hub();
    let sender = join(&hub, "alice", "p1").await;
    let mut healthy = join(&hub, "bob", "p1").await;
    let dead1 = join(&hub, "carol", "p1").await;
    let dead2 = join(&hub, "dave", "p1").await;
    let _ = healthy.received();
    drop(dead1.rx);
    drop(dead2.rx);

    hub.handle_frame(&sender.session, r#"{"type":"typing_start"}"#).await;

    assert_eq!(hub.registry().members_of("p1").await.len(), 2);
    let left: Vec<String> = healthy
        .received()
        .iter()
        .filter(|e| e.msg_type == MessageType::UserLeft)
        .filter_map(|e| e.data_str("username").map(str::to_string))
        .collect();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&"carol".to_string()));
    assert!(left.contains(&"dave".to_string()));
}

#[tokio::test]
async fn test_disconnect_announces_departure_once() {
    let hub = test_hub();
    let mut a = join(&hub, "alice", "p1").await;
    let mut b = join(&hub, "bob", "p1").await;
    let _ = a.received();

    hub.disconnect(&mut b.session).await;
    hub.disconnect(&mut b.session).await;

    let got = a.received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].msg_type, MessageType::UserLeft);
    assert_eq!(got[0].data_str("message"), Some("bob left the page"));
    assert!(b.received().is_empty(), "leaver is not told about itself");
    assert_eq!(hub.registry().members_of("p1").await.len(), 1);

    hub.disconnect(&mut a.session).await;
    assert_eq!(hub.registry().page_count().await, 0);
}

#[tokio::test]
async fn test_rejected_connection_is_invisible() {
    let hub = test_hub();
    let mut a = join(&hub, "alice", "p1").await;

    let (handle, mut rx) = ConnectionHandle::channel();
    assert!(hub.connect(handle, "p1", "t-nobody").await.is_err());

    assert!(a.received().is_empty());
    assert_eq!(hub.registry().members_of("p1").await.len(), 1);
    assert!(matches!(rx.try_recv(), Ok(Outbound::Close { code: 1008, .. })));
}

#[tokio::test]
async fn test_page_mutation_reaches_every_member() {
    let hub = test_hub();
    let mut a = join(&hub, "alice", "p1").await;
    let mut b = join(&hub, "bob", "p1").await;
    let _ = a.received();

    let report = hub
        .on_page_mutated(PageMutation {
            page_id: "p1".into(),
            content: "saved body".into(),
            author: UserIdentity::new("u-alice", "alice"),
        })
        .await;
    assert_eq!(report.delivered, 2);

    for peer in [&mut a, &mut b] {
        let got = peer.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg_type, MessageType::PageUpdate);
        assert_eq!(got[0].data_str("content"), Some("saved body"));
        assert_eq!(got[0].data_str("page_id"), Some("p1"));
    }
}

#[tokio::test]
async fn test_comment_skips_author_connections() {
    let hub = test_hub();
    let mut alice_tab1 = join(&hub, "alice", "p1").await;
    let mut alice_tab2 = join(&hub, "alice", "p1").await;
    let mut bob = join(&hub, "bob", "p1").await;
    let _ = alice_tab1.received();
    let _ = alice_tab2.received();

    let report = hub
        .on_comment_added(CommentAdded {
            page_id: "p1".into(),
            comment_id: "c-1".into(),
            content: "Looks good".into(),
            author: UserIdentity::new("u-alice", "alice"),
        })
        .await;
    assert_eq!(report.delivered, 1);

    let got = bob.received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].msg_type, MessageType::CommentAdded);
    assert_eq!(got[0].data_str("comment_id"), Some("c-1"));
    assert_eq!(got[0].data_str("content"), Some("Looks good"));
    assert!(alice_tab1.received().is_empty());
    assert!(alice_tab2.received().is_empty());
}

#[tokio::test]
async fn test_broadcast_to_empty_page_is_noop() {
    let hub = test_hub();
    let report = hub
        .broadcast(
            "nobody-here",
            &Envelope::typing("nobody-here", true, &UserIdentity::new("u", "u")),
            Recipients::All,
        )
        .await;
    assert_eq!(report.delivered, 0);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_two_tabs_listed_twice() {
    let hub = test_hub();
    let _tab1 = join(&hub, "alice", "p1").await;

    let (handle, mut rx) = ConnectionHandle::channel();
    let _tab2 = hub.connect(handle, "p1", "t-alice").await.unwrap();
    let Ok(Outbound::Frame(text)) = rx.try_recv() else {
        panic!("Expected page_users frame");
    };
    let snapshot = Envelope::decode(&text).unwrap();
    assert_eq!(snapshot.data["users"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_senders_all_delivered() {
    let hub = Arc::new(test_hub());
    let mut receiver = join(&hub, "erin", "p1").await;
    let mut senders = Vec::new();
    for name in ["alice", "bob", "carol", "dave"] {
        senders.push(join(&hub, name, "p1").await);
    }
    let _ = receiver.received();

    let mut tasks = Vec::new();
    for peer in senders {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let frame = format!(r#"{{"type":"page_update","data":{{"content":"{i}"}}}}"#);
                hub.handle_frame(&peer.session, &frame).await;
            }
            peer
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let updates = receiver
        .received()
        .into_iter()
        .filter(|e| e.msg_type == MessageType::PageUpdate)
        .count();
    assert_eq!(updates, 100);
}
