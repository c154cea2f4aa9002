//! Session lifecycle tests against scripted collaborators
//!
//! Covers candidate buffering and flushing, id reconciliation, teardown
//! idempotence, late async completions, and the responder flow.

mod common;

use std::sync::Arc;

use callsession::session::{Role, SessionError, SessionEvent, SessionState};
use callsession::signaling::{ConversationId, InboundSignal, OutboundSignal, SessionId};
use callsession::transport::{IceCandidate, MediaError, PeerConnectionState, StaticMediaSource};
use common::{
    eventually, quiet_config, remote_candidate, remote_sdp, settle, GatedDirectory, Harness,
};

fn session_created(id: &str, link: Option<&str>) -> InboundSignal {
    InboundSignal::SessionCreated {
        session_id: SessionId::new(id),
        conference_link: link.map(str::to_string),
        conversation_id: Some(ConversationId::new(common::CONVERSATION)),
    }
}

fn foundations(candidates: &[IceCandidate]) -> Vec<String> {
    candidates
        .iter()
        .filter_map(|c| c.candidate.split_whitespace().next().map(str::to_string))
        .collect()
}

/// Start an initiator and wait until its loopback candidates are buffered
async fn started_initiator(candidates: usize) -> Harness {
    let harness = Harness::new(candidates);
    harness.orchestrator.start().await.expect("start failed");
    let orchestrator = harness.orchestrator.clone();
    eventually(|| {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.pending_candidates() == candidates }
    })
    .await;
    harness
}

/// Start an initiator and assign it session `id`
async fn initiator_with_id(id: &str) -> Harness {
    let harness = started_initiator(3).await;
    harness.signaling.push(session_created(id, None));
    let orchestrator = harness.orchestrator.clone();
    eventually(|| {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.session_id().is_some() }
    })
    .await;
    harness
}

/// Test: Candidates are held until the session id arrives
/// Given an initiator that gathered 3 candidates before any id
/// When session_created{X} arrives
/// Then nothing was sent before, and exactly one ice_candidates{X, [c1, c2, c3]} after
#[tokio::test]
async fn test_initiator_flushes_buffered_candidates_once() {
    let harness = started_initiator(3).await;
    assert!(harness.signaling.sent_named("ice_candidates").is_empty());
    assert_eq!(harness.signaling.sent_named("offer").len(), 1);

    harness.signaling.push(session_created("X", None));

    let signaling = harness.signaling.clone();
    eventually(|| {
        let signaling = signaling.clone();
        async move { !signaling.sent_named("ice_candidates").is_empty() }
    })
    .await;
    settle().await;

    let flushed = harness.signaling.sent_named("ice_candidates");
    assert_eq!(flushed.len(), 1, "Buffer must be flushed exactly once");
    match &flushed[0] {
        OutboundSignal::IceCandidates {
            session_id,
            candidates,
        } => {
            assert_eq!(session_id, &SessionId::new("X"));
            assert_eq!(
                foundations(candidates),
                vec!["candidate:1", "candidate:2", "candidate:3"]
            );
        }
        other => panic!("Expected ice_candidates, got {:?}", other),
    }
    assert_eq!(harness.orchestrator.pending_candidates(), 0);
}

/// Test: First session id wins
/// Given an initiator whose id was assigned X with a conference link
/// When X arrives again and then Y with another link
/// Then the id and link stay as first assigned and no extra flush happens
#[tokio::test]
async fn test_session_id_and_link_are_first_writer_wins() {
    let mut harness = started_initiator(2).await;

    harness
        .signaling
        .push(session_created("X", Some("https://conference.local/join/X")));
    harness.signaling.push(session_created("X", None));
    harness
        .signaling
        .push(session_created("Y", Some("https://conference.local/join/Y")));
    settle().await;

    assert_eq!(harness.orchestrator.session_id(), Some(SessionId::new("X")));
    assert_eq!(
        harness.orchestrator.conference_link().as_deref(),
        Some("https://conference.local/join/X")
    );
    assert_eq!(harness.signaling.sent_named("ice_candidates").len(), 1);

    let events = harness.drain_events();
    let assigned: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::SessionIdAssigned { .. }))
        .collect();
    let links: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ConferenceLink { .. }))
        .collect();
    assert_eq!(assigned.len(), 1);
    assert_eq!(links.len(), 1);
}

/// Test: Local candidates after the id is known are forwarded immediately
/// Given an initiator with a known id
/// When the owner reports a new local candidate
/// Then it is sent alone in its own ice_candidates message
#[tokio::test]
async fn test_local_candidate_forwarded_once_id_known() {
    let harness = initiator_with_id("X").await;
    settle().await;

    let extra = IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9999 typ host");
    harness
        .orchestrator
        .on_local_candidate(extra.clone())
        .await
        .unwrap();

    let sent = harness.signaling.sent_named("ice_candidates");
    assert_eq!(
        sent.last(),
        Some(&OutboundSignal::IceCandidates {
            session_id: SessionId::new("X"),
            candidates: vec![extra],
        })
    );
}

/// Test: end_session is idempotent
/// Given a negotiating initiator with a known id
/// When end_session is called twice
/// Then one end_session message is sent and the transport is closed once
#[tokio::test]
async fn test_end_session_twice_behaves_as_once() {
    let harness = initiator_with_id("X").await;

    harness.orchestrator.end_session().await.unwrap();
    harness.orchestrator.end_session().await.unwrap();

    assert_eq!(harness.orchestrator.state(), SessionState::Ended);
    assert_eq!(
        harness.signaling.sent_named("end_session"),
        vec![OutboundSignal::EndSession {
            session_id: SessionId::new("X")
        }]
    );
    let transport = harness.transports.last().expect("transport created");
    assert_eq!(transport.close_count(), 1);
    assert_eq!(harness.media.stopped_count(), 1);
}

/// Test: Teardown drops the session's signaling subscription
/// Given a live session
/// When it ends
/// Then its subscription is unregistered from the channel
#[tokio::test]
async fn test_subscription_is_scoped_to_session() {
    let harness = started_initiator(1).await;
    assert_eq!(harness.signaling.subscription_count(), 1);

    harness.orchestrator.end_session().await.unwrap();

    let signaling = harness.signaling.clone();
    eventually(|| {
        let signaling = signaling.clone();
        async move { signaling.subscription_count() == 0 }
    })
    .await;
}

/// Test: Ending before media resolves leaves no trace
/// Given an initiator whose media acquisition is still pending
/// When end_session is called and media then resolves
/// Then no transport is created, nothing is signaled and the media is released
#[tokio::test]
async fn test_end_before_media_resolves() {
    let (media, gate) = StaticMediaSource::gated();
    let harness = Harness::with_media(3, media, quiet_config());

    let orchestrator = harness.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start().await });
    settle().await;
    assert_eq!(harness.orchestrator.state(), SessionState::Idle);

    harness.orchestrator.end_session().await.unwrap();
    gate.open();

    start.await.unwrap().expect("late completion must be a no-op");
    assert_eq!(harness.transports.created_count(), 0);
    assert!(harness.signaling.sent().is_empty());
    assert_eq!(harness.media.acquired_count(), 1);
    assert_eq!(harness.media.stopped_count(), 1);
    assert_eq!(harness.orchestrator.state(), SessionState::Ended);
}

/// Test: Media failure aborts start
/// Given a media source that denies access
/// When start is called
/// Then MediaAcquisition is returned with no transport and no signaling
#[tokio::test]
async fn test_media_failure_aborts_start() {
    let mut harness = Harness::with_media(
        3,
        StaticMediaSource::failing(MediaError::PermissionDenied),
        quiet_config(),
    );

    let result = harness.orchestrator.start().await;

    assert!(matches!(
        result,
        Err(SessionError::MediaAcquisition(MediaError::PermissionDenied))
    ));
    assert_eq!(harness.transports.created_count(), 0);
    assert!(harness.signaling.sent().is_empty());
    assert_eq!(harness.orchestrator.state(), SessionState::Failed);
    assert!(harness
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Failed { .. })));
}

/// Test: Conversation join precedes the offer
/// Given the default configuration
/// When an initiator starts
/// Then join_conversation is sent before the offer
#[tokio::test]
async fn test_join_conversation_before_offer() {
    let harness = Harness::with_media(
        0,
        StaticMediaSource::new(),
        callsession::CallConfig::default(),
    );

    harness.orchestrator.start().await.unwrap();

    let names: Vec<_> = harness.signaling.sent().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["join_conversation", "offer"]);
}

/// Test: Initiator reaches Connected only when the transport does
/// Given a negotiating initiator with id X
/// When the answer and a remote candidate arrive
/// Then the session becomes Connected and remote tracks are published
#[tokio::test]
async fn test_initiator_connects_after_answer_and_candidates() {
    let mut harness = initiator_with_id("X").await;
    assert_eq!(harness.orchestrator.state(), SessionState::Negotiating);

    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: Some(SessionId::new("X")),
    });
    settle().await;
    assert_eq!(
        harness.orchestrator.state(),
        SessionState::Negotiating,
        "Answer alone must not connect"
    );

    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(1)],
        session_id: Some(SessionId::new("X")),
    });
    harness.wait_state(SessionState::Connected).await;
    settle().await;

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::RemoteTrack(_))));
    assert!(events.contains(&SessionEvent::StateChanged {
        state: SessionState::Connected,
        role: Role::Initiator,
    }));
}

/// Test: Candidates that beat the answer are applied after it
/// Given a negotiating initiator
/// When remote candidates arrive before the answer
/// Then they are applied in arrival order once the answer is set
#[tokio::test]
async fn test_early_remote_candidates_applied_after_answer() {
    let harness = initiator_with_id("X").await;

    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(1), remote_candidate(2)],
        session_id: Some(SessionId::new("X")),
    });
    settle().await;
    let transport = harness.transports.last().unwrap();
    assert!(transport.remote_candidates().is_empty());

    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: None,
    });
    harness.wait_state(SessionState::Connected).await;

    assert_eq!(
        transport.remote_candidates(),
        vec![remote_candidate(1), remote_candidate(2)]
    );
}

/// Test: Duplicate answers are ignored
/// Given a connected initiator
/// When the same answer arrives again
/// Then the session stays Connected
#[tokio::test]
async fn test_duplicate_answer_ignored() {
    let harness = initiator_with_id("X").await;
    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: None,
    });
    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(1)],
        session_id: None,
    });
    harness.wait_state(SessionState::Connected).await;

    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: None,
    });
    settle().await;

    assert_eq!(harness.orchestrator.state(), SessionState::Connected);
}

/// Test: Malformed answer fails the session
/// Given a negotiating initiator
/// When an answer with an invalid description arrives
/// Then the session fails and its resources are released
#[tokio::test]
async fn test_malformed_answer_fails_session() {
    let mut harness = initiator_with_id("X").await;

    harness.signaling.push(InboundSignal::Answer {
        sdp: "not sdp".to_string(),
        session_id: None,
    });
    harness.wait_state(SessionState::Failed).await;
    settle().await;

    assert_eq!(harness.transports.last().unwrap().close_count(), 1);
    assert_eq!(harness.media.stopped_count(), 1);
    let events = harness.drain_events();
    let failed_at = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Failed { .. }))
        .expect("Failed event published");
    let state_at = events
        .iter()
        .position(|e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionState::Failed,
                    ..
                }
            )
        })
        .expect("Failed state published");
    assert!(state_at < failed_at);
    assert!(harness.signaling.sent_named("end_session").is_empty());
}

/// Test: Remote candidates for another session are ignored
/// Given an initiator with id X and an applied answer
/// When candidates tagged with session Z arrive
/// Then they never reach the transport
#[tokio::test]
async fn test_stale_candidates_ignored() {
    let harness = initiator_with_id("X").await;
    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: Some(SessionId::new("X")),
    });
    settle().await;

    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(7)],
        session_id: Some(SessionId::new("Z")),
    });
    settle().await;

    assert!(harness
        .transports
        .last()
        .unwrap()
        .remote_candidates()
        .is_empty());
    assert_eq!(harness.orchestrator.state(), SessionState::Negotiating);
}

/// Test: Rejected remote candidates are not fatal
/// Given an initiator with an applied answer
/// When a malformed candidate arrives followed by a valid one
/// Then the session still connects
#[tokio::test]
async fn test_rejected_candidate_is_logged_not_fatal() {
    let harness = initiator_with_id("X").await;
    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: None,
    });
    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![IceCandidate::new("garbage"), remote_candidate(1)],
        session_id: None,
    });

    harness.wait_state(SessionState::Connected).await;
    assert_eq!(
        harness.transports.last().unwrap().remote_candidates(),
        vec![remote_candidate(1)]
    );
}

/// Test: Transport failure is terminal
/// Given a negotiating initiator
/// When the transport reports Failed
/// Then the session fails and the transport is closed once
#[tokio::test]
async fn test_transport_failure_fails_session() {
    let harness = started_initiator(1).await;
    let transport = harness.transports.last().unwrap();

    transport.simulate_failure();
    harness.wait_state(SessionState::Failed).await;

    assert_eq!(transport.close_count(), 1);
}

/// Test: Transient disconnect is reported without a state change
/// Given a connected initiator
/// When the transport reports Disconnected
/// Then a ConnectionState event is published and the session stays Connected
#[tokio::test]
async fn test_transient_disconnect_is_reported() {
    let mut harness = initiator_with_id("X").await;
    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: None,
    });
    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(1)],
        session_id: None,
    });
    harness.wait_state(SessionState::Connected).await;
    harness.drain_events();

    harness.transports.last().unwrap().simulate_disconnect();
    settle().await;

    assert!(harness
        .drain_events()
        .contains(&SessionEvent::ConnectionState(
            PeerConnectionState::Disconnected
        )));
    assert_eq!(harness.orchestrator.state(), SessionState::Connected);
}

/// Test: Presence and server errors are surfaced as events
/// Given a live session
/// When participant and error messages arrive
/// Then matching RemotePresence and RemoteError events are published
#[tokio::test]
async fn test_presence_and_errors_published() {
    let mut harness = started_initiator(0).await;
    harness.drain_events();

    harness.signaling.push(InboundSignal::ParticipantJoined {
        participants_count: Some(1),
    });
    harness.signaling.push(InboundSignal::ParticipantJoined {
        participants_count: Some(2),
    });
    harness.signaling.push(InboundSignal::ParticipantLeft {
        participants_count: None,
    });
    harness.signaling.push(InboundSignal::Error {
        message: "conversation closed".to_string(),
    });
    settle().await;

    let events = harness.drain_events();
    assert_eq!(
        events,
        vec![
            SessionEvent::RemotePresence {
                waiting: true,
                participants: Some(1)
            },
            SessionEvent::RemotePresence {
                waiting: false,
                participants: Some(2)
            },
            SessionEvent::RemotePresence {
                waiting: true,
                participants: None
            },
            SessionEvent::RemoteError {
                message: "conversation closed".to_string()
            },
        ]
    );
}

/// Test: Responder with late media still answers correctly
/// Given a responder whose media is held back
/// When remote candidates arrive before media, and media then resolves
/// Then the answer is sent after both descriptions are set and the early candidates are applied
#[tokio::test]
async fn test_responder_with_late_media() {
    let (media, gate) = StaticMediaSource::gated();
    let harness = Harness::with_media(2, media, quiet_config());

    let orchestrator = harness.orchestrator.clone();
    let answering = tokio::spawn(async move {
        orchestrator
            .on_remote_offer(remote_sdp(), SessionId::new("Y"))
            .await
    });
    settle().await;
    assert_eq!(harness.orchestrator.role(), Some(Role::Responder));

    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(1), remote_candidate(2)],
        session_id: Some(SessionId::new("Y")),
    });
    settle().await;
    assert!(harness.signaling.sent_named("answer").is_empty());

    gate.open();
    answering.await.unwrap().expect("answer flow failed");

    let transport = harness.transports.last().unwrap();
    assert!(transport.local_description().is_some());
    assert!(transport.remote_description().is_some());
    assert_eq!(
        transport.remote_candidates(),
        vec![remote_candidate(1), remote_candidate(2)]
    );
    match harness.signaling.sent_named("answer").as_slice() {
        [OutboundSignal::Answer { session_id, sdp }] => {
            assert_eq!(session_id, &SessionId::new("Y"));
            assert_eq!(Some(sdp), transport.local_description().map(|d| d.sdp).as_ref());
        }
        other => panic!("Expected one answer, got {:?}", other),
    }
    harness.wait_state(SessionState::Connected).await;
}

/// Test: Responder forwards candidates under the offer's id
/// Given a responder answering offer Y
/// When its transport gathers candidates
/// Then they are sent tagged with Y without waiting for session_created
#[tokio::test]
async fn test_responder_forwards_candidates_with_offer_id() {
    let harness = Harness::new(2);

    harness
        .orchestrator
        .on_remote_offer(remote_sdp(), SessionId::new("Y"))
        .await
        .unwrap();

    let signaling = harness.signaling.clone();
    eventually(|| {
        let signaling = signaling.clone();
        async move { signaling.sent_named("ice_candidates").len() == 2 }
    })
    .await;
    for signal in harness.signaling.sent_named("ice_candidates") {
        match signal {
            OutboundSignal::IceCandidates { session_id, .. } => {
                assert_eq!(session_id, SessionId::new("Y"))
            }
            other => panic!("Unexpected {:?}", other),
        }
    }
    assert_eq!(harness.orchestrator.pending_candidates(), 0);
}

/// Test: Remote end only applies to the matching session
/// Given a responder for session Y
/// When session_ended{Z} and then session_ended{Y} arrive
/// Then Z is ignored and Y tears down without sending end_session
#[tokio::test]
async fn test_remote_session_ended_matches_id() {
    let harness = Harness::new(1);
    harness
        .orchestrator
        .on_remote_offer(remote_sdp(), SessionId::new("Y"))
        .await
        .unwrap();

    harness.signaling.push(InboundSignal::SessionEnded {
        session_id: SessionId::new("Z"),
    });
    settle().await;
    assert!(harness.orchestrator.state().is_live());

    harness.signaling.push(InboundSignal::SessionEnded {
        session_id: SessionId::new("Y"),
    });
    harness.wait_state(SessionState::Ended).await;

    assert!(harness.signaling.sent_named("end_session").is_empty());
    assert_eq!(harness.transports.last().unwrap().close_count(), 1);
    assert_eq!(harness.media.stopped_count(), 1);
}

/// Test: Local candidate after teardown is a no-op
/// Given an ended session
/// When a local candidate is reported
/// Then nothing is sent
#[tokio::test]
async fn test_local_candidate_after_teardown() {
    let harness = initiator_with_id("X").await;
    harness.orchestrator.end_session().await.unwrap();
    let before = harness.signaling.sent().len();

    harness
        .orchestrator
        .on_local_candidate(remote_candidate(3))
        .await
        .unwrap();

    assert_eq!(harness.signaling.sent().len(), before);
}

/// Test: Listening mode answers offers through the idle subscription
/// Given a listening orchestrator
/// When an offer and its candidates arrive back to back
/// Then a responder session answers and applies every candidate
#[tokio::test]
async fn test_listen_answers_offer_without_losing_candidates() {
    let harness = Harness::new(1);
    harness.orchestrator.listen();

    harness.signaling.push(InboundSignal::Offer {
        session_id: SessionId::new("Y"),
        sdp: remote_sdp(),
        conversation_id: Some(ConversationId::new(common::CONVERSATION)),
    });
    harness.signaling.push(InboundSignal::IceCandidates {
        candidates: vec![remote_candidate(1)],
        session_id: Some(SessionId::new("Y")),
    });

    harness.wait_state(SessionState::Connected).await;
    assert_eq!(harness.orchestrator.role(), Some(Role::Responder));
    assert_eq!(harness.signaling.sent_named("answer").len(), 1);
    assert_eq!(
        harness.transports.last().unwrap().remote_candidates(),
        vec![remote_candidate(1)]
    );
    harness.orchestrator.stop_listening();
}

/// Start an initiator whose create_session is held back, with 3 candidates buffered
async fn initiator_with_pending_directory(directory: Arc<GatedDirectory>) -> Harness {
    let harness = Harness::with_directory(3, directory.clone());
    harness.orchestrator.start().await.expect("start failed");
    let orchestrator = harness.orchestrator.clone();
    eventually(|| {
        let orchestrator = orchestrator.clone();
        let directory = directory.clone();
        async move { orchestrator.pending_candidates() == 3 && directory.requests().len() == 1 }
    })
    .await;
    harness
}

async fn wait_for_session_id(harness: &Harness) {
    let orchestrator = harness.orchestrator.clone();
    eventually(|| {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.session_id().is_some() }
    })
    .await;
}

/// Id and link assignments published, in order
fn assignments(events: &[SessionEvent]) -> (Vec<SessionId>, Vec<String>) {
    let ids = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SessionIdAssigned { session_id } => Some(session_id.clone()),
            _ => None,
        })
        .collect();
    let links = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConferenceLink { link } => Some(link.clone()),
            _ => None,
        })
        .collect();
    (ids, links)
}

fn assert_single_flush(harness: &Harness, id: &str) {
    match harness.signaling.sent_named("ice_candidates").as_slice() {
        [OutboundSignal::IceCandidates {
            session_id,
            candidates,
        }] => {
            assert_eq!(session_id, &SessionId::new(id));
            assert_eq!(
                foundations(candidates),
                vec!["candidate:1", "candidate:2", "candidate:3"]
            );
        }
        other => panic!("Expected one flush under {}, got {:?}", id, other),
    }
}

/// Test: session_created push beats the create_session reply
/// Given an initiator waiting on create_session with 3 buffered candidates
/// When session_created{S, link-S} arrives and then the reply {D, link-D}
/// Then S and link-S are kept and the buffer is flushed once under S
#[tokio::test]
async fn test_push_before_directory_reply_wins() {
    let directory = GatedDirectory::new();
    let mut harness = initiator_with_pending_directory(directory.clone()).await;
    assert!(directory.requests()[0].generate_link);

    harness.signaling.push(session_created("S", Some("link-S")));
    wait_for_session_id(&harness).await;
    directory.release("D", Some("link-D"));
    settle().await;

    assert_eq!(harness.orchestrator.session_id(), Some(SessionId::new("S")));
    assert_eq!(harness.orchestrator.conference_link().as_deref(), Some("link-S"));
    assert_single_flush(&harness, "S");

    let (ids, links) = assignments(&harness.drain_events());
    assert_eq!(ids, vec![SessionId::new("S")]);
    assert_eq!(links, vec!["link-S".to_string()]);
}

/// Test: create_session reply beats the session_created push
/// Given an initiator waiting on create_session with 3 buffered candidates
/// When the reply {D, link-D} arrives and then session_created{S, link-S}
/// Then D and link-D are kept and the buffer is flushed once under D
#[tokio::test]
async fn test_directory_reply_before_push_wins() {
    let directory = GatedDirectory::new();
    let mut harness = initiator_with_pending_directory(directory.clone()).await;

    directory.release("D", Some("link-D"));
    wait_for_session_id(&harness).await;
    harness.signaling.push(session_created("S", Some("link-S")));
    settle().await;

    assert_eq!(harness.orchestrator.session_id(), Some(SessionId::new("D")));
    assert_eq!(harness.orchestrator.conference_link().as_deref(), Some("link-D"));
    assert_single_flush(&harness, "D");

    let (ids, links) = assignments(&harness.drain_events());
    assert_eq!(ids, vec![SessionId::new("D")]);
    assert_eq!(links, vec!["link-D".to_string()]);
}

fn offer_for(id: &str) -> InboundSignal {
    InboundSignal::Offer {
        session_id: SessionId::new(id),
        sdp: remote_sdp(),
        conversation_id: Some(ConversationId::new(common::CONVERSATION)),
    }
}

/// Test: A redelivered offer does not revive an ended session
/// Given a listener that answered offer{Y} and saw session_ended{Y}
/// When the same offer is delivered again
/// Then no new session, transport or answer is created
#[tokio::test]
async fn test_replayed_offer_after_end_is_ignored() {
    let harness = Harness::new(1);
    harness.orchestrator.listen();

    harness.signaling.push(offer_for("Y"));
    harness.wait_state(SessionState::Negotiating).await;
    harness.signaling.push(InboundSignal::SessionEnded {
        session_id: SessionId::new("Y"),
    });
    harness.wait_state(SessionState::Ended).await;
    settle().await;

    harness.signaling.push(offer_for("Y"));
    settle().await;

    assert_eq!(harness.orchestrator.state(), SessionState::Ended);
    assert_eq!(harness.transports.created_count(), 1);
    assert_eq!(harness.signaling.sent_named("answer").len(), 1);

    // A fresh session id is still answered
    harness.signaling.push(offer_for("Z"));
    harness.wait_state(SessionState::Negotiating).await;
    assert_eq!(harness.orchestrator.session_id(), Some(SessionId::new("Z")));
    harness.orchestrator.stop_listening();
}

/// Test: Answering an ended session's offer again is a no-op
/// Given a responder for Y that was ended locally
/// When on_remote_offer is called with Y again
/// Then it returns without creating a transport or sending an answer
#[tokio::test]
async fn test_offer_for_finished_session_not_reopened() {
    let harness = Harness::new(1);
    harness
        .orchestrator
        .on_remote_offer(remote_sdp(), SessionId::new("Y"))
        .await
        .unwrap();
    harness.orchestrator.end_session().await.unwrap();

    let again = harness
        .orchestrator
        .on_remote_offer(remote_sdp(), SessionId::new("Y"))
        .await;

    assert!(again.is_ok());
    assert_eq!(harness.orchestrator.state(), SessionState::Ended);
    assert_eq!(harness.transports.created_count(), 1);
    assert_eq!(harness.signaling.sent_named("answer").len(), 1);
}

/// Test: An answer sent to a responder is a negotiation error
/// Given a negotiating responder for Y
/// When answer{Y} arrives
/// Then the session fails and its transport is closed
#[tokio::test]
async fn test_answer_to_responder_fails_session() {
    let mut harness = Harness::new(1);
    harness
        .orchestrator
        .on_remote_offer(remote_sdp(), SessionId::new("Y"))
        .await
        .unwrap();

    harness.signaling.push(InboundSignal::Answer {
        sdp: remote_sdp(),
        session_id: Some(SessionId::new("Y")),
    });
    harness.wait_state(SessionState::Failed).await;

    assert!(harness
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Failed { reason } if reason.contains("responder"))));
    assert_eq!(harness.transports.last().unwrap().close_count(), 1);
}
