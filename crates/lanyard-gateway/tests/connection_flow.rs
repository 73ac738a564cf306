mod common;

use common::*;
use lanyard_core::store::MessageStore;
use lanyard_gateway::connection::{ConnState, Connection};
use lanyard_models::gateway::{
    ClientCommand, ErrorCode, Identify, MessageSend, ServerEvent, VoiceJoin, VoiceStateSet,
};
use lanyard_models::presence::PresenceStatus;

fn message(content: &str, nonce: Option<&str>) -> ClientCommand {
    ClientCommand::MessageSend(MessageSend {
        content: content.to_string(),
        nonce: nonce.map(str::to_string),
    })
}

fn set_muted(muted: Option<bool>) -> ClientCommand {
    ClientCommand::VoiceStateSet(VoiceStateSet {
        muted,
        deafened: None,
        speaking: None,
    })
}

#[tokio::test]
async fn identify_with_bad_token_closes_connection() {
    let gw = gateway();
    let (mut conn, mut rx) = Connection::new(&gw.ctx);
    conn.handle_command(ClientCommand::Identify(Identify {
        token: "not.a.token".into(),
    }))
    .await;

    match next_event(&mut rx).await {
        ServerEvent::Error(payload) => assert_eq!(payload.code, ErrorCode::AuthFailed),
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert_eq!(conn.handle.state(), ConnState::Closing);
    assert!(!gw.ctx.hub.is_registered(0).await);
}

#[tokio::test]
async fn identify_with_unknown_user_closes_connection() {
    let gw = gateway();
    let (mut conn, mut rx) = Connection::new(&gw.ctx);
    let token = lanyard_core::auth::create_token(99, SECRET, 60).unwrap();
    conn.handle_command(ClientCommand::Identify(Identify { token }))
        .await;

    match next_event(&mut rx).await {
        ServerEvent::Error(payload) => assert_eq!(payload.code, ErrorCode::AuthFailed),
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert_eq!(conn.handle.state(), ConnState::Closing);
}

#[tokio::test]
async fn commands_require_identify() {
    let gw = gateway();
    let (mut conn, mut rx) = Connection::new(&gw.ctx);
    conn.handle_command(message("hello", None)).await;

    match next_event(&mut rx).await {
        ServerEvent::Error(payload) => assert_eq!(payload.code, ErrorCode::NotAuthenticated),
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert_eq!(conn.handle.state(), ConnState::Connected);
}

#[tokio::test]
async fn message_send_echoes_nonce_and_stops_typing() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;
    let (_bob, mut bob_rx) = identified(&gw, 2).await;
    drain(&mut alice_rx);

    alice.handle_command(ClientCommand::Typing).await;
    alice.handle_command(message("hi there", Some("n-1"))).await;
    settle(&gw, &alice).await;

    // Sender sees their own message with the nonce, but not their typing.
    let frames = drain(&mut alice_rx);
    let alice_events = events(&frames);
    assert_eq!(alice_events.len(), 1);
    match alice_events[0] {
        ServerEvent::MessageCreate(msg) => {
            assert_eq!(msg.content, "hi there");
            assert_eq!(msg.nonce.as_deref(), Some("n-1"));
            assert_eq!(msg.author_id, 1);
        }
        other => panic!("expected MESSAGE_CREATE, got {other:?}"),
    }

    // Everyone else sees typing start, then stop, then the message.
    let names = event_names(&drain(&mut bob_rx));
    assert_eq!(names, vec!["TYPING_START", "TYPING_STOP", "MESSAGE_CREATE"]);

    // And the message was persisted.
    let history = gw.ctx.messages.history(None, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].nonce.is_none());
}

#[tokio::test]
async fn message_rate_limit_reports_retry() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;

    alice.handle_command(message("first", None)).await;
    alice.handle_command(message("second", Some("n-2"))).await;
    settle(&gw, &alice).await;

    let frames = drain(&mut alice_rx);
    let mut saw_limit = false;
    for event in events(&frames) {
        if let ServerEvent::Error(payload) = event {
            assert_eq!(payload.code, ErrorCode::RateLimited);
            assert_eq!(payload.nonce.as_deref(), Some("n-2"));
            assert!(payload.retry_after.is_some());
            saw_limit = true;
        }
    }
    assert!(saw_limit);
    assert_eq!(gw.ctx.messages.history(None, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_message_rejected() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;

    alice
        .handle_command(message(&"x".repeat(4097), Some("n-3")))
        .await;
    match next_event(&mut alice_rx).await {
        ServerEvent::Error(payload) => {
            assert_eq!(payload.code, ErrorCode::MessageTooLong);
            assert_eq!(payload.nonce.as_deref(), Some("n-3"));
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert!(gw.ctx.messages.history(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_message_does_not_consume_rate_slot() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;

    alice
        .handle_command(message(&"x".repeat(4097), Some("n-big")))
        .await;
    match next_event(&mut alice_rx).await {
        ServerEvent::Error(payload) => assert_eq!(payload.code, ErrorCode::MessageTooLong),
        other => panic!("expected ERROR, got {other:?}"),
    }

    // The corrected resend goes straight through.
    alice.handle_command(message("trimmed", Some("n-ok"))).await;
    settle(&gw, &alice).await;
    let frames = drain(&mut alice_rx);
    match events(&frames).first() {
        Some(ServerEvent::MessageCreate(msg)) => {
            assert_eq!(msg.nonce.as_deref(), Some("n-ok"));
        }
        other => panic!("expected MESSAGE_CREATE, got {other:?}"),
    }
}

#[tokio::test]
async fn presence_set_is_broadcast() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;
    let (_bob, mut bob_rx) = identified(&gw, 2).await;
    drain(&mut alice_rx);

    alice
        .handle_command(ClientCommand::PresenceSet(
            lanyard_models::gateway::PresenceSet {
                status: PresenceStatus::Idle,
            },
        ))
        .await;
    match next_event(&mut bob_rx).await {
        ServerEvent::PresenceUpdate(update) => {
            assert_eq!(update.user_id, 1);
            assert_eq!(update.status, PresenceStatus::Idle);
        }
        other => panic!("expected PRESENCE_UPDATE, got {other:?}"),
    }
    assert_eq!(alice.handle.presence(), PresenceStatus::Idle);
}

#[tokio::test]
async fn clearing_mute_is_limited_but_muting_is_not() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;
    alice
        .handle_command(ClientCommand::VoiceJoin(VoiceJoin {
            muted: true,
            deafened: false,
        }))
        .await;
    drain(&mut alice_rx);

    // Five unmutes fit in the window.
    for _ in 0..5 {
        alice.handle_command(set_muted(Some(false))).await;
        alice.handle_command(set_muted(Some(true))).await;
    }
    settle(&gw, &alice).await;
    let frames = drain(&mut alice_rx);
    assert!(events(&frames)
        .iter()
        .all(|e| matches!(e, ServerEvent::VoiceStateUpdate(_))));

    // The sixth trips the cooldown.
    alice.handle_command(set_muted(Some(false))).await;
    match next_event(&mut alice_rx).await {
        ServerEvent::Error(payload) => {
            assert_eq!(payload.code, ErrorCode::VoiceStateCooldown);
            assert!(payload.retry_after.is_some());
        }
        other => panic!("expected ERROR, got {other:?}"),
    }

    // Muting remains allowed during the cooldown.
    alice.handle_command(set_muted(Some(true))).await;
    settle(&gw, &alice).await;
    match next_event(&mut alice_rx).await {
        ServerEvent::VoiceStateUpdate(update) => assert!(update.muted),
        other => panic!("expected VOICE_STATE_UPDATE, got {other:?}"),
    }
}

#[tokio::test]
async fn voice_join_attempts_are_limited() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;

    for _ in 0..5 {
        alice
            .handle_command(ClientCommand::VoiceJoin(VoiceJoin {
                muted: false,
                deafened: false,
            }))
            .await;
        alice.handle_command(ClientCommand::VoiceLeave).await;
    }
    drain(&mut alice_rx);

    alice
        .handle_command(ClientCommand::VoiceJoin(VoiceJoin {
            muted: false,
            deafened: false,
        }))
        .await;
    match next_event(&mut alice_rx).await {
        ServerEvent::Error(payload) => {
            assert_eq!(payload.code, ErrorCode::VoiceJoinCooldown);
            assert!(payload.retry_after.is_some());
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    // The limiter fired before the hub was asked anything.
    assert_eq!(gw.bridge.added().len(), 5);
}

#[tokio::test]
async fn speaking_requires_voice_membership() {
    let gw = gateway();
    let (mut alice, mut alice_rx) = identified(&gw, 1).await;

    alice
        .handle_command(ClientCommand::VoiceStateSet(VoiceStateSet {
            muted: None,
            deafened: None,
            speaking: Some(true),
        }))
        .await;
    match next_event(&mut alice_rx).await {
        ServerEvent::Error(payload) => assert_eq!(payload.code, ErrorCode::NotInVoice),
        other => panic!("expected ERROR, got {other:?}"),
    }

    let (_bob, mut bob_rx) = identified(&gw, 2).await;
    drain(&mut alice_rx);
    alice
        .handle_command(ClientCommand::VoiceJoin(VoiceJoin {
            muted: false,
            deafened: false,
        }))
        .await;
    drain(&mut bob_rx);
    alice
        .handle_command(ClientCommand::VoiceStateSet(VoiceStateSet {
            muted: None,
            deafened: None,
            speaking: Some(true),
        }))
        .await;
    match next_event(&mut bob_rx).await {
        ServerEvent::VoiceSpeaking(speaking) => {
            assert_eq!(speaking.user_id, 1);
            assert!(speaking.speaking);
        }
        other => panic!("expected VOICE_SPEAKING, got {other:?}"),
    }
    // Speaking updates are not echoed to the speaker.
    drain(&mut alice_rx);
    settle(&gw, &alice).await;
    assert!(drain(&mut alice_rx).is_empty());
}
