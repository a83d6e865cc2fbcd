//! Session and interaction-control tracking

mod common;

use std::sync::Arc;

use common::SessionProbe;
use serde_json::json;
use voice_orchestrator::{
    Error, InteractionControlManager, InteractionMode, SessionManager, SessionState,
};

#[test]
fn sessions_of_different_play_services_stay_active_until_clear() {
    let sessions = SessionManager::new();
    let probe = Arc::new(SessionProbe::default());
    sessions.add_listener(probe.clone());
    sessions.set("dlg-1", "s-1", "ps-1").unwrap();
    sessions.set("dlg-2", "s-2", "ps-2").unwrap();

    sessions.activate("dlg-1");
    sessions.activate("dlg-2");

    assert_eq!(sessions.active_count(), 2);
    assert_eq!(
        sessions.session("dlg-1").map(|s| s.state),
        Some(SessionState::Active)
    );
    assert_eq!(
        sessions.get_active_session_info(),
        json!([
            {"sessionId": "s-1", "playServiceId": "ps-1"},
            {"sessionId": "s-2", "playServiceId": "ps-2"}
        ])
    );

    sessions.clear();

    assert_eq!(sessions.active_count(), 0);
    assert_eq!(
        probe.log.take(),
        vec!["+dlg-1:ps-1", "+dlg-2:ps-2", "-dlg-1", "-dlg-2"]
    );
}

#[test]
fn newer_session_of_same_play_service_supersedes() {
    let sessions = SessionManager::new();
    let probe = Arc::new(SessionProbe::default());
    sessions.add_listener(probe.clone());
    sessions.set("dlg-1", "s-1", "ps-1").unwrap();
    sessions.set("dlg-2", "s-2", "ps-1").unwrap();

    sessions.activate("dlg-1");
    sessions.activate("dlg-2");

    assert_eq!(sessions.active_count(), 1);
    assert_eq!(
        probe.log.take(),
        vec!["+dlg-1:ps-1", "-dlg-1", "+dlg-2:ps-1"]
    );
}

#[test]
fn deactivate_is_idempotent() {
    let sessions = SessionManager::new();
    let probe = Arc::new(SessionProbe::default());
    sessions.add_listener(probe.clone());
    sessions.set("dlg", "s", "ps").unwrap();
    sessions.activate("dlg");

    sessions.deactivate("dlg");
    sessions.deactivate("dlg");

    assert_eq!(probe.log.take(), vec!["+dlg:ps", "-dlg"]);
    assert!(matches!(
        sessions.set("", "s", "ps"),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn one_holder_owns_the_multi_turn_window() {
    let interaction = InteractionControlManager::new();

    interaction.start(InteractionMode::MultiTurn, "ASR").unwrap();
    assert!(matches!(
        interaction.start(InteractionMode::MultiTurn, "Text"),
        Err(Error::InteractionBusy(_))
    ));
    assert!(!interaction.finish(InteractionMode::MultiTurn, "Text"));
    assert!(interaction.is_multi_turn_active());

    assert!(interaction.finish(InteractionMode::MultiTurn, "ASR"));
    assert!(!interaction.is_multi_turn_active());
    assert_eq!(interaction.holder(), None);
}
