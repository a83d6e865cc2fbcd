//! Orchestrator wiring: capabilities, events and teardown

mod common;

use common::FakeCapability;
use voice_orchestrator::{
    BlockingMedium, BlockingPolicy, Directive, EventRequest, FocusOutcome, FocusState,
    InteractionMode,
};

#[test]
fn events_carry_ids_context_and_referrer() {
    let (client, _, transport) = common::client();
    let asr = FakeCapability::new("ASR", &[]);
    let tts = FakeCapability::new("TTS", &[]);
    client.add_capability(asr.clone()).unwrap();
    client.add_capability(tts).unwrap();
    client.initialize().unwrap();

    client
        .handle_directive(Directive::new("ASR", "ExpectSpeech", "m1", "dlg-1").with_referrer("ref-0"))
        .unwrap();
    let receipt = asr.core.send_event(EventRequest::new("Recognize")).unwrap();
    asr.core
        .send_attachment_event(&receipt, 0, true, vec![1, 2, 3])
        .unwrap();

    let events = transport.events.lock().unwrap();
    let event = &events[0];
    assert_eq!(event.name, "Recognize");
    assert_eq!(event.message_id, receipt.message_id);
    assert_ne!(event.dialog_request_id, "dlg-1");
    assert_eq!(event.referrer_dialog_request_id.as_deref(), Some("ref-0"));
    assert_eq!(event.context["supportedInterfaces"]["TTS"]["version"], "1.0");
    assert_eq!(event.context["client"]["os"], "Linux");

    let attachments = transport.attachments.lock().unwrap();
    assert_eq!(attachments[0].parent_message_id, receipt.message_id);
    assert!(attachments[0].is_end);
}

#[test]
fn explicit_dialog_request_id_is_kept() {
    let (client, _, transport) = common::client();
    let asr = FakeCapability::new("ASR", &[]);
    client.add_capability(asr.clone()).unwrap();
    client.initialize().unwrap();

    let receipt = asr
        .core
        .send_event(EventRequest::new("Recognize").with_dialog_request_id("mine"))
        .unwrap();

    assert_eq!(receipt.dialog_request_id, "mine");
    assert_eq!(transport.events.lock().unwrap()[0].dialog_request_id, "mine");
    assert_eq!(client.registry().pending_event_count(), 1);

    client.on_event_send_result(&receipt.message_id, true, 200);
    client.on_event_response(&receipt.message_id, None, true);
    assert_eq!(client.registry().pending_event_count(), 0);
}

#[test]
fn late_capability_is_initialized_on_add() {
    let (client, _, _) = common::client();
    client.initialize().unwrap();
    let display = FakeCapability::new("Display", &[]);

    client.add_capability(display.clone()).unwrap();

    assert_eq!(display.log.entries(), vec!["initialize"]);
    assert!(client.registry().is_initialized("Display"));
}

#[test]
fn json_envelope_is_dispatched() {
    let (client, _, _) = common::client();
    let tts = FakeCapability::new(
        "TTS",
        &[("Speak", BlockingPolicy::new(BlockingMedium::Audio, true))],
    );
    client.add_capability(tts.clone()).unwrap();
    client.initialize().unwrap();

    client
        .handle_directive_json(
            r#"{"header": {"namespace": "TTS", "name": "Speak", "messageId": "m1", "dialogRequestId": "d1"}, "payload": {"text": "hi"}}"#,
        )
        .unwrap();

    let current = tts.core.current_directive().unwrap();
    assert_eq!(current.payload["text"], "hi");
    assert!(current.is_active());
    assert!(client.handle_directive_json("{").is_err());
}

#[test]
fn shutdown_releases_every_manager() {
    let (client, _, _) = common::client();
    let tts = FakeCapability::new(
        "TTS",
        &[("Speak", BlockingPolicy::new(BlockingMedium::Audio, true))],
    );
    client.add_capability(tts.clone()).unwrap();
    client.initialize().unwrap();
    client
        .handle_directive(Directive::new("TTS", "Speak", "m1", "dlg"))
        .unwrap();

    let helper = tts.helper();
    let focus_probe = common::FocusProbe::allowing();
    assert_eq!(
        helper
            .focus_manager()
            .request_focus("Info", "TTS", focus_probe.clone())
            .unwrap(),
        FocusOutcome::Foreground
    );
    helper
        .interaction_control_manager()
        .start(InteractionMode::MultiTurn, "TTS")
        .unwrap();

    client.shutdown();

    assert_eq!(
        tts.log.take(),
        vec![
            "initialize",
            "receive_directive_group=TTS.Speak",
            "directive_dialog_id=dlg",
            "process:m1",
            "de_initialize",
            "cancel:m1",
        ]
    );
    assert_eq!(client.focus_manager().state("Info", "TTS"), FocusState::None);
    assert!(!client.interaction_control_manager().is_multi_turn_active());
    assert!(client.registry().is_empty());
}

#[test]
fn disconnect_fails_every_outstanding_event() {
    let (client, _, _) = common::client();
    let asr = FakeCapability::new("ASR", &[]);
    client.add_capability(asr.clone()).unwrap();
    client.initialize().unwrap();
    let sent = asr.core.send_event(EventRequest::new("Recognize")).unwrap();
    let unsent = asr.core.send_event(EventRequest::new("StopRecognize")).unwrap();
    client.on_event_send_result(&sent.message_id, true, 200);
    asr.log.take();

    client.on_network_disconnected();

    assert_eq!(client.registry().pending_event_count(), 0);
    let log = asr.log.take();
    assert_eq!(log.len(), 3);
    assert!(log.contains(&format!("result:{}:false", sent.message_id)));
    assert!(log.contains(&format!("result:{}:false", unsent.message_id)));
    assert_eq!(log[2], "network_disconnected=");

    client.on_network_disconnected();
    assert_eq!(asr.log.take(), vec!["network_disconnected="]);
}

#[test]
fn late_capability_ignores_an_earlier_broken_one() {
    let (client, _, _) = common::client();
    let broken = FakeCapability::failing("Broken");
    client.add_capability(broken.clone()).unwrap();
    assert!(client.initialize().is_err());

    let tts = FakeCapability::new("TTS", &[]);
    client.add_capability(tts.clone()).unwrap();

    assert!(client.registry().is_initialized("TTS"));
    assert!(!client.registry().is_initialized("Broken"));
    assert!(client.registry().find("Broken").is_some());
    assert_eq!(broken.log.entries(), vec!["initialize failed"]);
}

#[test]
fn late_capability_that_fails_to_initialize_is_rolled_back() {
    let (client, _, _) = common::client();
    client.initialize().unwrap();

    let display = FakeCapability::failing("Display");
    assert!(client.add_capability(display).is_err());

    assert!(client.registry().find("Display").is_none());
    assert!(client.handle_directive(Directive::new("Display", "Card", "m1", "dlg")).is_err());
}
