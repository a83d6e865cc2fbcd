//! Focus arbitration scenarios

mod common;

use common::FocusProbe;
use voice_orchestrator::{
    Error, FocusConfiguration, FocusManager, FocusOutcome, FocusState, RejectPolicy,
};

fn manager(policy: RejectPolicy) -> FocusManager {
    FocusManager::new(
        vec![
            FocusConfiguration::new("ASR", 1),
            FocusConfiguration::new("MEDIA", 5),
        ],
        policy,
    )
}

#[test]
fn asr_steals_media_when_allowed() {
    let focus = manager(RejectPolicy::Deny);
    let media = FocusProbe::allowing();
    let asr = FocusProbe::allowing();
    assert_eq!(
        focus.request_focus("MEDIA", "player", media.clone()).unwrap(),
        FocusOutcome::Foreground
    );

    let outcome = focus.request_focus("ASR", "recognizer", asr.clone()).unwrap();

    assert_eq!(outcome, FocusOutcome::Foreground);
    assert_eq!(media.log.entries(), vec!["FOREGROUND", "steal:ASR", "BACKGROUND"]);
    assert_eq!(focus.state("MEDIA", "player"), FocusState::Background);
    assert_eq!(
        focus.foreground(),
        Some(("ASR".to_string(), "recognizer".to_string()))
    );
}

#[test]
fn asr_is_denied_when_media_rejects() {
    let focus = manager(RejectPolicy::Deny);
    let media = FocusProbe::rejecting();
    let asr = FocusProbe::allowing();
    focus.request_focus("MEDIA", "player", media.clone()).unwrap();

    let outcome = focus.request_focus("ASR", "recognizer", asr.clone()).unwrap();

    assert_eq!(outcome, FocusOutcome::Denied);
    assert_eq!(focus.state("MEDIA", "player"), FocusState::Foreground);
    assert_eq!(focus.state("ASR", "recognizer"), FocusState::None);
    assert!(asr.log.entries().is_empty());
}

#[test]
fn rejected_requester_waits_in_background_under_background_policy() {
    let focus = manager(RejectPolicy::Background);
    let media = FocusProbe::rejecting();
    let asr = FocusProbe::allowing();
    focus.request_focus("MEDIA", "player", media).unwrap();

    let outcome = focus.request_focus("ASR", "recognizer", asr.clone()).unwrap();
    assert_eq!(outcome, FocusOutcome::Background);

    focus.release_focus("MEDIA", "player").unwrap();

    assert_eq!(focus.state("ASR", "recognizer"), FocusState::Foreground);
    assert_eq!(asr.log.entries(), vec!["BACKGROUND", "FOREGROUND"]);
}

#[test]
fn held_incumbent_is_never_asked() {
    let focus = manager(RejectPolicy::Deny);
    let media = FocusProbe::allowing();
    focus.request_focus("MEDIA", "player", media.clone()).unwrap();
    focus.hold_focus("MEDIA").unwrap();

    let outcome = focus
        .request_focus("ASR", "recognizer", FocusProbe::allowing())
        .unwrap();

    assert_eq!(outcome, FocusOutcome::Denied);
    assert_eq!(media.log.entries(), vec!["FOREGROUND"]);
}

#[test]
fn pinned_type_is_not_taken_by_another_name() {
    for policy in [RejectPolicy::Deny, RejectPolicy::Background] {
        let focus = manager(policy);
        let alarm = FocusProbe::allowing();
        focus.request_focus("MEDIA", "alarm", alarm.clone()).unwrap();
        focus.hold_focus("MEDIA").unwrap();

        let outcome = focus
            .request_focus("MEDIA", "alarm2", FocusProbe::allowing())
            .unwrap();

        assert_eq!(outcome, FocusOutcome::Denied);
        assert_eq!(focus.state("MEDIA", "alarm"), FocusState::Foreground);
        assert_eq!(focus.state("MEDIA", "alarm2"), FocusState::None);
        assert_eq!(alarm.log.entries(), vec!["FOREGROUND"]);
        assert!(focus.is_held("MEDIA"));
    }
}

#[test]
fn unconfigured_type_is_an_error_and_stray_release_is_noop() {
    let focus = manager(RejectPolicy::Deny);

    assert!(matches!(
        focus.request_focus("CAMERA", "cam", FocusProbe::allowing()),
        Err(Error::FocusUnconfigured(_))
    ));
    assert!(!focus.release_focus("ASR", "nobody").unwrap());
}
