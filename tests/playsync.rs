//! Play-sync lifecycle across capabilities

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::PlaySyncProbe;
use voice_orchestrator::{
    Directive, InteractionControlListener, InteractionControlManager, ManualTimer,
    PlayStackHoldTime, PlayStackLayer, PlaySyncManager, PlaySyncState,
};

fn setup() -> (PlaySyncManager, Arc<ManualTimer>, Arc<PlaySyncProbe>, Arc<PlaySyncProbe>) {
    let timer = Arc::new(ManualTimer::new());
    let psm = PlaySyncManager::new(timer.clone(), PlayStackHoldTime::default());
    let player = Arc::new(PlaySyncProbe::default());
    let display = Arc::new(PlaySyncProbe::default());
    psm.add_listener("AudioPlayer", player.clone());
    psm.add_listener("Display", display.clone());
    (psm, timer, player, display)
}

fn media_directive(ps_id: &str) -> Directive {
    Directive::new("AudioPlayer", "Play", format!("{ps_id}-play"), "dlg")
        .with_groups(["AudioPlayer.Play", "Display.Template"])
}

#[test]
fn two_participants_sync_and_postponed_release_outlives_default_hold() {
    let (psm, timer, player, display) = setup();
    psm.prepare_sync("ps-1", &media_directive("ps-1")).unwrap();
    assert!(psm.has_layer("ps-1", PlayStackLayer::Media));

    psm.start_sync("ps-1", "AudioPlayer", None).unwrap();
    assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);
    psm.start_sync("ps-1", "Display", None).unwrap();
    assert_eq!(psm.state("ps-1"), PlaySyncState::Synced);

    psm.release_sync_later("ps-1", "Display").unwrap();
    psm.post_pone_release();
    timer.advance(psm.hold_time().long + Duration::from_secs(1));
    assert_eq!(psm.state("ps-1"), PlaySyncState::Synced);
    assert!(psm.has_post_pone_release());

    psm.continue_release();

    assert_eq!(psm.state("ps-1"), PlaySyncState::None);
    assert!(psm.get_all_play_stack_items().is_empty());
    assert_eq!(
        player.log.take(),
        vec!["ps-1:Prepared", "ps-1:Synced", "ps-1:Released", "ps-1:removed"]
    );
    assert!(display.log.take().contains(&"ps-1:Released".to_string()));
}

#[test]
fn default_release_fires_after_hold_time() {
    let (psm, timer, player, _) = setup();
    psm.prepare_sync("ps-1", &media_directive("ps-1")).unwrap();
    psm.start_sync("ps-1", "AudioPlayer", None).unwrap();
    psm.start_sync("ps-1", "Display", None).unwrap();

    psm.release_sync("ps-1", "AudioPlayer").unwrap();
    timer.advance(psm.hold_time().default - Duration::from_millis(1));
    assert_eq!(psm.state("ps-1"), PlaySyncState::Synced);
    timer.advance(Duration::from_millis(1));

    assert_eq!(psm.state("ps-1"), PlaySyncState::None);
    assert!(player.log.entries().contains(&"ps-1:Released".to_string()));
}

#[test]
fn released_entry_needs_fresh_prepare() {
    let (psm, _, _, _) = setup();
    psm.prepare_sync("ps-1", &media_directive("ps-1")).unwrap();
    psm.release_sync_immediately("ps-1", "AudioPlayer").unwrap();

    assert!(psm.start_sync("ps-1", "AudioPlayer", None).is_err());

    psm.prepare_sync("ps-1", &media_directive("ps-1")).unwrap();
    assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);
}

#[test]
fn postponed_release_does_not_outlive_a_cancelled_entry() {
    let (psm, _, _, _) = setup();
    let speak = Directive::new("TTS", "Speak", "s1", "dlg").with_groups(["TTS.Speak"]);
    psm.prepare_sync("ps-2", &speak).unwrap();
    psm.release_sync("ps-2", "TTS").unwrap();
    psm.post_pone_release();
    psm.cancel_sync("ps-2", "TTS").unwrap();
    assert_eq!(psm.state("ps-2"), PlaySyncState::None);

    psm.prepare_sync("ps-2", &speak).unwrap();
    psm.start_sync("ps-2", "TTS", None).unwrap();
    psm.continue_release();

    assert_eq!(psm.state("ps-2"), PlaySyncState::Synced);
    assert_eq!(psm.get_all_play_stack_items(), vec!["ps-2"]);
}

#[test]
fn info_stacks_on_media() {
    let (psm, _, _, _) = setup();
    psm.prepare_sync("media", &media_directive("media")).unwrap();

    let info = Directive::new("Display", "Template", "i1", "dlg-2")
        .with_groups(["TTS.Speak", "Display.Template"]);
    psm.prepare_sync("info", &info).unwrap();

    assert_eq!(psm.get_all_play_stack_items(), vec!["info", "media"]);
    assert!(psm.has_activity(PlayStackLayer::Media));
    assert!(psm.has_activity(PlayStackLayer::Info));
}

#[derive(Default)]
struct MultiTurnProbe {
    log: common::Log,
}

impl InteractionControlListener for MultiTurnProbe {
    fn on_mode_changed(&self, is_multi_turn: bool) {
        self.log.push(format!("mode:{is_multi_turn}"));
    }

    fn on_has_multi_turn(&self) {
        self.log.push("has_multi_turn");
    }
}

#[test]
fn expect_speech_response_signals_multi_turn() {
    let (psm, _, _, _) = setup();
    let interaction = InteractionControlManager::new();
    let probe = Arc::new(MultiTurnProbe::default());
    interaction.add_listener(probe.clone());
    psm.set_interaction_control_manager(interaction);

    let directive = Directive::new("TTS", "Speak", "s1", "dlg")
        .with_groups(["TTS.Speak", "ASR.ExpectSpeech"]);
    psm.prepare_sync("ps-1", &directive).unwrap();

    assert_eq!(probe.log.entries(), vec!["has_multi_turn"]);
}
