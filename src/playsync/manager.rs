//! Play-sync registry, play stack and release timer

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;

use super::{
    PlayStackHoldTime, PlayStackLayer, PlaySyncListener, PlaySyncState, default_sync_capabilities,
    expects_speech,
};
use crate::directive::Directive;
use crate::interaction::InteractionControlManager;
use crate::timer::{Timer, TimerId};
use crate::{Error, Result};

struct Participant {
    requester: String,
    state: PlaySyncState,
    extra: Option<Value>,
}

struct Entry {
    layer: PlayStackLayer,
    state: PlaySyncState,
    participants: Vec<Participant>,
    holding: bool,
}

impl Entry {
    fn participant_mut(&mut self, requester: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.requester == requester)
    }

    fn all_synced(&self) -> bool {
        !self.participants.is_empty()
            && self
                .participants
                .iter()
                .all(|p| p.state == PlaySyncState::Synced)
    }
}

/// Armed release; `generation` discards a callback that lost a race with cancel
struct ArmedRelease {
    ps_id: String,
    timer: TimerId,
    delay: Duration,
    generation: u64,
}

enum Notice {
    Sync {
        ps_id: String,
        requester: String,
        state: PlaySyncState,
        extra: Option<Value>,
    },
    DataChanged {
        ps_id: String,
        requester: String,
        previous: Option<Value>,
        current: Value,
    },
    StackAdded(String),
    StackRemoved(String),
}

#[derive(Clone, Copy)]
enum ReleaseDelay {
    Default,
    Long,
}

#[derive(Default)]
struct PlaySyncTable {
    entries: HashMap<String, Entry>,
    /// Play service ids, oldest first
    stack: Vec<String>,
    listeners: Vec<(String, Arc<dyn PlaySyncListener>)>,
    sync_capabilities: Vec<String>,
    hold_time: PlayStackHoldTime,
    armed: Option<ArmedRelease>,
    generation: u64,
    postponed: bool,
    /// Release requested while postponed
    pending_release: Option<String>,
    /// Release paused by `stop_holding`
    held_release: Option<(String, Duration)>,
    has_next: bool,
    interaction: Option<InteractionControlManager>,
}

impl PlaySyncTable {
    fn has_media_other_than(&self, ps_id: &str) -> bool {
        self.entries
            .iter()
            .any(|(id, e)| id != ps_id && e.layer == PlayStackLayer::Media)
    }

    fn disarm(&mut self, timer: &dyn Timer) {
        if let Some(armed) = self.armed.take() {
            timer.cancel(armed.timer);
        }
    }

    /// Drop any armed, postponed or held release aimed at `ps_id`
    fn forget_release(&mut self, ps_id: &str, timer: &dyn Timer) {
        if self.armed.as_ref().is_some_and(|a| a.ps_id == ps_id) {
            self.disarm(timer);
        }
        if self.pending_release.as_deref() == Some(ps_id) {
            self.pending_release = None;
        }
        if self.held_release.as_ref().is_some_and(|(id, _)| id == ps_id) {
            self.held_release = None;
        }
    }

    fn release_entry(&mut self, ps_id: &str, timer: &dyn Timer, notices: &mut Vec<Notice>) {
        let Some(entry) = self.entries.remove(ps_id) else {
            return;
        };
        self.stack.retain(|id| id != ps_id);

        if entry.holding {
            tracing::error!(ps_id, "play-sync entry released while holding");
        }
        self.forget_release(ps_id, timer);

        tracing::debug!(ps_id, layer = %entry.layer, "play-sync released");
        for participant in entry.participants {
            notices.push(Notice::Sync {
                ps_id: ps_id.to_string(),
                requester: participant.requester,
                state: PlaySyncState::Released,
                extra: participant.extra,
            });
        }
        notices.push(Notice::StackRemoved(ps_id.to_string()));
    }

    fn release_all(&mut self, timer: &dyn Timer, notices: &mut Vec<Notice>) {
        for ps_id in self.stack.clone().into_iter().rev() {
            self.release_entry(&ps_id, timer, notices);
        }
    }

    fn synced_notices(ps_id: &str, entry: &Entry, notices: &mut Vec<Notice>) {
        for participant in &entry.participants {
            notices.push(Notice::Sync {
                ps_id: ps_id.to_string(),
                requester: participant.requester.clone(),
                state: PlaySyncState::Synced,
                extra: participant.extra.clone(),
            });
        }
    }
}

struct Shared {
    table: Mutex<PlaySyncTable>,
    timer: Arc<dyn Timer>,
}

/// Synchronizes rendering lifecycles across capabilities
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct PlaySyncManager {
    inner: Arc<Shared>,
}

impl PlaySyncManager {
    /// Create a manager with the default sync capabilities
    #[must_use]
    pub fn new(timer: Arc<dyn Timer>, hold_time: PlayStackHoldTime) -> Self {
        Self::with_capabilities(timer, hold_time, default_sync_capabilities())
    }

    /// Create a manager with an explicit set of sync capabilities
    #[must_use]
    pub fn with_capabilities(
        timer: Arc<dyn Timer>,
        hold_time: PlayStackHoldTime,
        sync_capabilities: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                table: Mutex::new(PlaySyncTable {
                    hold_time,
                    sync_capabilities,
                    ..PlaySyncTable::default()
                }),
                timer,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaySyncTable> {
        lock_table(&self.inner)
    }

    fn timer(&self) -> &dyn Timer {
        self.inner.timer.as_ref()
    }

    fn deliver(&self, notices: Vec<Notice>) {
        deliver(&self.inner, notices);
    }

    /// Attach the interaction-control manager notified of expect-speech responses
    pub fn set_interaction_control_manager(&self, manager: InteractionControlManager) {
        self.lock().interaction = Some(manager);
    }

    /// Let another capability take part in play-sync
    pub fn register_capability_for_sync(&self, name: &str) {
        let mut table = self.lock();
        if !table.sync_capabilities.iter().any(|c| c == name) {
            table.sync_capabilities.push(name.to_string());
        }
    }

    #[must_use]
    pub fn sync_capabilities(&self) -> Vec<String> {
        self.lock().sync_capabilities.clone()
    }

    #[must_use]
    pub fn hold_time(&self) -> PlayStackHoldTime {
        self.lock().hold_time
    }

    /// Register the listener for a requester
    ///
    /// Empty names and already registered requesters are ignored.
    pub fn add_listener(&self, requester: &str, listener: Arc<dyn PlaySyncListener>) {
        if requester.is_empty() {
            tracing::warn!("play-sync listener ignored, empty requester");
            return;
        }
        let mut table = self.lock();
        if table.listeners.iter().any(|(name, _)| name == requester) {
            tracing::debug!(requester, "play-sync listener already registered");
            return;
        }
        table.listeners.push((requester.to_string(), listener));
    }

    pub fn remove_listener(&self, requester: &str) {
        self.lock().listeners.retain(|(name, _)| name != requester);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Register interest in a directive's play service before content is ready
    ///
    /// The layer comes from the directive's groups and the participants are
    /// the group namespaces registered for sync. A directive with no sync
    /// participant is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `ps_id` is empty
    pub fn prepare_sync(&self, ps_id: &str, directive: &Directive) -> Result<()> {
        let participants: Vec<String> = {
            let table = self.lock();
            let mut names: Vec<String> = Vec::new();
            for namespace in directive.group_namespaces() {
                if table.sync_capabilities.iter().any(|c| c == namespace)
                    && !names.iter().any(|n| n == namespace)
                {
                    names.push(namespace.to_string());
                }
            }
            names
        };

        if expects_speech(directive) {
            let interaction = self.lock().interaction.clone();
            if let Some(interaction) = interaction {
                interaction.notify_has_multi_turn();
            }
        }

        if participants.is_empty() {
            if ps_id.is_empty() {
                return Err(Error::InvalidArgument("empty play service id".to_string()));
            }
            tracing::debug!(ps_id, "no play-sync participants in directive groups");
            return Ok(());
        }

        let layer = PlayStackLayer::from_groups(&directive.groups);
        self.prepare_sync_with(ps_id, layer, &participants)
    }

    /// Register interest for explicit requesters on a layer
    ///
    /// Preparing an existing entry appends new requesters; they start as
    /// [`PlaySyncState::Appending`] if the entry already synced. Requesters
    /// already taking part keep their state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `ps_id` or the requester list is
    /// empty
    pub fn prepare_sync_with(
        &self,
        ps_id: &str,
        layer: PlayStackLayer,
        requesters: &[String],
    ) -> Result<()> {
        if ps_id.is_empty() {
            return Err(Error::InvalidArgument("empty play service id".to_string()));
        }
        if requesters.is_empty() || requesters.iter().any(String::is_empty) {
            return Err(Error::InvalidArgument(format!(
                "play-sync {ps_id} needs named requesters"
            )));
        }

        let mut released = Vec::new();
        let mut notices = Vec::new();
        let replaced_stack = {
            let mut table = self.lock();
            let timer = self.inner.timer.as_ref();

            if table.entries.contains_key(ps_id) {
                if table.armed.as_ref().is_some_and(|a| a.ps_id == ps_id) {
                    table.disarm(timer);
                }
                if table.pending_release.as_deref() == Some(ps_id) {
                    table.pending_release = None;
                }
                if let Some(entry) = table.entries.get_mut(ps_id) {
                    let initial = if entry.state == PlaySyncState::Synced {
                        PlaySyncState::Appending
                    } else {
                        PlaySyncState::Prepared
                    };
                    for requester in requesters {
                        if entry.participant_mut(requester).is_some() {
                            continue;
                        }
                        entry.participants.push(Participant {
                            requester: requester.clone(),
                            state: initial,
                            extra: None,
                        });
                        notices.push(Notice::Sync {
                            ps_id: ps_id.to_string(),
                            requester: requester.clone(),
                            state: initial,
                            extra: None,
                        });
                    }
                }
                false
            } else {
                let stacked = layer != PlayStackLayer::Media && table.has_media_other_than(ps_id);
                let doomed: Vec<String> = table
                    .stack
                    .iter()
                    .filter(|id| {
                        !stacked
                            || table
                                .entries
                                .get(*id)
                                .is_some_and(|e| e.layer != PlayStackLayer::Media)
                    })
                    .cloned()
                    .collect();
                if !doomed.is_empty() {
                    table.has_next = true;
                    for id in doomed.iter().rev() {
                        table.release_entry(id, timer, &mut released);
                    }
                }

                table.forget_release(ps_id, timer);
                table.entries.insert(
                    ps_id.to_string(),
                    Entry {
                        layer,
                        state: PlaySyncState::Prepared,
                        participants: requesters
                            .iter()
                            .map(|r| Participant {
                                requester: r.clone(),
                                state: PlaySyncState::Prepared,
                                extra: None,
                            })
                            .collect(),
                        holding: false,
                    },
                );
                table.stack.push(ps_id.to_string());
                tracing::debug!(ps_id, %layer, stacked, "play-sync prepared");

                notices.push(Notice::StackAdded(ps_id.to_string()));
                for requester in requesters {
                    notices.push(Notice::Sync {
                        ps_id: ps_id.to_string(),
                        requester: requester.clone(),
                        state: PlaySyncState::Prepared,
                        extra: None,
                    });
                }
                !doomed.is_empty()
            }
        };

        if replaced_stack {
            self.deliver(released);
            self.lock().has_next = false;
        }
        self.deliver(notices);
        Ok(())
    }

    /// Mark a requester's content ready
    ///
    /// The entry syncs once every participant has started; each participant
    /// then receives [`PlaySyncState::Synced`] with its own extra data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for empty arguments and
    /// [`Error::NotPrepared`] if the entry or requester was never prepared
    pub fn start_sync(&self, ps_id: &str, requester: &str, extra: Option<Value>) -> Result<()> {
        if ps_id.is_empty() || requester.is_empty() {
            return Err(Error::InvalidArgument(
                "start_sync needs play service id and requester".to_string(),
            ));
        }

        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            let entry = table
                .entries
                .get_mut(ps_id)
                .ok_or_else(|| Error::NotPrepared(ps_id.to_string()))?;
            let participant = entry
                .participant_mut(requester)
                .ok_or_else(|| Error::NotPrepared(format!("{requester} in {ps_id}")))?;

            match participant.state {
                PlaySyncState::Prepared => {
                    participant.state = PlaySyncState::Synced;
                    participant.extra = extra;
                    if entry.state != PlaySyncState::Synced && entry.all_synced() {
                        entry.state = PlaySyncState::Synced;
                        tracing::debug!(ps_id, "play-sync synced");
                        PlaySyncTable::synced_notices(ps_id, entry, &mut notices);
                    }
                }
                PlaySyncState::Appending => {
                    participant.state = PlaySyncState::Synced;
                    participant.extra = extra;
                    notices.push(Notice::Sync {
                        ps_id: ps_id.to_string(),
                        requester: requester.to_string(),
                        state: PlaySyncState::Synced,
                        extra: participant.extra.clone(),
                    });
                }
                PlaySyncState::Synced => {
                    if let Some(current) = extra {
                        let previous = participant.extra.replace(current.clone());
                        notices.push(Notice::DataChanged {
                            ps_id: ps_id.to_string(),
                            requester: requester.to_string(),
                            previous,
                            current,
                        });
                    }
                }
                PlaySyncState::None | PlaySyncState::Released => {
                    return Err(Error::NotPrepared(format!("{requester} in {ps_id}")));
                }
            }
        }
        self.deliver(notices);
        Ok(())
    }

    /// Withdraw a requester before it started
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncAlreadyStarted`] if the requester already synced
    /// and [`Error::NotPrepared`] if it never took part
    pub fn cancel_sync(&self, ps_id: &str, requester: &str) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            let entry = table
                .entries
                .get_mut(ps_id)
                .ok_or_else(|| Error::NotPrepared(ps_id.to_string()))?;
            let position = entry
                .participants
                .iter()
                .position(|p| p.requester == requester)
                .ok_or_else(|| Error::NotPrepared(format!("{requester} in {ps_id}")))?;

            if entry.participants[position].state == PlaySyncState::Synced {
                return Err(Error::SyncAlreadyStarted(format!("{requester} in {ps_id}")));
            }
            entry.participants.remove(position);
            tracing::debug!(ps_id, requester, "play-sync participant cancelled");

            if entry.participants.is_empty() {
                table.entries.remove(ps_id);
                table.stack.retain(|id| id != ps_id);
                table.forget_release(ps_id, self.inner.timer.as_ref());
                notices.push(Notice::StackRemoved(ps_id.to_string()));
            } else if entry.state != PlaySyncState::Synced && entry.all_synced() {
                entry.state = PlaySyncState::Synced;
                PlaySyncTable::synced_notices(ps_id, entry, &mut notices);
            }
        }
        self.deliver(notices);
        Ok(())
    }

    /// Release after the default hold time
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPrepared`] if the requester does not take part
    pub fn release_sync(&self, ps_id: &str, requester: &str) -> Result<()> {
        self.request_release(ps_id, requester, ReleaseDelay::Default)
    }

    /// Release after the long hold time
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPrepared`] if the requester does not take part
    pub fn release_sync_later(&self, ps_id: &str, requester: &str) -> Result<()> {
        self.request_release(ps_id, requester, ReleaseDelay::Long)
    }

    /// Release now, bypassing timers and postponement
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPrepared`] if the requester does not take part
    pub fn release_sync_immediately(&self, ps_id: &str, requester: &str) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            check_participant(&mut table, ps_id, requester)?;
            table.release_entry(ps_id, self.timer(), &mut notices);
        }
        self.deliver(notices);
        Ok(())
    }

    fn request_release(&self, ps_id: &str, requester: &str, delay: ReleaseDelay) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            let layer = check_participant(&mut table, ps_id, requester)?;

            if table.postponed {
                table.disarm(self.timer());
                table.pending_release = Some(ps_id.to_string());
                tracing::debug!(ps_id, "release recorded while postponed");
            } else if layer != PlayStackLayer::Media && table.has_media_other_than(ps_id) {
                // Stacked entry gives the media underneath its turn back
                table.release_entry(ps_id, self.timer(), &mut notices);
            } else {
                let delay = match delay {
                    ReleaseDelay::Default => table.hold_time.default,
                    ReleaseDelay::Long => table.hold_time.long,
                };
                arm(&self.inner, &mut table, ps_id, delay);
            }
        }
        self.deliver(notices);
        Ok(())
    }

    /// Defer any release until [`Self::continue_release`]
    pub fn post_pone_release(&self) {
        let mut table = self.lock();
        table.postponed = true;
        if let Some(armed) = table.armed.take() {
            self.timer().cancel(armed.timer);
            table.pending_release = Some(armed.ps_id);
        }
        tracing::debug!("play-sync release postponed");
    }

    /// Lift postponement and perform any release recorded meanwhile
    pub fn continue_release(&self) {
        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            table.postponed = false;
            if let Some(ps_id) = table.pending_release.take() {
                table.release_entry(&ps_id, self.timer(), &mut notices);
            }
        }
        self.deliver(notices);
    }

    #[must_use]
    pub fn has_post_pone_release(&self) -> bool {
        self.lock().postponed
    }

    /// Pause the armed release and mark its entry holding
    pub fn stop_holding(&self) {
        let mut table = self.lock();
        let Some(armed) = table.armed.take() else {
            return;
        };
        self.timer().cancel(armed.timer);
        if let Some(entry) = table.entries.get_mut(&armed.ps_id) {
            entry.holding = true;
        }
        tracing::debug!(ps_id = %armed.ps_id, "play-sync holding");
        table.held_release = Some((armed.ps_id, armed.delay));
    }

    /// Re-arm a release paused by [`Self::stop_holding`]
    pub fn reset_holding(&self) {
        let mut table = self.lock();
        let Some((ps_id, delay)) = table.held_release.take() else {
            return;
        };
        if let Some(entry) = table.entries.get_mut(&ps_id) {
            entry.holding = false;
            arm(&self.inner, &mut table, &ps_id, delay);
        }
    }

    /// Drop timers, holding and postponement without releasing anything
    pub fn clear_holding(&self) {
        let mut table = self.lock();
        table.disarm(self.timer());
        table.held_release = None;
        table.pending_release = None;
        table.postponed = false;
        for entry in table.entries.values_mut() {
            entry.holding = false;
        }
    }

    /// Whether an entry is marked holding
    #[must_use]
    pub fn is_holding(&self, ps_id: &str) -> bool {
        self.lock().entries.get(ps_id).is_some_and(|e| e.holding)
    }

    /// Release every entry now
    pub fn release_sync_unconditionally(&self) {
        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            table.release_all(self.timer(), &mut notices);
            table.disarm(self.timer());
        }
        self.deliver(notices);
    }

    /// Release everything and drop postponement and holding
    pub fn clear(&self) {
        self.release_sync_unconditionally();
        self.clear_holding();
    }

    /// Drop all state without notifications; listeners are kept
    pub fn reset(&self) {
        let mut table = self.lock();
        table.disarm(self.timer());
        table.entries.clear();
        table.stack.clear();
        table.held_release = None;
        table.pending_release = None;
        table.postponed = false;
        table.has_next = false;
    }

    /// Whether an entry exists on the given layer
    #[must_use]
    pub fn has_layer(&self, ps_id: &str, layer: PlayStackLayer) -> bool {
        self.lock().entries.get(ps_id).is_some_and(|e| e.layer == layer)
    }

    /// Whether any entry occupies the given layer
    #[must_use]
    pub fn has_activity(&self, layer: PlayStackLayer) -> bool {
        self.lock().entries.values().any(|e| e.layer == layer)
    }

    /// Layer of an entry, `None` when absent
    #[must_use]
    pub fn play_stack_layer(&self, ps_id: &str) -> PlayStackLayer {
        self.lock()
            .entries
            .get(ps_id)
            .map_or(PlayStackLayer::None, |e| e.layer)
    }

    /// True while older entries are being released for a new one
    #[must_use]
    pub fn has_next_play_stack(&self) -> bool {
        self.lock().has_next
    }

    /// Play service ids on the stack, newest first
    #[must_use]
    pub fn get_all_play_stack_items(&self) -> Vec<String> {
        self.lock().stack.iter().rev().cloned().collect()
    }

    /// Entry state, `None` when absent
    #[must_use]
    pub fn state(&self, ps_id: &str) -> PlaySyncState {
        self.lock()
            .entries
            .get(ps_id)
            .map_or(PlaySyncState::None, |e| e.state)
    }

    /// Participant state, `None` when absent
    #[must_use]
    pub fn participant_state(&self, ps_id: &str, requester: &str) -> PlaySyncState {
        self.lock()
            .entries
            .get(ps_id)
            .and_then(|e| e.participants.iter().find(|p| p.requester == requester))
            .map_or(PlaySyncState::None, |p| p.state)
    }

    /// Whether the previous dialog should keep running under the current one
    ///
    /// Media keeps playing beneath a new response unless that response opens
    /// a follow-up turn.
    #[must_use]
    pub fn is_condition_to_handle_prev_dialog(&self, prev: &Directive, cur: &Directive) -> bool {
        PlayStackLayer::from_groups(&prev.groups) == PlayStackLayer::Media && !expects_speech(cur)
    }
}

impl std::fmt::Debug for PlaySyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("PlaySyncManager")
            .field("stack", &table.stack)
            .field("postponed", &table.postponed)
            .finish_non_exhaustive()
    }
}

fn lock_table(shared: &Shared) -> MutexGuard<'_, PlaySyncTable> {
    shared.table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_participant(
    table: &mut PlaySyncTable,
    ps_id: &str,
    requester: &str,
) -> Result<PlayStackLayer> {
    let entry = table
        .entries
        .get_mut(ps_id)
        .ok_or_else(|| Error::NotPrepared(ps_id.to_string()))?;
    if entry.participant_mut(requester).is_none() {
        return Err(Error::NotPrepared(format!("{requester} in {ps_id}")));
    }
    Ok(entry.layer)
}

/// Arm the single release timer, replacing any earlier one
fn arm(shared: &Arc<Shared>, table: &mut PlaySyncTable, ps_id: &str, delay: Duration) {
    table.disarm(shared.timer.as_ref());
    table.generation += 1;
    let generation = table.generation;
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let id = ps_id.to_string();
    let timer = shared.timer.schedule(
        delay,
        Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                on_release_timer(&shared, &id, generation);
            }
        }),
    );
    tracing::debug!(ps_id, delay_ms = delay.as_millis(), "play-sync release armed");
    table.armed = Some(ArmedRelease {
        ps_id: ps_id.to_string(),
        timer,
        delay,
        generation,
    });
}

fn on_release_timer(shared: &Shared, ps_id: &str, generation: u64) {
    let mut notices = Vec::new();
    {
        let mut table = lock_table(shared);
        if table.armed.as_ref().is_none_or(|a| a.generation != generation) {
            return;
        }
        table.armed = None;
        table.release_entry(ps_id, shared.timer.as_ref(), &mut notices);
    }
    deliver(shared, notices);
}

fn deliver(shared: &Shared, notices: Vec<Notice>) {
    if notices.is_empty() {
        return;
    }
    let listeners = lock_table(shared).listeners.clone();
    let find = |requester: &str| {
        listeners
            .iter()
            .find(|(name, _)| name == requester)
            .map(|(_, l)| Arc::clone(l))
    };

    for notice in notices {
        match notice {
            Notice::Sync {
                ps_id,
                requester,
                state,
                extra,
            } => {
                if let Some(listener) = find(&requester) {
                    listener.on_sync_state(&ps_id, state, extra.as_ref());
                }
            }
            Notice::DataChanged {
                ps_id,
                requester,
                previous,
                current,
            } => {
                if let Some(listener) = find(&requester) {
                    listener.on_data_changed(&ps_id, previous.as_ref(), &current);
                }
            }
            Notice::StackAdded(ps_id) => {
                for (_, listener) in &listeners {
                    listener.on_stack_added(&ps_id);
                }
            }
            Notice::StackRemoved(ps_id) => {
                for (_, listener) in &listeners {
                    listener.on_stack_removed(&ps_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::timer::ManualTimer;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl PlaySyncListener for Recorder {
        fn on_sync_state(&self, ps_id: &str, state: PlaySyncState, _: Option<&Value>) {
            self.events.lock().unwrap().push(format!("{ps_id}:{state}"));
        }

        fn on_data_changed(&self, ps_id: &str, _: Option<&Value>, current: &Value) {
            self.events.lock().unwrap().push(format!("{ps_id}:data:{current}"));
        }

        fn on_stack_removed(&self, ps_id: &str) {
            self.events.lock().unwrap().push(format!("{ps_id}:removed"));
        }
    }

    fn setup() -> (PlaySyncManager, Arc<ManualTimer>, Arc<Recorder>, Arc<Recorder>) {
        let timer = Arc::new(ManualTimer::new());
        let psm = PlaySyncManager::new(timer.clone(), PlayStackHoldTime::default());
        let tts = Arc::new(Recorder::default());
        let display = Arc::new(Recorder::default());
        psm.add_listener("TTS", tts.clone());
        psm.add_listener("Display", display.clone());
        (psm, timer, tts, display)
    }

    fn both() -> Vec<String> {
        vec!["TTS".to_string(), "Display".to_string()]
    }

    #[test]
    fn start_without_prepare_is_rejected() {
        let (psm, _, _, _) = setup();
        let err = psm.start_sync("ps-1", "TTS", None).unwrap_err();
        assert!(matches!(err, Error::NotPrepared(_)));
        assert!(psm.start_sync("", "TTS", None).is_err());
    }

    #[test]
    fn entry_syncs_only_after_every_participant_started() {
        let (psm, _, tts, display) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        assert_eq!(tts.take(), vec!["ps-1:Prepared"]);

        psm.start_sync("ps-1", "TTS", None).unwrap();
        assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);
        assert!(tts.take().is_empty());

        psm.start_sync("ps-1", "Display", Some(json!({"token": "t"}))).unwrap();
        assert_eq!(psm.state("ps-1"), PlaySyncState::Synced);
        assert_eq!(tts.take(), vec!["ps-1:Synced"]);
        assert_eq!(display.take(), vec!["ps-1:Prepared", "ps-1:Synced"]);
    }

    #[test]
    fn cancel_after_start_is_an_error() {
        let (psm, _, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        psm.start_sync("ps-1", "TTS", None).unwrap();

        let err = psm.cancel_sync("ps-1", "TTS").unwrap_err();
        assert!(matches!(err, Error::SyncAlreadyStarted(_)));
        assert_eq!(psm.participant_state("ps-1", "TTS"), PlaySyncState::Synced);
    }

    #[test]
    fn cancel_of_last_pending_participant_completes_sync() {
        let (psm, _, tts, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        psm.start_sync("ps-1", "TTS", None).unwrap();
        tts.take();

        psm.cancel_sync("ps-1", "Display").unwrap();

        assert_eq!(psm.state("ps-1"), PlaySyncState::Synced);
        assert_eq!(tts.take(), vec!["ps-1:Synced"]);
    }

    #[test]
    fn release_fires_after_default_hold() {
        let (psm, timer, tts, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        psm.start_sync("ps-1", "TTS", None).unwrap();
        psm.start_sync("ps-1", "Display", None).unwrap();
        tts.take();

        psm.release_sync("ps-1", "TTS").unwrap();
        timer.advance(Duration::from_secs(6));
        assert_eq!(psm.state("ps-1"), PlaySyncState::Synced);

        timer.advance(Duration::from_secs(1));
        assert_eq!(psm.state("ps-1"), PlaySyncState::None);
        assert_eq!(tts.take(), vec!["ps-1:Released", "ps-1:removed"]);
    }

    #[test]
    fn prepare_again_cancels_pending_release() {
        let (psm, timer, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        psm.release_sync("ps-1", "TTS").unwrap();

        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        timer.advance(Duration::from_secs(30));

        assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn appending_participant_syncs_alone() {
        let (psm, _, tts, display) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.start_sync("ps-1", "TTS", None).unwrap();
        tts.take();

        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &both()).unwrap();
        assert_eq!(psm.participant_state("ps-1", "Display"), PlaySyncState::Appending);
        assert_eq!(psm.participant_state("ps-1", "TTS"), PlaySyncState::Synced);

        psm.start_sync("ps-1", "Display", None).unwrap();
        assert_eq!(display.take(), vec!["ps-1:Appending", "ps-1:Synced"]);
        assert!(tts.take().is_empty());
    }

    #[test]
    fn restart_after_sync_reports_data_change() {
        let (psm, _, tts, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.start_sync("ps-1", "TTS", Some(json!(1))).unwrap();
        tts.take();

        psm.start_sync("ps-1", "TTS", Some(json!(2))).unwrap();

        assert_eq!(tts.take(), vec!["ps-1:data:2"]);
    }

    #[test]
    fn new_entry_replaces_unstackable_one() {
        let (psm, _, tts, _) = setup();
        let observed = Arc::new(Mutex::new(Vec::new()));

        struct NextProbe {
            psm: PlaySyncManager,
            seen: Arc<Mutex<Vec<bool>>>,
        }
        impl PlaySyncListener for NextProbe {
            fn on_sync_state(&self, _: &str, state: PlaySyncState, _: Option<&Value>) {
                if state == PlaySyncState::Released {
                    self.seen.lock().unwrap().push(self.psm.has_next_play_stack());
                }
            }
        }
        psm.add_listener(
            "AudioPlayer",
            Arc::new(NextProbe {
                psm: psm.clone(),
                seen: observed.clone(),
            }),
        );

        psm.prepare_sync_with("ps-1", PlayStackLayer::Media, &["AudioPlayer".to_string()])
            .unwrap();
        psm.prepare_sync_with("ps-2", PlayStackLayer::Media, &["TTS".to_string()]).unwrap();

        assert_eq!(psm.get_all_play_stack_items(), vec!["ps-2"]);
        assert_eq!(*observed.lock().unwrap(), vec![true]);
        assert!(!psm.has_next_play_stack());
        assert_eq!(tts.take(), vec!["ps-1:removed", "ps-2:Prepared"]);
    }

    #[test]
    fn info_stacks_on_media_and_releases_immediately() {
        let (psm, timer, _, _) = setup();
        psm.prepare_sync_with("media", PlayStackLayer::Media, &["Display".to_string()])
            .unwrap();
        psm.prepare_sync_with("info", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        assert_eq!(psm.get_all_play_stack_items(), vec!["info", "media"]);
        assert!(psm.has_activity(PlayStackLayer::Media));

        psm.release_sync("info", "TTS").unwrap();

        assert_eq!(psm.get_all_play_stack_items(), vec!["media"]);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn postponed_release_waits_for_continue() {
        let (psm, timer, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.release_sync("ps-1", "TTS").unwrap();
        psm.post_pone_release();
        assert!(psm.has_post_pone_release());

        timer.advance(Duration::from_secs(3600));
        assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);

        psm.continue_release();
        assert_eq!(psm.state("ps-1"), PlaySyncState::None);
        assert!(!psm.has_post_pone_release());
    }

    #[test]
    fn later_release_replaces_earlier_timer() {
        let (psm, timer, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.release_sync("ps-1", "TTS").unwrap();
        psm.release_sync_later("ps-1", "TTS").unwrap();
        assert_eq!(timer.pending(), 1);

        timer.advance(Duration::from_secs(10));
        assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);

        timer.advance(Duration::from_secs(600));
        assert_eq!(psm.state("ps-1"), PlaySyncState::None);
    }

    #[test]
    fn stop_and_reset_holding() {
        let (psm, timer, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.release_sync("ps-1", "TTS").unwrap();

        psm.stop_holding();
        assert!(psm.is_holding("ps-1"));
        timer.advance(Duration::from_secs(60));
        assert_eq!(psm.state("ps-1"), PlaySyncState::Prepared);

        psm.reset_holding();
        assert!(!psm.is_holding("ps-1"));
        timer.advance(Duration::from_secs(7));
        assert_eq!(psm.state("ps-1"), PlaySyncState::None);
    }

    #[test]
    fn release_while_holding_clears_flag() {
        let (psm, _, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.release_sync("ps-1", "TTS").unwrap();
        psm.stop_holding();

        psm.release_sync_immediately("ps-1", "TTS").unwrap();

        assert_eq!(psm.state("ps-1"), PlaySyncState::None);
        assert!(!psm.is_holding("ps-1"));
        psm.reset_holding();
        assert_eq!(psm.state("ps-1"), PlaySyncState::None);
    }

    #[test]
    fn release_requires_participant() {
        let (psm, _, _, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        assert!(psm.release_sync("ps-1", "Display").is_err());
        assert!(psm.release_sync("ps-x", "TTS").is_err());
    }

    #[test]
    fn reset_is_silent_and_keeps_listeners() {
        let (psm, timer, tts, _) = setup();
        psm.prepare_sync_with("ps-1", PlayStackLayer::Info, &["TTS".to_string()]).unwrap();
        psm.release_sync("ps-1", "TTS").unwrap();
        tts.take();

        psm.reset();

        assert!(psm.get_all_play_stack_items().is_empty());
        assert!(tts.take().is_empty());
        assert_eq!(timer.pending(), 0);
        assert_eq!(psm.listener_count(), 2);
    }

    #[test]
    fn listener_registration_ignores_empty_and_duplicates() {
        let (psm, _, tts, _) = setup();
        psm.add_listener("", tts.clone());
        psm.add_listener("TTS", tts);
        assert_eq!(psm.listener_count(), 2);
        psm.remove_listener("TTS");
        assert_eq!(psm.listener_count(), 1);
    }
}
