//! Peer sync agent: the per-participant half of the protocol.
//!
//! ```text
//! editor events ──► PeerState (pending, synced doc, presence)
//!                      │  ▲
//!                push loop  pull loop
//!                      ▼  │
//!                  PushLink  broadcast receiver
//!                      │  ▲
//!                      ▼  │
//!                   Authority
//! ```
//!
//! [`PeerState`] is the pure protocol state machine — no I/O, fully
//! deterministic, driven by `edit` / `take_sendable` / `receive`.
//! [`PeerAgent`] wraps it in the two concurrent loops: a push loop that
//! ships pending updates opportunistically (one outstanding push at a
//! time, coalescing behind a short debounce), and a pull loop that
//! applies every broadcast in version order and remaps pending edits and
//! cursors across it. Both loops stop cooperatively on shutdown.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::algebra::ChangeAlgebra;
use crate::authority::Authority;
use crate::broadcast::Accepted;
use crate::presence::{PresenceMarker, PresenceState};
use crate::protocol::SyncError;
use crate::update::{rebase_updates, Effect, Update};

/// How a peer submits pushes to the authority.
///
/// Implemented by [`AuthorityLink`] for an in-process authority and by
/// the WebSocket client for a remote one, so the agent follows one code
/// path either way.
pub trait PushLink<C>: Send + Sync + 'static {
    fn push(
        &self,
        base_version: u64,
        updates: Vec<Update<C>>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// Push link for a peer colocated with the authority.
pub struct AuthorityLink<A: ChangeAlgebra> {
    authority: Arc<Authority<A>>,
    group_id: String,
}

impl<A: ChangeAlgebra> AuthorityLink<A> {
    pub fn new(authority: Arc<Authority<A>>, group_id: impl Into<String>) -> Self {
        Self {
            authority,
            group_id: group_id.into(),
        }
    }
}

impl<A: ChangeAlgebra> PushLink<A::Change> for AuthorityLink<A> {
    async fn push(&self, base_version: u64, updates: Vec<Update<A::Change>>) -> Result<(), SyncError> {
        self.authority
            .push(&self.group_id, base_version, updates)
            .await
            .map(|_| ())
    }
}

/// Outcome of feeding one broadcast into [`PeerState::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Applied; `synced_version` advanced.
    Applied,
    /// Version not past `synced_version` — duplicate delivery, ignored.
    Duplicate,
    /// Version skips ahead; the transport lost a broadcast and the peer
    /// must resynchronize by rejoining.
    Gap { expected: u64 },
}

/// Pure per-peer protocol state.
///
/// The synced document is the fold of every applied broadcast; pending
/// updates are local edits not yet acknowledged, kept rebased against
/// everything applied so far, so the editor surface is always
/// `synced document + pending`.
pub struct PeerState<A: ChangeAlgebra> {
    algebra: Arc<A>,
    originator: String,
    synced_version: u64,
    document: String,
    pending: VecDeque<Update<A::Change>>,
    /// Leading pending updates already shipped in an outstanding push.
    in_flight: usize,
    presence: PresenceState,
}

impl<A: ChangeAlgebra> PeerState<A> {
    pub fn new(
        algebra: Arc<A>,
        presence_tag: impl Into<String>,
        version: u64,
        document: impl Into<String>,
    ) -> Self {
        Self {
            algebra,
            originator: Uuid::new_v4().to_string(),
            synced_version: version,
            document: document.into(),
            pending: VecDeque::new(),
            in_flight: 0,
            presence: PresenceState::new(presence_tag),
        }
    }

    pub fn originator(&self) -> &str {
        &self.originator
    }

    pub fn synced_version(&self) -> u64 {
        self.synced_version
    }

    /// The last document state agreed with the authority.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// The synced document with pending local edits folded on top —
    /// what the editing surface shows.
    pub fn display_document(&self) -> Result<String, SyncError> {
        let mut doc = self.document.clone();
        for update in &self.pending {
            if let Some(changes) = &update.changes {
                doc = self
                    .algebra
                    .apply(&doc, changes)
                    .map_err(|e| SyncError::IrreconcilableEdit(e.to_string()))?;
            }
        }
        Ok(doc)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn presence(&self) -> &PresenceState {
        &self.presence
    }

    /// Record a local document edit. The current cursor offsets ride
    /// along as a presence effect.
    pub fn edit(&mut self, changes: A::Change, cursor: Vec<usize>) {
        self.presence.set_local(cursor);
        let effects = vec![self.presence.local_effect()];
        self.pending
            .push_back(Update::edit(self.originator.clone(), changes, effects));
    }

    /// Record a local cursor move with no document change.
    ///
    /// Pure cursor movement still travels as an update so remote peers
    /// see it; consecutive moves coalesce into one not-yet-sent update.
    pub fn cursor_moved(&mut self, positions: Vec<usize>) {
        self.presence.set_local(positions);
        self.refresh_effect_update(self.presence.local_effect());
    }

    /// Change the shared document title.
    pub fn set_title(&mut self, value: impl Into<String>) {
        let value = value.into();
        self.presence.set_title(value.clone());
        self.refresh_effect_update(Effect::Title { value });
    }

    /// Attach `effect` to the trailing unsent effects-only update, or
    /// open a new one.
    fn refresh_effect_update(&mut self, effect: Effect) {
        let own_tag = self.presence.own_tag().to_string();
        let can_coalesce = self.pending.len() > self.in_flight
            && self
                .pending
                .back()
                .is_some_and(|last| last.is_effects_only());
        if can_coalesce {
            if let Some(last) = self.pending.pop_back() {
                let mut effects: Vec<Effect> = last
                    .effects
                    .into_iter()
                    .filter(|existing| !same_slot(existing, &effect, &own_tag))
                    .collect();
                effects.push(effect);
                self.pending
                    .push_back(Update::effects_only(self.originator.clone(), effects));
            }
        } else {
            self.pending
                .push_back(Update::effects_only(self.originator.clone(), vec![effect]));
        }
    }

    /// Everything not yet shipped, with the base version the authority
    /// should interpret it against. Marks the returned updates as in
    /// flight; call [`PeerState::push_failed`] if the push never made it.
    pub fn take_sendable(&mut self) -> Option<(u64, Vec<Update<A::Change>>)> {
        if self.pending.len() == self.in_flight {
            return None;
        }
        // Updates already in flight will occupy the versions right after
        // the synced one, so later edits are based past them.
        let base_version = self.synced_version + self.in_flight as u64;
        let updates: Vec<Update<A::Change>> =
            self.pending.iter().skip(self.in_flight).cloned().collect();
        self.in_flight = self.pending.len();
        Some((base_version, updates))
    }

    /// The previous push never reached the authority; everything pending
    /// becomes sendable again.
    pub fn push_failed(&mut self) {
        self.in_flight = 0;
    }

    /// Whether there are pending updates not covered by an outstanding
    /// push.
    pub fn has_unsent(&self) -> bool {
        self.pending.len() > self.in_flight
    }

    /// Apply one broadcast from the authority.
    ///
    /// An own broadcast acknowledges the oldest pending update; a
    /// foreign one is applied to the synced document, the pending queue
    /// is rebased across it, and every tracked cursor is remapped.
    /// Broadcasts at or below `synced_version` are ignored.
    pub fn receive(&mut self, accepted: &Accepted<A::Change>) -> Result<Received, SyncError> {
        if accepted.version <= self.synced_version {
            return Ok(Received::Duplicate);
        }
        if accepted.version != self.synced_version + 1 {
            return Ok(Received::Gap {
                expected: self.synced_version + 1,
            });
        }

        let update = accepted.update.as_ref();
        if update.originator == self.originator && !self.pending.is_empty() {
            // Our own edit coming back accepted: the pending head has
            // already been rebased locally across everything between its
            // base and this version, so the accepted changes match it.
            self.pending.pop_front();
            self.in_flight = self.in_flight.saturating_sub(1);
            if let Some(changes) = &update.changes {
                self.document = self
                    .algebra
                    .apply(&self.document, changes)
                    .map_err(|e| SyncError::IrreconcilableEdit(e.to_string()))?;
                self.presence.remap_remote(self.algebra.as_ref(), changes);
            }
        } else {
            if let Some(changes) = &update.changes {
                self.document = self
                    .algebra
                    .apply(&self.document, changes)
                    .map_err(|e| SyncError::IrreconcilableEdit(e.to_string()))?;

                let pending: Vec<Update<A::Change>> = self.pending.iter().cloned().collect();
                let rebased = rebase_updates(
                    self.algebra.as_ref(),
                    pending,
                    std::slice::from_ref(&accepted.update),
                )
                .map_err(|e| SyncError::IrreconcilableEdit(e.to_string()))?;
                self.pending = rebased.into();

                self.presence.remap_local(self.algebra.as_ref(), changes);
                self.presence.remap_remote(self.algebra.as_ref(), changes);
            }
            for effect in &update.effects {
                self.presence.merge_effect(effect);
            }
        }

        self.synced_version = accepted.version;
        Ok(Received::Applied)
    }
}

/// Peer agent configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Delay before re-pushing edits that accumulated while a push was
    /// in flight. Coalesces bursts; not a failure backoff.
    pub push_debounce: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            push_debounce: Duration::from_millis(300),
        }
    }
}

/// Read-only view of the peer's state for the UI.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub synced_version: u64,
    pub document: String,
    pub display_document: String,
    pub pending: usize,
    pub markers: Vec<PresenceMarker>,
    pub title: Option<String>,
}

/// The two sync loops running for one open document.
pub struct PeerAgent<A: ChangeAlgebra> {
    state: Arc<Mutex<PeerState<A>>>,
    dirty: Arc<Notify>,
    cancel: watch::Sender<bool>,
    push_task: JoinHandle<()>,
    pull_task: JoinHandle<()>,
}

impl<A: ChangeAlgebra> PeerAgent<A> {
    /// Start the push and pull loops over an established link.
    pub fn spawn<P: PushLink<A::Change>>(
        state: PeerState<A>,
        link: P,
        updates: broadcast::Receiver<Accepted<A::Change>>,
        config: PeerConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(state));
        let dirty = Arc::new(Notify::new());
        let (cancel, cancel_rx) = watch::channel(false);

        let push_task = tokio::spawn(push_loop(
            state.clone(),
            link,
            dirty.clone(),
            cancel_rx.clone(),
            config.push_debounce,
        ));
        let pull_task = tokio::spawn(pull_loop(state.clone(), updates, cancel_rx));

        Self {
            state,
            dirty,
            cancel,
            push_task,
            pull_task,
        }
    }

    pub async fn edit(&self, changes: A::Change, cursor: Vec<usize>) {
        self.state.lock().await.edit(changes, cursor);
        self.dirty.notify_one();
    }

    pub async fn cursor_moved(&self, positions: Vec<usize>) {
        self.state.lock().await.cursor_moved(positions);
        self.dirty.notify_one();
    }

    pub async fn set_title(&self, value: impl Into<String>) {
        self.state.lock().await.set_title(value);
        self.dirty.notify_one();
    }

    pub async fn snapshot(&self) -> Result<PeerSnapshot, SyncError> {
        let state = self.state.lock().await;
        Ok(PeerSnapshot {
            synced_version: state.synced_version(),
            document: state.document().to_string(),
            display_document: state.display_document()?,
            pending: state.pending_len(),
            markers: state.presence().markers(),
            title: state.presence().title().map(String::from),
        })
    }

    /// Stop both loops. The broadcast registration dies with the pull
    /// loop's receiver.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        self.dirty.notify_one();
        let _ = self.push_task.await;
        let _ = self.pull_task.await;
    }
}

async fn push_loop<A, P>(
    state: Arc<Mutex<PeerState<A>>>,
    link: P,
    dirty: Arc<Notify>,
    mut cancel: watch::Receiver<bool>,
    debounce: Duration,
) where
    A: ChangeAlgebra,
    P: PushLink<A::Change>,
{
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = dirty.notified() => {}
        }
        if *cancel.borrow() {
            return;
        }

        loop {
            let sendable = state.lock().await.take_sendable();
            let Some((base_version, updates)) = sendable else {
                break;
            };
            let count = updates.len();
            match link.push(base_version, updates).await {
                Ok(()) => {
                    log::debug!("pushed {count} update(s) at base {base_version}");
                }
                Err(e) => {
                    log::warn!("push failed, retrying on the next local edit: {e}");
                    state.lock().await.push_failed();
                    break;
                }
            }

            // Edits that accumulated while the push was outstanding get
            // coalesced behind a short fixed delay rather than pushed
            // immediately, so fast typing does not saturate the channel.
            if !state.lock().await.has_unsent() {
                break;
            }
            tokio::select! {
                _ = cancel.changed() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            if *cancel.borrow() {
                return;
            }
        }
    }
}

async fn pull_loop<A: ChangeAlgebra>(
    state: Arc<Mutex<PeerState<A>>>,
    mut updates: broadcast::Receiver<Accepted<A::Change>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            received = updates.recv() => {
                if *cancel.borrow() {
                    return;
                }
                match received {
                    Ok(accepted) => {
                        let version = accepted.version;
                        let mut state = state.lock().await;
                        match state.receive(&accepted) {
                            Ok(Received::Applied) => {}
                            Ok(Received::Duplicate) => {
                                log::debug!("ignoring duplicate broadcast {version}");
                            }
                            Ok(Received::Gap { expected }) => {
                                log::error!(
                                    "broadcast gap: expected {expected}, got {version}; rejoin required"
                                );
                            }
                            Err(e) => {
                                log::error!("failed to apply broadcast {version}: {e}");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("pull loop lagged by {n} broadcast(s); rejoin required");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Whether `existing` occupies the slot `incoming` replaces: the same
/// participant's presence, or the title.
fn same_slot(existing: &Effect, incoming: &Effect, own_tag: &str) -> bool {
    match (existing, incoming) {
        (Effect::Presence { tag, .. }, Effect::Presence { .. }) => tag == own_tag,
        (Effect::Title { .. }, Effect::Title { .. }) => true,
        _ => false,
    }
}
