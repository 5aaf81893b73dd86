//! The ordering authority: one process per group that decides global
//! order and fans accepted updates back out.
//!
//! ```text
//! peer A ──push──┐
//!                 ├──► GroupSession (mutex) ── UpdateLog ── document
//! peer B ──push──┘           │
//!                            ▼
//!                      GroupChannel ──► peer A, peer B, … (originator too)
//! ```
//!
//! Every push for a group runs under that group's mutex, so "rebase,
//! append, assign version, broadcast" is one atomic step per push and
//! arrival order at the lock is the tie-break between concurrent pushes.
//! Pushes for different groups proceed in parallel.
//!
//! If the process hosting a group's authority disappears mid-session the
//! group is simply gone — there is no failover or re-election here; that
//! remains an unresolved gap of the protocol.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::algebra::ChangeAlgebra;
use crate::broadcast::{Accepted, ChannelStats, GroupChannel};
use crate::history::UpdateLog;
use crate::protocol::SyncError;
use crate::update::{rebase_updates, Update};

/// Authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Accepted updates buffered per participant before it lags.
    pub broadcast_capacity: usize,
    /// Maximum participants per group.
    pub max_peers_per_group: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers_per_group: 100,
        }
    }
}

/// What a joining peer gets back: the snapshot to synchronize from plus
/// its private receiver on the group's fan-out channel.
#[derive(Debug)]
pub struct JoinGrant<C> {
    pub group_id: String,
    /// Current log length; the first broadcast the peer will apply is
    /// `version + 1`.
    pub version: u64,
    pub document: String,
    pub presence_tag: String,
    pub updates: broadcast::Receiver<Accepted<C>>,
}

/// Mutable per-group state. Owned exclusively by the authority; peers
/// only ever see it through join snapshots and broadcasts.
struct GroupSession<C> {
    document: String,
    log: UpdateLog<C>,
    channel: GroupChannel<C>,
    next_presence_tag: u64,
}

impl<C: Clone> GroupSession<C> {
    fn new(capacity: usize) -> Self {
        Self {
            document: String::new(),
            log: UpdateLog::new(),
            channel: GroupChannel::new(capacity),
            next_presence_tag: 0,
        }
    }

    /// Allocate the next presence tag. Monotonic, never reused.
    fn allocate_tag(&mut self) -> String {
        let tag = self.next_presence_tag.to_string();
        self.next_presence_tag += 1;
        tag
    }
}

/// Owns every group session and serializes mutation per group.
pub struct Authority<A: ChangeAlgebra> {
    algebra: Arc<A>,
    config: AuthorityConfig,
    groups: RwLock<HashMap<String, Arc<Mutex<GroupSession<A::Change>>>>>,
}

impl<A: ChangeAlgebra> Authority<A> {
    pub fn new(algebra: A) -> Self {
        Self::with_config(algebra, AuthorityConfig::default())
    }

    pub fn with_config(algebra: A, config: AuthorityConfig) -> Self {
        Self {
            algebra: Arc::new(algebra),
            config,
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn algebra(&self) -> &Arc<A> {
        &self.algebra
    }

    /// Establish a fresh group. The caller becomes its first participant
    /// and gets the same grant a joiner would.
    pub async fn create_group(&self) -> JoinGrant<A::Change> {
        let group_id = Uuid::new_v4().to_string();
        let mut session = GroupSession::new(self.config.broadcast_capacity);
        let presence_tag = session.allocate_tag();
        let updates = session.channel.register(presence_tag.clone());

        let grant = JoinGrant {
            group_id: group_id.clone(),
            version: 0,
            document: String::new(),
            presence_tag,
            updates,
        };

        let mut groups = self.groups.write().await;
        groups.insert(group_id.clone(), Arc::new(Mutex::new(session)));
        log::info!("group {group_id} created");
        grant
    }

    /// Join an existing group: register the caller as a participant,
    /// allocate its presence tag, and return the current snapshot.
    ///
    /// Safe to call concurrently with pushes for the same group — the
    /// session mutex guarantees the snapshot version and the receiver's
    /// first broadcast line up.
    pub async fn join(&self, group_id: &str) -> Result<JoinGrant<A::Change>, SyncError> {
        let session = self.session(group_id).await?;
        let mut session = session.lock().await;

        if session.channel.participant_count() >= self.config.max_peers_per_group {
            return Err(SyncError::ProtocolViolation(format!(
                "group {group_id} is full"
            )));
        }

        let presence_tag = session.allocate_tag();
        let updates = session.channel.register(presence_tag.clone());
        log::info!(
            "participant {presence_tag} joined group {group_id} at version {}",
            session.log.len()
        );

        Ok(JoinGrant {
            group_id: group_id.to_string(),
            version: session.log.len(),
            document: session.document.clone(),
            presence_tag,
            updates,
        })
    }

    /// Accept a push: rebase if stale, append, apply, broadcast.
    ///
    /// `base_version` beyond the log is a protocol violation. A change
    /// algebra failure drops the whole push and leaves log and document
    /// untouched; the pusher's pending state is expected to re-submit
    /// against a fresh base.
    ///
    /// Returns the versions assigned to the accepted updates.
    pub async fn push(
        &self,
        group_id: &str,
        base_version: u64,
        updates: Vec<Update<A::Change>>,
    ) -> Result<Vec<u64>, SyncError> {
        let session = self.session(group_id).await?;
        let mut session = session.lock().await;

        let log_len = session.log.len();
        if base_version > log_len {
            return Err(SyncError::ProtocolViolation(format!(
                "base version {base_version} is ahead of the log ({log_len})"
            )));
        }

        let accepted = if base_version < log_len {
            log::debug!(
                "rebasing {} update(s) in group {group_id}: base {base_version}, log {log_len}",
                updates.len()
            );
            rebase_updates(
                self.algebra.as_ref(),
                updates,
                session.log.slice_from(base_version),
            )
            .map_err(|e| {
                log::error!("dropping push for group {group_id}: {e}");
                SyncError::IrreconcilableEdit(e.to_string())
            })?
        } else {
            updates
        };

        // Stage the document changes before touching the log, so a bad
        // change cannot leave a half-applied push behind.
        let mut document = session.document.clone();
        for update in &accepted {
            if let Some(changes) = &update.changes {
                document = self.algebra.apply(&document, changes).map_err(|e| {
                    log::error!("dropping push for group {group_id}: {e}");
                    SyncError::IrreconcilableEdit(e.to_string())
                })?;
            }
        }

        session.document = document;
        let mut versions = Vec::with_capacity(accepted.len());
        for update in accepted {
            let (version, stored) = session.log.append(update);
            session.channel.broadcast(Accepted {
                version,
                update: stored,
            });
            versions.push(version);
        }
        Ok(versions)
    }

    /// Deregister a participant. The last one out removes the group.
    pub async fn leave(&self, group_id: &str, presence_tag: &str) -> Result<(), SyncError> {
        let session = self.session(group_id).await?;
        let empty = {
            let mut session = session.lock().await;
            session.channel.unregister(presence_tag);
            session.channel.participant_count() == 0
        };

        if empty {
            let mut groups = self.groups.write().await;
            // Re-check under the write lock; someone may have joined.
            if let Some(session) = groups.get(group_id) {
                if session.lock().await.channel.participant_count() == 0 {
                    groups.remove(group_id);
                    log::info!("group {group_id} removed (empty)");
                }
            }
        }
        Ok(())
    }

    /// Current document snapshot, for diagnostics and tests.
    pub async fn document(&self, group_id: &str) -> Result<String, SyncError> {
        let session = self.session(group_id).await?;
        let session = session.lock().await;
        Ok(session.document.clone())
    }

    /// Current log length (the latest assigned version).
    pub async fn version(&self, group_id: &str) -> Result<u64, SyncError> {
        let session = self.session(group_id).await?;
        let session = session.lock().await;
        Ok(session.log.len())
    }

    /// Fan-out statistics for one group.
    pub async fn channel_stats(&self, group_id: &str) -> Result<ChannelStats, SyncError> {
        let session = self.session(group_id).await?;
        let session = session.lock().await;
        Ok(session.channel.stats())
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn group_ids(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }

    async fn session(
        &self,
        group_id: &str,
    ) -> Result<Arc<Mutex<GroupSession<A::Change>>>, SyncError> {
        let groups = self.groups.read().await;
        groups.get(group_id).cloned().ok_or_else(|| {
            SyncError::ProtocolViolation(format!("unknown group {group_id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{splice, SpliceAlgebra};
    use crate::update::Effect;

    fn edit(originator: &str, at: usize, text: &str) -> Update<crate::testing::Splice> {
        Update::edit(originator, splice(at, 0, text), vec![])
    }

    #[tokio::test]
    async fn test_create_group_grants_first_tag() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;

        assert_eq!(grant.version, 0);
        assert_eq!(grant.document, "");
        assert_eq!(grant.presence_tag, "0");
        assert_eq!(authority.group_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_allocates_distinct_tags() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;

        let second = authority.join(&grant.group_id).await.unwrap();
        let third = authority.join(&grant.group_id).await.unwrap();

        assert_eq!(second.presence_tag, "1");
        assert_eq!(third.presence_tag, "2");
    }

    #[tokio::test]
    async fn test_join_unknown_group_is_violation() {
        let authority = Authority::new(SpliceAlgebra);
        let err = authority.join("nope").await.unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_push_fresh_base_appends_verbatim() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;

        let versions = authority
            .push(&grant.group_id, 0, vec![edit("a", 0, "AB")])
            .await
            .unwrap();

        assert_eq!(versions, vec![1]);
        assert_eq!(authority.document(&grant.group_id).await.unwrap(), "AB");
        assert_eq!(authority.version(&grant.group_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_push_stale_base_is_rebased() {
        // The concurrent-edit scenario: "AB", X inserts "1" at 1, Y
        // inserts "2" at 2, both against version 1. Arrival order decides.
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;
        authority
            .push(&grant.group_id, 0, vec![edit("seed", 0, "AB")])
            .await
            .unwrap();

        authority
            .push(&grant.group_id, 1, vec![edit("x", 1, "1")])
            .await
            .unwrap();
        assert_eq!(authority.document(&grant.group_id).await.unwrap(), "A1B");

        // Y pushed against the stale base and gets re-anchored.
        authority
            .push(&grant.group_id, 1, vec![edit("y", 2, "2")])
            .await
            .unwrap();
        assert_eq!(authority.document(&grant.group_id).await.unwrap(), "A1B2");
        assert_eq!(authority.version(&grant.group_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_push_ahead_of_log_rejected() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;

        let err = authority
            .push(&grant.group_id, 5, vec![edit("a", 0, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
        assert_eq!(authority.version(&grant.group_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_change_drops_whole_push() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;

        // Second update is out of bounds; the first must not land either.
        let err = authority
            .push(
                &grant.group_id,
                0,
                vec![edit("a", 0, "hi"), edit("a", 99, "x")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::IrreconcilableEdit(_)));
        assert_eq!(authority.version(&grant.group_id).await.unwrap(), 0);
        assert_eq!(authority.document(&grant.group_id).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_originator_too() {
        let authority = Authority::new(SpliceAlgebra);
        let mut grant = authority.create_group().await;

        authority
            .push(&grant.group_id, 0, vec![edit("a", 0, "hi")])
            .await
            .unwrap();

        let accepted = grant.updates.recv().await.unwrap();
        assert_eq!(accepted.version, 1);
        assert_eq!(accepted.update.originator, "a");
        assert_eq!(accepted.update.version, Some(1));
    }

    #[tokio::test]
    async fn test_versions_broadcast_in_ascending_order() {
        let authority = Authority::new(SpliceAlgebra);
        let mut grant = authority.create_group().await;

        authority
            .push(
                &grant.group_id,
                0,
                vec![edit("a", 0, "A"), edit("a", 1, "B"), edit("a", 2, "C")],
            )
            .await
            .unwrap();

        for expected in 1..=3 {
            assert_eq!(grant.updates.recv().await.unwrap().version, expected);
        }
    }

    #[tokio::test]
    async fn test_effects_only_update_gets_a_version() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;

        let cursor_move = Update::effects_only(
            "a",
            vec![Effect::Presence {
                tag: "0".into(),
                positions: vec![0],
            }],
        );
        let versions = authority
            .push(&grant.group_id, 0, vec![cursor_move])
            .await
            .unwrap();

        assert_eq!(versions, vec![1]);
        assert_eq!(authority.document(&grant.group_id).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_last_leave_removes_group() {
        let authority = Authority::new(SpliceAlgebra);
        let grant = authority.create_group().await;
        let second = authority.join(&grant.group_id).await.unwrap();

        authority
            .leave(&grant.group_id, &grant.presence_tag)
            .await
            .unwrap();
        assert_eq!(authority.group_count().await, 1);

        authority
            .leave(&grant.group_id, &second.presence_tag)
            .await
            .unwrap();
        assert_eq!(authority.group_count().await, 0);
    }

    #[tokio::test]
    async fn test_group_full_rejects_join() {
        let config = AuthorityConfig {
            max_peers_per_group: 1,
            ..AuthorityConfig::default()
        };
        let authority = Authority::with_config(SpliceAlgebra, config);
        let grant = authority.create_group().await;

        let err = authority.join(&grant.group_id).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }
}
