//! The booth state machine.
//!
//! ```text
//! Idle --advance--> Advancing --performer found--> Playing
//!                       |                             |
//!                       +--nobody qualifies--> Idle   +--timer/advance--> Advancing
//! ```
//!
//! `Advancing` only exists while the cluster-wide `booth:advancing` lease is
//! held. Everything an advance changes in the store (waitlist rotation, booth
//! keys, tallies, history) is committed in one atomic group, so other
//! instances never observe a half-finished rotation.

use super::history::{self, HistoryRecord, Tallies, RECENT_HISTORY_CAPACITY};
use crate::bus::{EventBus, PlayPayload, ServerAction};
use crate::directory::{next_play, Permission, PlaylistItem, UserDirectory};
use crate::errors::BoothError;
use crate::observability::metrics::{record_advance, set_waitlist_length};
use crate::store::lease::LeaseGuard;
use crate::store::{keys, DistributedLock, StateStore, StoreOp};
use common::types::HistoryId;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceOptions {
    /// Take the current performer out of rotation instead of re-enqueueing.
    pub remove: bool,
    /// Announce the outcome on the bus. Off for startup recovery.
    pub publish: bool,
}

impl Default for AdvanceOptions {
    fn default() -> Self {
        Self {
            remove: false,
            publish: true,
        }
    }
}

impl AdvanceOptions {
    #[must_use]
    pub fn removing() -> Self {
        Self {
            remove: true,
            ..Self::default()
        }
    }
}

/// Current play plus live tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoothSnapshot {
    #[serde(rename = "historyID")]
    pub history_id: HistoryId,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "playlistID")]
    pub playlist_id: String,
    pub media: PlaylistItem,
    pub played_at: i64,
    pub upvotes: Vec<String>,
    pub downvotes: Vec<String>,
    pub favorites: Vec<String>,
}

#[derive(Debug)]
struct Candidate {
    user_id: String,
    /// False when the previous performer repeats because nobody is waiting.
    from_waitlist: bool,
}

#[derive(Debug)]
struct PlayTimer {
    history_id: HistoryId,
    cancel: CancellationToken,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn outcome_label(result: &Result<Option<PlayPayload>, BoothError>) -> &'static str {
    match result {
        Ok(Some(_)) => "playing",
        Ok(None) => "idle",
        Err(BoothError::AdvanceInProgress) => "in_progress",
        Err(BoothError::StoreInconsistency(_)) => "inconsistent",
        Err(_) => "error",
    }
}

/// Owns the single booth and its duration timer.
pub struct BoothScheduler {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    directory: Arc<dyn UserDirectory>,
    lock: DistributedLock,
    timer: Mutex<Option<PlayTimer>>,
    cancel_token: CancellationToken,
    this: Weak<BoothScheduler>,
}

impl BoothScheduler {
    /// Build a scheduler. Timers are children of `cancel_token`.
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        directory: Arc<dyn UserDirectory>,
        lock_ttl: Duration,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        let lock = DistributedLock::new(Arc::clone(&store), keys::ADVANCE_LEASE, lock_ttl);
        Arc::new_cyclic(|this| Self {
            store,
            bus,
            directory,
            lock,
            timer: Mutex::new(None),
            cancel_token,
            this: this.clone(),
        })
    }

    /// End the current play and start the next one.
    ///
    /// Returns the new play, or `None` when the booth went idle.
    ///
    /// # Errors
    ///
    /// - `AdvanceInProgress` if another advance holds the lease; not retried
    /// - `StoreInconsistency` if no stable candidate emerged within the bound
    #[instrument(skip_all, fields(remove = options.remove, publish = options.publish))]
    pub async fn advance(&self, options: AdvanceOptions) -> Result<Option<PlayPayload>, BoothError> {
        let started = Instant::now();
        let guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(e) => {
                let result = Err(e);
                record_advance(outcome_label(&result), started.elapsed());
                return result;
            }
        };

        let result = self.advance_locked(&guard, options).await;
        self.lock.release(guard).await;

        record_advance(outcome_label(&result), started.elapsed());
        match &result {
            Ok(Some(play)) => info!(
                target: "booth.scheduler",
                user_id = %play.user_id,
                history_id = %play.history_id,
                "Booth advanced"
            ),
            Ok(None) => info!(target: "booth.scheduler", "Booth is idle"),
            Err(e) => warn!(target: "booth.scheduler", error = %e, "Advance failed"),
        }
        result
    }

    async fn advance_locked(
        &self,
        guard: &LeaseGuard,
        options: AdvanceOptions,
    ) -> Result<Option<PlayPayload>, BoothError> {
        let previous_dj = self.store.get(keys::CURRENT_DJ).await?;
        let previous_history = self.current_history().await?;
        let mut remove = options.remove;

        // Each failed attempt drops one waitlist entry or the repeating
        // performer, so waitlist length + 2 attempts always suffice.
        let bound = self.store.list_len(keys::WAITLIST).await? + 2;
        let mut attempts = 0;

        let next = loop {
            attempts += 1;
            if attempts > bound {
                return Err(BoothError::StoreInconsistency(
                    "The waitlist kept changing during advance".to_string(),
                ));
            }
            if attempts > 1 {
                self.lock.extend(guard).await?;
            }

            let Some(candidate) = self.pick_candidate(previous_dj.as_deref(), remove).await? else {
                break None;
            };
            match self.prepare_play(&candidate.user_id).await {
                Ok(play) => break Some((candidate, play)),
                Err(BoothError::EmptyPlaylist) => {
                    info!(
                        target: "booth.scheduler",
                        user_id = %candidate.user_id,
                        "Dropping performer with nothing to play"
                    );
                    if candidate.from_waitlist {
                        self.store
                            .list_remove(keys::WAITLIST, &candidate.user_id)
                            .await?;
                    } else {
                        remove = true;
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let mut ops = Vec::new();
        if let Some(previous) = &previous_history {
            ops.push(self.seal(previous).await?.store_op()?);
        }

        let play = match next {
            Some((candidate, (playlist_id, media))) => {
                let requeue = match previous_dj.as_deref() {
                    Some(prev) if !remove && candidate.from_waitlist && prev != candidate.user_id => {
                        // A previous performer with nothing left to play
                        // leaves the rotation.
                        next_play(self.directory.as_ref(), prev).await?.is_some()
                    }
                    _ => false,
                };

                let record = HistoryRecord {
                    id: HistoryId::new(),
                    user_id: candidate.user_id.clone(),
                    playlist_id,
                    media,
                    played_at: now_ms(),
                    tallies: None,
                };

                if candidate.from_waitlist {
                    ops.push(StoreOp::ListRemove {
                        key: keys::WAITLIST.to_string(),
                        value: candidate.user_id.clone(),
                    });
                }
                if let (true, Some(prev)) = (requeue, previous_dj.as_deref()) {
                    ops.push(StoreOp::ListRemove {
                        key: keys::WAITLIST.to_string(),
                        value: prev.to_string(),
                    });
                    ops.push(StoreOp::ListPushBack {
                        key: keys::WAITLIST.to_string(),
                        value: prev.to_string(),
                    });
                }
                ops.push(StoreOp::Set {
                    key: keys::HISTORY_ID.to_string(),
                    value: record.id.to_string(),
                    ttl: None,
                });
                ops.push(StoreOp::Set {
                    key: keys::CURRENT_DJ.to_string(),
                    value: record.user_id.clone(),
                    ttl: None,
                });
                ops.extend(clear_tallies());
                ops.push(record.store_op()?);
                ops.push(StoreOp::ListPushBack {
                    key: keys::RECENT_HISTORY.to_string(),
                    value: record.id.to_string(),
                });
                ops.push(StoreOp::ListKeepLast {
                    key: keys::RECENT_HISTORY.to_string(),
                    keep: RECENT_HISTORY_CAPACITY,
                });
                self.store.atomic(ops).await?;

                self.directory.cycle_playlist(&record.playlist_id).await?;
                self.start_timer(
                    record.id,
                    Duration::from_secs(record.media.duration_secs()),
                );

                Some(PlayPayload {
                    history_id: record.id,
                    user_id: record.user_id,
                    playlist_id: record.playlist_id,
                    media: record.media,
                    played_at: record.played_at,
                })
            }
            None => {
                ops.push(StoreOp::Del {
                    key: keys::CURRENT_DJ.to_string(),
                });
                ops.push(StoreOp::Del {
                    key: keys::HISTORY_ID.to_string(),
                });
                ops.extend(clear_tallies());
                self.store.atomic(ops).await?;
                self.cancel_timer();
                None
            }
        };

        let waitlist = self.store.list_range(keys::WAITLIST).await?;
        set_waitlist_length(waitlist.len());

        if options.publish {
            self.publish_outcome(play.as_ref(), waitlist).await;
        }
        Ok(play)
    }

    async fn pick_candidate(
        &self,
        previous_dj: Option<&str>,
        remove: bool,
    ) -> Result<Option<Candidate>, BoothError> {
        let waitlist = self.store.list_range(keys::WAITLIST).await?;
        if let Some(front) = waitlist.into_iter().next() {
            return Ok(Some(Candidate {
                user_id: front,
                from_waitlist: true,
            }));
        }
        Ok(previous_dj.filter(|_| !remove).map(|prev| Candidate {
            user_id: prev.to_string(),
            from_waitlist: false,
        }))
    }

    async fn prepare_play(&self, user_id: &str) -> Result<(String, PlaylistItem), BoothError> {
        next_play(self.directory.as_ref(), user_id)
            .await?
            .ok_or(BoothError::EmptyPlaylist)
    }

    async fn seal(&self, record: &HistoryRecord) -> Result<HistoryRecord, BoothError> {
        let tallies = Tallies {
            upvotes: self.store.set_members(keys::UPVOTES).await?,
            downvotes: self.store.set_members(keys::DOWNVOTES).await?,
            favorites: self.store.set_members(keys::FAVORITES).await?,
        };
        Ok(HistoryRecord {
            tallies: Some(tallies),
            ..record.clone()
        })
    }

    async fn publish_outcome(&self, play: Option<&PlayPayload>, waitlist: Vec<String>) {
        let mut actions = vec![
            ServerAction::AdvanceComplete(play.cloned()),
            ServerAction::WaitlistUpdate { waitlist },
        ];
        if let Some(play) = play {
            actions.push(ServerAction::PlaylistCycle {
                user_id: play.user_id.clone(),
                playlist_id: play.playlist_id.clone(),
            });
        }
        for action in actions {
            // State is already committed; a lost announcement is not worth
            // failing the advance for.
            if let Err(e) = self.bus.publish_action(action).await {
                warn!(target: "booth.scheduler", error = %e, "Failed to publish advance outcome");
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------

    fn swap_timer(&self, next: Option<PlayTimer>) -> Option<PlayTimer> {
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, next)
    }

    fn cancel_timer(&self) {
        if let Some(old) = self.swap_timer(None) {
            old.cancel.cancel();
        }
    }

    fn start_timer(&self, history_id: HistoryId, after: Duration) {
        let cancel = self.cancel_token.child_token();
        let previous = self.swap_timer(Some(PlayTimer {
            history_id,
            cancel: cancel.clone(),
        }));
        if let Some(old) = previous {
            old.cancel.cancel();
        }

        debug!(
            target: "booth.scheduler",
            history_id = %history_id,
            after_ms = after.as_millis(),
            "Play timer started"
        );

        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    if let Some(booth) = this.upgrade() {
                        booth.on_timer_fired(history_id).await;
                    }
                }
            }
        });
    }

    /// History id the running timer was started for.
    #[must_use]
    pub fn timer_history_id(&self) -> Option<HistoryId> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.history_id)
    }

    async fn on_timer_fired(&self, history_id: HistoryId) {
        match self.store.get(keys::HISTORY_ID).await {
            Ok(current) if current.as_deref() == Some(history_id.to_string().as_str()) => {}
            Ok(_) => {
                debug!(
                    target: "booth.scheduler",
                    history_id = %history_id,
                    "Play already superseded, ignoring timer"
                );
                return;
            }
            Err(e) => {
                error!(target: "booth.scheduler", error = %e, "Timer could not read booth state");
                return;
            }
        }

        match self.advance(AdvanceOptions::default()).await {
            Ok(_) | Err(BoothError::AdvanceInProgress) => {}
            Err(e) => {
                error!(
                    target: "booth.scheduler",
                    error = %e,
                    "Timed advance failed, falling back to idle"
                );
                if let Err(e) = self.clear().await {
                    error!(target: "booth.scheduler", error = %e, "Failed to clear booth");
                }
            }
        }
    }

    /// Drop the current play without choosing a successor.
    async fn clear(&self) -> Result<(), BoothError> {
        let mut ops = vec![
            StoreOp::Del {
                key: keys::CURRENT_DJ.to_string(),
            },
            StoreOp::Del {
                key: keys::HISTORY_ID.to_string(),
            },
        ];
        ops.extend(clear_tallies());
        self.store.atomic(ops).await?;
        self.cancel_timer();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery and queries
    // ------------------------------------------------------------------

    /// Resume the persisted play after a restart.
    ///
    /// Restarts the timer for the remaining time, or advances silently when
    /// the play ran out while no instance was watching.
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<(), BoothError> {
        let Some(record) = self.current_history().await? else {
            if self.store.get(keys::CURRENT_DJ).await?.is_some() {
                warn!(target: "booth.scheduler", "Performer set without history, clearing booth");
                self.clear().await?;
            }
            return Ok(());
        };

        let remaining = record.remaining_ms(now_ms());
        if remaining > 0 {
            info!(
                target: "booth.scheduler",
                user_id = %record.user_id,
                remaining_ms = remaining,
                "Resuming play"
            );
            self.start_timer(record.id, Duration::from_millis(remaining));
            return Ok(());
        }

        info!(target: "booth.scheduler", "Persisted play already over, advancing");
        match self
            .advance(AdvanceOptions {
                remove: false,
                publish: false,
            })
            .await
        {
            // Another instance is recovering the same booth.
            Ok(_) | Err(BoothError::AdvanceInProgress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn current_history(&self) -> Result<Option<HistoryRecord>, BoothError> {
        match self.store.get(keys::HISTORY_ID).await? {
            Some(id) => history::load(self.store.as_ref(), &id).await,
            None => Ok(None),
        }
    }

    /// Current performer, if any.
    pub async fn current_dj(&self) -> Result<Option<String>, BoothError> {
        self.store.get(keys::CURRENT_DJ).await
    }

    pub async fn current_snapshot(&self) -> Result<Option<BoothSnapshot>, BoothError> {
        let Some(record) = self.current_history().await? else {
            return Ok(None);
        };
        Ok(Some(BoothSnapshot {
            history_id: record.id,
            user_id: record.user_id,
            playlist_id: record.playlist_id,
            media: record.media,
            played_at: record.played_at,
            upvotes: self.store.set_members(keys::UPVOTES).await?,
            downvotes: self.store.set_members(keys::DOWNVOTES).await?,
            favorites: self.store.set_members(keys::FAVORITES).await?,
        }))
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, BoothError> {
        history::recent(self.store.as_ref(), limit).await
    }

    // ------------------------------------------------------------------
    // Participant actions
    // ------------------------------------------------------------------

    /// Cast or switch a vote. `1` is up, `-1` is down.
    ///
    /// Returns false when nothing changed (no play, own play, same vote).
    ///
    /// # Errors
    ///
    /// `Validation` for any other direction.
    #[instrument(skip_all, fields(user_id = %user_id, direction = direction))]
    pub async fn vote(&self, user_id: &str, direction: i8) -> Result<bool, BoothError> {
        let (into, out_of) = match direction {
            1 => (keys::UPVOTES, keys::DOWNVOTES),
            -1 => (keys::DOWNVOTES, keys::UPVOTES),
            _ => return Err(BoothError::Validation("Vote must be 1 or -1".to_string())),
        };

        match self.current_dj().await? {
            Some(dj) if dj != user_id => {}
            _ => return Ok(false),
        }
        if self.store.set_contains(into, user_id).await? {
            return Ok(false);
        }

        self.store
            .atomic(vec![
                StoreOp::SetRemove {
                    key: out_of.to_string(),
                    member: user_id.to_string(),
                },
                StoreOp::SetAdd {
                    key: into.to_string(),
                    member: user_id.to_string(),
                },
            ])
            .await?;

        self.bus
            .publish_action(ServerAction::Vote {
                user_id: user_id.to_string(),
                direction,
            })
            .await?;
        Ok(true)
    }

    /// Mark the current play as a favorite. Returns false if nothing changed.
    pub async fn favorite(&self, user_id: &str) -> Result<bool, BoothError> {
        let Some(history_id) = self.store.get(keys::HISTORY_ID).await? else {
            return Ok(false);
        };
        let Some(history_id) = HistoryId::parse(&history_id) else {
            return Err(BoothError::StoreInconsistency(
                "Current play has an invalid id".to_string(),
            ));
        };
        if !self.store.set_add(keys::FAVORITES, user_id).await? {
            return Ok(false);
        }
        self.bus
            .publish_action(ServerAction::Favorite {
                user_id: user_id.to_string(),
                history_id,
            })
            .await?;
        Ok(true)
    }

    /// Skip the current play. Performers may skip themselves; skipping
    /// someone else needs `booth.skip.other`.
    pub async fn skip(
        &self,
        requester: &str,
        options: AdvanceOptions,
    ) -> Result<Option<PlayPayload>, BoothError> {
        let Some(dj) = self.current_dj().await? else {
            return Err(BoothError::Validation("Nobody is playing".to_string()));
        };
        if dj != requester && !self.directory.can(requester, Permission::BoothSkipOther).await? {
            return Err(BoothError::PermissionDenied(
                "You cannot skip other performers".to_string(),
            ));
        }
        self.advance(options).await
    }

    /// Advance with `remove` if `user_id` is performing. Used when a
    /// participant goes offline or is banned.
    pub async fn skip_if_current(&self, user_id: &str) -> Result<bool, BoothError> {
        if self.current_dj().await?.as_deref() != Some(user_id) {
            return Ok(false);
        }
        self.advance(AdvanceOptions::removing()).await?;
        Ok(true)
    }
}

fn clear_tallies() -> [StoreOp; 3] {
    [keys::UPVOTES, keys::DOWNVOTES, keys::FAVORITES].map(|key| StoreOp::Del {
        key: key.to_string(),
    })
}
