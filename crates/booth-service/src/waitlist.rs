//! The ordered queue of participants waiting for the booth.
//!
//! Mutations are read-modify-write against the shared list without the
//! advance lease. Concurrent writers are tolerated: every operation re-reads
//! the list afterwards and publishes what it actually sees.

use crate::booth::{AdvanceOptions, BoothScheduler};
use crate::bus::{EventBus, ServerAction};
use crate::directory::{next_play, Permission, UserDirectory};
use crate::errors::BoothError;
use crate::observability::metrics::set_waitlist_length;
use crate::store::{keys, InsertPosition, StateStore, StoreOp};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Who is adding, and where. A `None` moderator means the user joins
/// themselves at the tail.
#[derive(Debug, Clone, Default)]
pub struct AddUserOptions {
    pub moderator_id: Option<String>,
    /// Only honoured for moderator adds. Past the end appends.
    pub position: Option<usize>,
}

impl AddUserOptions {
    #[must_use]
    pub fn by_moderator(moderator_id: impl Into<String>, position: Option<usize>) -> Self {
        Self {
            moderator_id: Some(moderator_id.into()),
            position,
        }
    }
}

pub struct WaitlistQueue {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    directory: Arc<dyn UserDirectory>,
    booth: Arc<BoothScheduler>,
}

impl WaitlistQueue {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        directory: Arc<dyn UserDirectory>,
        booth: Arc<BoothScheduler>,
    ) -> Self {
        Self {
            store,
            bus,
            directory,
            booth,
        }
    }

    /// Current order, head first.
    pub async fn ordered_ids(&self) -> Result<Vec<String>, BoothError> {
        self.store.list_range(keys::WAITLIST).await
    }

    pub async fn is_locked(&self) -> Result<bool, BoothError> {
        Ok(self.store.get(keys::WAITLIST_LOCK).await?.is_some())
    }

    async fn require(&self, user_id: &str, permission: Permission) -> Result<(), BoothError> {
        if self.directory.can(user_id, permission).await? {
            Ok(())
        } else {
            Err(BoothError::PermissionDenied(format!(
                "Missing permission {}",
                permission.as_str()
            )))
        }
    }

    async fn refreshed(&self) -> Result<Vec<String>, BoothError> {
        let waitlist = self.ordered_ids().await?;
        set_waitlist_length(waitlist.len());
        Ok(waitlist)
    }

    /// Put `user_id` in the waitlist.
    ///
    /// Starts the booth when it was idle. Returns the refreshed order.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the user does not exist
    /// - `PermissionDenied` without join/add rights, or when locked without
    ///   force-join rights
    /// - `Validation` if already queued, performing, or without a playable
    ///   playlist
    #[instrument(skip_all, fields(user_id = %user_id, moderator_id = ?options.moderator_id))]
    pub async fn add_user(
        &self,
        user_id: &str,
        options: AddUserOptions,
    ) -> Result<Vec<String>, BoothError> {
        if self.directory.get_user(user_id).await?.is_none() {
            return Err(BoothError::NotFound("User not found".to_string()));
        }

        let requester = options.moderator_id.as_deref().unwrap_or(user_id);
        match options.moderator_id.as_deref() {
            Some(moderator) => self.require(moderator, Permission::WaitlistAdd).await?,
            None => self.require(user_id, Permission::WaitlistJoin).await?,
        }

        if self.is_locked().await?
            && !self
                .directory
                .can(requester, Permission::WaitlistJoinLocked)
                .await?
        {
            return Err(BoothError::PermissionDenied(
                "The waitlist is locked".to_string(),
            ));
        }

        let current = self.ordered_ids().await?;
        if current.iter().any(|id| id == user_id) {
            return Err(BoothError::Validation(
                "You are already in the waitlist".to_string(),
            ));
        }
        if self.booth.current_dj().await?.as_deref() == Some(user_id) {
            return Err(BoothError::Validation(
                "You are already playing in the booth".to_string(),
            ));
        }
        if next_play(self.directory.as_ref(), user_id).await?.is_none() {
            return Err(BoothError::Validation(
                "Your active playlist is empty".to_string(),
            ));
        }

        let pivot = options
            .moderator_id
            .as_ref()
            .and(options.position)
            .and_then(|position| current.get(position));
        let inserted = match pivot {
            Some(pivot) => self
                .store
                .list_insert(keys::WAITLIST, InsertPosition::Before, pivot, user_id)
                .await?
                .is_some(),
            None => false,
        };
        if !inserted {
            self.store.list_push_back(keys::WAITLIST, user_id).await?;
        }

        let waitlist = self.refreshed().await?;
        let action = match options.moderator_id {
            Some(moderator_id) => ServerAction::WaitlistAdd {
                user_id: user_id.to_string(),
                moderator_id,
                position: waitlist
                    .iter()
                    .position(|id| id == user_id)
                    .unwrap_or(waitlist.len()),
                waitlist: waitlist.clone(),
            },
            None => ServerAction::WaitlistJoin {
                user_id: user_id.to_string(),
                waitlist: waitlist.clone(),
            },
        };
        self.bus.publish_action(action).await?;
        info!(target: "booth.waitlist", user_id = %user_id, "User added to waitlist");

        if self.booth.current_dj().await?.is_none() {
            // The join itself succeeded; a failed kick-off is picked up by
            // the next advance.
            match self.booth.advance(AdvanceOptions::default()).await {
                Ok(_) => {}
                Err(BoothError::AdvanceInProgress) => {
                    debug!(target: "booth.waitlist", "Advance already running after join");
                }
                Err(e) => {
                    warn!(target: "booth.waitlist", error = %e, "Advance after join failed");
                }
            }
        }

        Ok(waitlist)
    }

    /// Move a queued user to `position`, clamped into `[0, len]`.
    ///
    /// Returns false when the order did not change; nothing is published then.
    #[instrument(skip_all, fields(user_id = %user_id, position = position, moderator_id = %moderator_id))]
    pub async fn move_user(
        &self,
        user_id: &str,
        position: usize,
        moderator_id: &str,
    ) -> Result<bool, BoothError> {
        self.require(moderator_id, Permission::WaitlistMove).await?;

        let current = self.ordered_ids().await?;
        let Some(from) = current.iter().position(|id| id == user_id) else {
            return Err(BoothError::NotFound(
                "User is not in the waitlist".to_string(),
            ));
        };
        let others: Vec<&String> = current.iter().filter(|id| *id != user_id).collect();
        let to = position.min(others.len());

        let old_predecessor = from.checked_sub(1).and_then(|i| current.get(i));
        let new_predecessor = to.checked_sub(1).and_then(|i| others.get(i).copied());
        if old_predecessor == new_predecessor {
            debug!(target: "booth.waitlist", "Move leaves order unchanged");
            return Ok(false);
        }

        let mut ops = vec![StoreOp::ListRemove {
            key: keys::WAITLIST.to_string(),
            value: user_id.to_string(),
        }];
        ops.push(match others.get(to) {
            Some(pivot) => StoreOp::ListInsert {
                key: keys::WAITLIST.to_string(),
                position: InsertPosition::Before,
                pivot: (*pivot).clone(),
                value: user_id.to_string(),
            },
            None => StoreOp::ListPushBack {
                key: keys::WAITLIST.to_string(),
                value: user_id.to_string(),
            },
        });
        self.store.atomic(ops).await?;

        let waitlist = self.refreshed().await?;
        let Some(landed) = waitlist.iter().position(|id| id == user_id) else {
            // The pivot vanished concurrently and the insert was skipped.
            self.store.list_push_back(keys::WAITLIST, user_id).await?;
            return Err(BoothError::StoreInconsistency(
                "The waitlist changed during the move, please try again".to_string(),
            ));
        };

        self.bus
            .publish_action(ServerAction::WaitlistMove {
                user_id: user_id.to_string(),
                moderator_id: moderator_id.to_string(),
                position: landed,
                waitlist,
            })
            .await?;
        Ok(true)
    }

    /// Take `user_id` out of the waitlist. Removing someone else needs
    /// `waitlist.remove`.
    #[instrument(skip_all, fields(user_id = %user_id, moderator_id = ?moderator_id))]
    pub async fn remove_user(
        &self,
        user_id: &str,
        moderator_id: Option<&str>,
    ) -> Result<Vec<String>, BoothError> {
        let moderator_id = moderator_id.filter(|m| *m != user_id);
        if let Some(moderator) = moderator_id {
            self.require(moderator, Permission::WaitlistRemove).await?;
        }

        if self.store.list_remove(keys::WAITLIST, user_id).await? == 0 {
            return Err(BoothError::NotFound(
                "User is not in the waitlist".to_string(),
            ));
        }

        let waitlist = self.refreshed().await?;
        let action = match moderator_id {
            Some(moderator) => ServerAction::WaitlistRemove {
                user_id: user_id.to_string(),
                moderator_id: moderator.to_string(),
                waitlist: waitlist.clone(),
            },
            None => ServerAction::WaitlistLeave {
                user_id: user_id.to_string(),
                waitlist: waitlist.clone(),
            },
        };
        self.bus.publish_action(action).await?;
        Ok(waitlist)
    }

    /// Leave the waitlist if queued. Used when a participant goes offline.
    pub async fn leave_if_queued(&self, user_id: &str) -> Result<bool, BoothError> {
        match self.remove_user(user_id, None).await {
            Ok(_) => Ok(true),
            Err(BoothError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(moderator_id = %moderator_id))]
    pub async fn clear(&self, moderator_id: &str) -> Result<(), BoothError> {
        self.require(moderator_id, Permission::WaitlistClear).await?;

        self.store.del(keys::WAITLIST).await?;
        if !self.refreshed().await?.is_empty() {
            return Err(BoothError::StoreInconsistency(
                "The waitlist could not be cleared, please try again".to_string(),
            ));
        }

        self.bus
            .publish_action(ServerAction::WaitlistClear {
                moderator_id: moderator_id.to_string(),
            })
            .await?;
        info!(target: "booth.waitlist", moderator_id = %moderator_id, "Waitlist cleared");
        Ok(())
    }

    pub async fn lock(&self, moderator_id: &str) -> Result<(), BoothError> {
        self.set_locked(moderator_id, true).await
    }

    pub async fn unlock(&self, moderator_id: &str) -> Result<(), BoothError> {
        self.set_locked(moderator_id, false).await
    }

    #[instrument(skip_all, fields(moderator_id = %moderator_id, locked = locked))]
    async fn set_locked(&self, moderator_id: &str, locked: bool) -> Result<(), BoothError> {
        self.require(moderator_id, Permission::WaitlistLock).await?;

        if locked {
            self.store.set(keys::WAITLIST_LOCK, "true", None).await?;
        } else {
            self.store.del(keys::WAITLIST_LOCK).await?;
        }
        if self.is_locked().await? != locked {
            return Err(BoothError::StoreInconsistency(
                "The waitlist lock did not change, please try again".to_string(),
            ));
        }

        self.bus
            .publish_action(ServerAction::WaitlistLock {
                moderator_id: moderator_id.to_string(),
                locked,
            })
            .await?;
        Ok(())
    }
}
