//! Per-group message id cursors for the push channel.
//!
//! The server reports the last message id of every message group when the
//! handshake completes. Push handlers advance the cursors as new messages
//! arrive, and the private-message group's cursor is echoed back when
//! acknowledging pushes.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Group type of the private-message group.
pub const GROUP_TYPE_PRIVATE_MSG: i32 = 6;

/// Group type of the miscellaneous-notification group.
pub const GROUP_TYPE_MISC: i32 = 8;

/// One group as reported by the application handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group type, see [`GROUP_TYPE_PRIVATE_MSG`].
    pub group_type: i32,
    /// Group id.
    pub group_id: u64,
    /// Last message id delivered in the group.
    pub last_msg_id: u64,
}

/// Cursor pair for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCursor {
    /// Group id.
    pub group_id: u64,
    /// Previous message id.
    pub last_id: u64,
    /// Most recent message id.
    pub current_id: u64,
}

/// Cursor table for one connection.
#[derive(Debug, Default)]
pub struct GroupCursorTable {
    cursors: DashMap<u64, GroupCursor>,
    private_group: AtomicU64,
}

impl GroupCursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with the groups from a handshake.
    pub fn seed(&self, groups: &[GroupInfo]) {
        self.clear();
        for group in groups {
            self.cursors.insert(
                group.group_id,
                GroupCursor {
                    group_id: group.group_id,
                    last_id: group.last_msg_id,
                    current_id: group.last_msg_id,
                },
            );
            if group.group_type == GROUP_TYPE_PRIVATE_MSG {
                self.private_group.store(group.group_id, Ordering::Relaxed);
            }
        }
        tracing::debug!(groups = groups.len(), "Seeded group cursors");
    }

    /// Record a new message id for `group_id`.
    ///
    /// The previous current id becomes the last id. A group seen for the
    /// first time starts with both ids equal to `msg_id`.
    pub fn update(&self, group_id: u64, msg_id: u64) {
        self.cursors
            .entry(group_id)
            .and_modify(|cursor| {
                cursor.last_id = cursor.current_id;
                cursor.current_id = msg_id;
            })
            .or_insert(GroupCursor {
                group_id,
                last_id: msg_id,
                current_id: msg_id,
            });
    }

    pub fn get(&self, group_id: u64) -> Option<GroupCursor> {
        self.cursors.get(&group_id).map(|cursor| *cursor)
    }

    /// Previous message id of `group_id`, or 0 if unknown.
    pub fn last_id(&self, group_id: u64) -> u64 {
        self.get(group_id).map_or(0, |cursor| cursor.last_id)
    }

    /// Most recent message id of `group_id`, or 0 if unknown.
    pub fn current_id(&self, group_id: u64) -> u64 {
        self.get(group_id).map_or(0, |cursor| cursor.current_id)
    }

    /// Id of the private-message group, or 0 before the handshake.
    pub fn private_group(&self) -> u64 {
        self.private_group.load(Ordering::Relaxed)
    }

    /// Record id sent when acknowledging private-message pushes.
    pub fn record_id(&self) -> u64 {
        self.last_id(self.private_group())
            .wrapping_mul(100)
            .wrapping_add(1)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Forget every group, as on reconnect.
    pub fn clear(&self) {
        self.cursors.clear();
        self.private_group.store(0, Ordering::Relaxed);
    }
}
