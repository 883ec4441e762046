//! Duplicate suppression for group traffic.
//!
//! Pressing a button on a controller produces an all-link broadcast, then
//! an all-link cleanup sent directly to every responder, then a success
//! report (broadcast, cmd1 0x06). Any of them may be lost or repeated. The
//! per-group state machine below decides which of them is the first one a
//! responder sees for a given press.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::message::WireMessage;

/// cmd1 of an all-link cleanup success report.
pub const SUCCESS_REPORT: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Broadcast,
    Cleanup,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    ExpectBroadcast,
    ExpectCleanup,
    ExpectSuccess,
}

/// Tracks one group of one controller.
#[derive(Debug, Clone)]
pub struct GroupMessageStateMachine {
    state: GroupState,
    cmd1: u8,
    last_update: Option<Instant>,
}

impl Default for GroupMessageStateMachine {
    fn default() -> Self {
        Self {
            state: GroupState::ExpectBroadcast,
            cmd1: 0,
            last_update: None,
        }
    }
}

impl GroupMessageStateMachine {
    /// Feed one observed message. Returns `true` when handlers should act.
    pub fn action(&mut self, action: GroupAction, cmd1: u8, now: Instant, window: Duration) -> bool {
        let stale = self
            .last_update
            .map_or(true, |last| now.saturating_duration_since(last) > window);
        let new_press = action == GroupAction::Broadcast && cmd1 != self.cmd1;
        if stale || new_press {
            self.state = GroupState::ExpectBroadcast;
        }

        let publish = match (self.state, action) {
            (GroupState::ExpectBroadcast, GroupAction::Broadcast) => true,
            (GroupState::ExpectBroadcast, GroupAction::Cleanup) => true,
            (GroupState::ExpectBroadcast, GroupAction::Success) => false,
            (GroupState::ExpectCleanup, _) => false,
            (GroupState::ExpectSuccess, GroupAction::Broadcast) => true,
            (GroupState::ExpectSuccess, _) => false,
        };

        self.state = match action {
            GroupAction::Broadcast => GroupState::ExpectCleanup,
            GroupAction::Cleanup => GroupState::ExpectSuccess,
            GroupAction::Success => GroupState::ExpectBroadcast,
        };
        self.cmd1 = cmd1;
        self.last_update = Some(now);
        publish
    }
}

/// Per-device duplicate detection for inbound traffic.
#[derive(Debug)]
pub struct DuplicateTracker {
    window: Duration,
    groups: HashMap<u8, GroupMessageStateMachine>,
    broadcasts: HashMap<u8, Instant>,
}

impl DuplicateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            groups: HashMap::new(),
            broadcasts: HashMap::new(),
        }
    }

    /// `true` when `msg` repeats a group or broadcast message already seen.
    /// Direct traffic is never a duplicate.
    pub fn is_duplicate(&mut self, msg: &WireMessage, now: Instant) -> bool {
        let classified = if msg.is_all_link_broadcast() {
            let to = msg.to_address();
            if msg.cmd1() == SUCCESS_REPORT {
                Some((GroupAction::Success, to.low_byte(), to.high_byte()))
            } else {
                Some((GroupAction::Broadcast, to.low_byte(), msg.cmd1()))
            }
        } else if msg.is_all_link_cleanup() {
            Some((GroupAction::Cleanup, msg.cmd2(), msg.cmd1()))
        } else {
            None
        };

        if let Some((action, group, cmd1)) = classified {
            let machine = self.groups.entry(group).or_default();
            let publish = machine.action(action, cmd1, now, self.window);
            trace!("group {} {:?} cmd1 0x{:02X} publish={}", group, action, cmd1, publish);
            return !publish;
        }

        if msg.is_broadcast() {
            let window = self.window;
            let previous = self.broadcasts.insert(msg.cmd1(), now);
            return previous.is_some_and(|last| now.saturating_duration_since(last) <= window);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::InsteonAddress;
    use crate::message::MessageClass;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn controller() -> InsteonAddress {
        InsteonAddress::new(0xAA, 0xBB, 0xCC)
    }

    fn bcast(group: u8, cmd1: u8) -> WireMessage {
        WireMessage::standard(
            controller(),
            InsteonAddress::for_group(group),
            MessageClass::AllLinkBroadcast,
            cmd1,
            0x00,
        )
    }

    fn cleanup(group: u8, cmd1: u8) -> WireMessage {
        WireMessage::standard(
            controller(),
            InsteonAddress::new(0x11, 0x22, 0x33),
            MessageClass::AllLinkCleanup,
            cmd1,
            group,
        )
    }

    fn success(group: u8, cmd1: u8) -> WireMessage {
        WireMessage::standard(
            controller(),
            InsteonAddress::new(cmd1, 0x00, group),
            MessageClass::AllLinkBroadcast,
            SUCCESS_REPORT,
            0x00,
        )
    }

    #[test]
    fn test_full_sequence_publishes_once() {
        let mut tracker = DuplicateTracker::new(WINDOW);
        let now = Instant::now();
        assert!(!tracker.is_duplicate(&bcast(1, 0x11), now));
        assert!(tracker.is_duplicate(&cleanup(1, 0x11), now + Duration::from_millis(100)));
        assert!(tracker.is_duplicate(&success(1, 0x11), now + Duration::from_millis(200)));
    }

    #[test]
    fn test_missed_broadcast_publishes_on_cleanup() {
        let mut tracker = DuplicateTracker::new(WINDOW);
        let now = Instant::now();
        assert!(!tracker.is_duplicate(&cleanup(1, 0x11), now));
        assert!(tracker.is_duplicate(&success(1, 0x11), now + Duration::from_millis(50)));
    }

    #[test]
    fn test_new_press_after_window_or_other_command() {
        let mut tracker = DuplicateTracker::new(WINDOW);
        let now = Instant::now();
        assert!(!tracker.is_duplicate(&bcast(1, 0x11), now));
        assert!(tracker.is_duplicate(&bcast(1, 0x11), now + Duration::from_millis(10)));
        assert!(!tracker.is_duplicate(&bcast(1, 0x13), now + Duration::from_millis(20)));
        assert!(!tracker.is_duplicate(&bcast(1, 0x13), now + Duration::from_secs(5)));
    }

    #[test]
    fn test_groups_are_independent() {
        let mut tracker = DuplicateTracker::new(WINDOW);
        let now = Instant::now();
        assert!(!tracker.is_duplicate(&bcast(1, 0x11), now));
        assert!(!tracker.is_duplicate(&bcast(2, 0x11), now));
    }

    #[test]
    fn test_direct_is_never_duplicate() {
        let mut tracker = DuplicateTracker::new(WINDOW);
        let now = Instant::now();
        let msg = WireMessage::direct(controller(), 0x19, 0x00);
        assert!(!tracker.is_duplicate(&msg, now));
        assert!(!tracker.is_duplicate(&msg, now));
    }
}
