//! Pending-command queue and mode/arm composition.
//!
//! Commands are prioritized by their MAVLink opcode: navigation commands sit
//! at the low end of the numbering, so they outrank parameter and
//! housekeeping traffic. Ack reconciliation only ever looks at the head.

use mavlink::common::{MavCmd, MavModeFlag, MavResult, COMMAND_LONG_DATA};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

pub const MAX_RETRANSMITS: u32 = 5;

#[derive(Debug)]
struct QueuedCommand {
    msg: COMMAND_LONG_DATA,
    sent: u32,
    status: Option<MavResult>,
    seq: u64,
}

impl QueuedCommand {
    fn priority(&self) -> u32 {
        self.msg.command as u32
    }
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority() && self.seq == other.seq
    }
}

impl Eq for QueuedCommand {}

impl Ord for QueuedCommand {
    // BinaryHeap is a max-heap; reverse both keys for min-by-opcode with
    // FIFO tiebreak.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority()
            .cmp(&self.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What the driver should do after one service step.
#[derive(Debug, PartialEq)]
pub enum QueueStep {
    Idle,
    /// Head reached a terminal state (or ran out of retries) and was popped.
    Completed {
        command: u32,
        status: Option<MavResult>,
    },
    /// Head should be (re)transmitted.
    Transmit {
        msg: COMMAND_LONG_DATA,
        status: Option<MavResult>,
    },
}

pub struct CommandQueue {
    heap: Mutex<BinaryHeap<QueuedCommand>>,
    seq: AtomicU64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn push(&self, msg: COMMAND_LONG_DATA) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(QueuedCommand {
                msg,
                sent: 0,
                status: None,
                seq,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.clear();
        }
    }

    /// One driver pass over the head: pop on a terminal ack or exhausted
    /// retries, otherwise hand the packed command back for transmission.
    pub fn service(&self) -> QueueStep {
        let mut heap = match self.heap.lock() {
            Ok(h) => h,
            Err(_) => return QueueStep::Idle,
        };
        let Some(mut head) = heap.peek_mut() else {
            return QueueStep::Idle;
        };

        let status = head.status;
        let done = matches!(
            status,
            Some(MavResult::MAV_RESULT_ACCEPTED)
                | Some(MavResult::MAV_RESULT_DENIED)
                | Some(MavResult::MAV_RESULT_UNSUPPORTED)
                | Some(MavResult::MAV_RESULT_FAILED)
        );

        if done || head.sent > MAX_RETRANSMITS {
            let command = head.priority();
            std::collections::binary_heap::PeekMut::pop(head);
            QueueStep::Completed { command, status }
        } else {
            head.sent += 1;
            QueueStep::Transmit {
                msg: head.msg.clone(),
                status,
            }
        }
    }

    /// Writes an ack result onto the head if its opcode matches. A mismatch
    /// means the ack belongs to something we are no longer tracking.
    pub fn reconcile_ack(&self, command: u32, result: MavResult) -> bool {
        let mut heap = match self.heap.lock() {
            Ok(h) => h,
            Err(_) => return false,
        };
        if let Some(mut head) = heap.peek_mut() {
            if head.priority() == command {
                head.status = Some(result);
                return true;
            }
        }
        false
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge between the async ack path and a blocking REST caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastCommand {
    pub command: Option<u32>,
    pub result: Option<MavResult>,
}

impl LastCommand {
    pub fn result_text(&self) -> &'static str {
        match self.result {
            Some(MavResult::MAV_RESULT_ACCEPTED) => "Command accepted.",
            Some(MavResult::MAV_RESULT_FAILED) => "Command was received, but failed.",
            Some(MavResult::MAV_RESULT_UNSUPPORTED) => "Command is not supported.",
            Some(MavResult::MAV_RESULT_DENIED) => "Command was rejected by the vehicle.",
            Some(MavResult::MAV_RESULT_TEMPORARILY_REJECTED) => {
                "Command was rejected by the vehicle, but is supported."
            }
            _ => "Command unknown.",
        }
    }
}

/// Base-mode flags plus the two PX4 submode bytes for one flight mode.
pub fn compose_mode(mode: &str, armed: bool) -> (MavModeFlag, u32, u32) {
    let mut flags = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
    if armed {
        flags |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }

    const MANUAL: MavModeFlag = MavModeFlag::MAV_MODE_FLAG_MANUAL_INPUT_ENABLED;
    const STAB: MavModeFlag = MavModeFlag::MAV_MODE_FLAG_STABILIZE_ENABLED;
    const GUIDED: MavModeFlag = MavModeFlag::MAV_MODE_FLAG_GUIDED_ENABLED;
    const AUTO: MavModeFlag = MavModeFlag::MAV_MODE_FLAG_AUTO_ENABLED;

    let (extra, main_mode, auto_mode) = match mode {
        "Manual" => (MANUAL | STAB, 1, 0),
        "Stabilized" => (MANUAL | STAB, 7, 0),
        "Acro" => (MANUAL, 5, 0),
        "RAttitude" => (MANUAL | STAB, 8, 0),
        "Altitude" => (MANUAL | STAB | GUIDED, 2, 0),
        "Position" => (MANUAL | STAB | GUIDED, 3, 0),
        "Hold" => (AUTO | GUIDED | STAB, 4, 3),
        "Follow" => (AUTO | GUIDED | STAB, 4, 8),
        "RTL" => (AUTO | GUIDED | STAB, 4, 5),
        "Takeoff" => (AUTO | GUIDED | STAB, 4, 3),
        "Mission" => (AUTO | GUIDED | STAB, 4, 4),
        // Offboard, Land, RTGS and unknown strings are not settable through
        // DO_SET_MODE here; they keep base flags only.
        _ => (MavModeFlag::empty(), 0, 0),
    };

    (flags | extra, main_mode, auto_mode)
}

/// Packs a COMMAND_LONG addressed to the vehicle's autopilot.
pub fn pack_command_long(target_system: u8, command: MavCmd, params: [f32; 7]) -> COMMAND_LONG_DATA {
    COMMAND_LONG_DATA {
        target_system,
        target_component: 1,
        command,
        confirmation: 0,
        param1: params[0],
        param2: params[1],
        param3: params[2],
        param4: params[3],
        param5: params[4],
        param6: params[5],
        param7: params[6],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(command: MavCmd) -> COMMAND_LONG_DATA {
        pack_command_long(1, command, [0.0; 7])
    }

    #[test]
    fn navigation_commands_outrank_housekeeping() {
        let queue = CommandQueue::new();
        queue.push(cmd(MavCmd::MAV_CMD_DO_SET_MODE)); // 176
        queue.push(cmd(MavCmd::MAV_CMD_NAV_TAKEOFF)); // 22

        match queue.service() {
            QueueStep::Transmit { msg, .. } => {
                assert_eq!(msg.command, MavCmd::MAV_CMD_NAV_TAKEOFF)
            }
            other => panic!("expected transmit, got {:?}", other),
        }
    }

    #[test]
    fn fifo_tiebreak_for_equal_opcodes() {
        let queue = CommandQueue::new();
        let mut first = cmd(MavCmd::MAV_CMD_DO_SET_MODE);
        first.param1 = 1.0;
        let mut second = cmd(MavCmd::MAV_CMD_DO_SET_MODE);
        second.param1 = 2.0;
        queue.push(first);
        queue.push(second);

        match queue.service() {
            QueueStep::Transmit { msg, .. } => assert_eq!(msg.param1, 1.0),
            other => panic!("expected transmit, got {:?}", other),
        }
    }

    #[test]
    fn terminal_acks_pop_within_one_step() {
        for result in [
            MavResult::MAV_RESULT_ACCEPTED,
            MavResult::MAV_RESULT_DENIED,
            MavResult::MAV_RESULT_UNSUPPORTED,
            MavResult::MAV_RESULT_FAILED,
        ] {
            let queue = CommandQueue::new();
            queue.push(cmd(MavCmd::MAV_CMD_DO_SET_MODE));
            assert!(queue.reconcile_ack(MavCmd::MAV_CMD_DO_SET_MODE as u32, result));

            match queue.service() {
                QueueStep::Completed { command, status } => {
                    assert_eq!(command, MavCmd::MAV_CMD_DO_SET_MODE as u32);
                    assert_eq!(status, Some(result));
                }
                other => panic!("expected completion, got {:?}", other),
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn temporarily_rejected_keeps_retrying() {
        let queue = CommandQueue::new();
        queue.push(cmd(MavCmd::MAV_CMD_DO_SET_MODE));
        queue.reconcile_ack(
            MavCmd::MAV_CMD_DO_SET_MODE as u32,
            MavResult::MAV_RESULT_TEMPORARILY_REJECTED,
        );
        assert!(matches!(queue.service(), QueueStep::Transmit { .. }));
    }

    #[test]
    fn unacked_command_sent_exactly_six_times() {
        let queue = CommandQueue::new();
        queue.push(cmd(MavCmd::MAV_CMD_DO_SET_MODE));

        let mut sends = 0;
        loop {
            match queue.service() {
                QueueStep::Transmit { .. } => sends += 1,
                QueueStep::Completed { status, .. } => {
                    assert_eq!(status, None);
                    break;
                }
                QueueStep::Idle => panic!("queue drained unexpectedly"),
            }
            assert!(sends < 20, "never gave up");
        }
        assert_eq!(sends, 1 + MAX_RETRANSMITS as usize);
        assert!(queue.is_empty());
    }

    #[test]
    fn mismatched_ack_is_dropped() {
        let queue = CommandQueue::new();
        queue.push(cmd(MavCmd::MAV_CMD_DO_SET_MODE));
        assert!(!queue.reconcile_ack(
            MavCmd::MAV_CMD_NAV_LAND as u32,
            MavResult::MAV_RESULT_ACCEPTED
        ));
        // Head untouched: still wants a transmit.
        assert!(matches!(queue.service(), QueueStep::Transmit { .. }));
    }

    #[test]
    fn mode_composition_table() {
        use MavModeFlag as F;
        let custom = F::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        let manual = F::MAV_MODE_FLAG_MANUAL_INPUT_ENABLED;
        let stab = F::MAV_MODE_FLAG_STABILIZE_ENABLED;
        let guided = F::MAV_MODE_FLAG_GUIDED_ENABLED;
        let auto = F::MAV_MODE_FLAG_AUTO_ENABLED;

        let cases = [
            ("Manual", custom | manual | stab, 1, 0),
            ("Stabilized", custom | manual | stab, 7, 0),
            ("Acro", custom | manual, 5, 0),
            ("RAttitude", custom | manual | stab, 8, 0),
            ("Altitude", custom | manual | stab | guided, 2, 0),
            ("Position", custom | manual | stab | guided, 3, 0),
            ("Hold", custom | auto | guided | stab, 4, 3),
            ("Follow", custom | auto | guided | stab, 4, 8),
            ("RTL", custom | auto | guided | stab, 4, 5),
            ("Takeoff", custom | auto | guided | stab, 4, 3),
            ("Mission", custom | auto | guided | stab, 4, 4),
        ];

        for (mode, flags, main_mode, auto_mode) in cases {
            assert_eq!(
                compose_mode(mode, false),
                (flags, main_mode, auto_mode),
                "mode {}",
                mode
            );
            assert_eq!(
                compose_mode(mode, true),
                (flags | F::MAV_MODE_FLAG_SAFETY_ARMED, main_mode, auto_mode),
                "armed mode {}",
                mode
            );
        }

        // Unsettable modes keep base flags only.
        assert_eq!(compose_mode("Offboard", false), (custom, 0, 0));
        assert_eq!(
            compose_mode("Land", true),
            (custom | F::MAV_MODE_FLAG_SAFETY_ARMED, 0, 0)
        );
    }

    #[test]
    fn result_text_mapping() {
        let last = LastCommand {
            command: Some(176),
            result: Some(MavResult::MAV_RESULT_ACCEPTED),
        };
        assert_eq!(last.result_text(), "Command accepted.");
        assert_eq!(LastCommand::default().result_text(), "Command unknown.");
    }
}
