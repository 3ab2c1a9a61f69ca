use std::collections::VecDeque;
use std::fmt;

use crate::bridge::error::CallError;
use crate::state_machine::StateMachine;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    Active,
    Completing,
    Failing,
    Cancelling,
    Terminated,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A direction of a call, from the local side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// The one-time event ending a direction of a call.
#[derive(Debug, Clone)]
pub enum TerminalSignal {
    Completed,
    Failed(CallError),
    Cancelled(String),
}

impl TerminalSignal {
    pub fn kind(&self) -> TerminalKind {
        match self {
            TerminalSignal::Completed => TerminalKind::Completed,
            TerminalSignal::Failed(_) => TerminalKind::Failed,
            TerminalSignal::Cancelled(_) => TerminalKind::Cancelled,
        }
    }

    /// The terminal matching an error: cancellations stay cancellations.
    pub fn from_error(error: CallError) -> Self {
        match error {
            CallError::Cancelled(reason) => TerminalSignal::Cancelled(reason),
            other => TerminalSignal::Failed(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Completed,
    Failed,
    Cancelled,
}

pub enum LifecycleInput {
    Activate,
    Terminate(Direction, TerminalKind),
}

/// A state change, polled out of [`CallLifecycle`] for logging and wakeups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
}

/// Tracks the call state and which directions have seen their terminal.
///
/// The state reflects the most severe terminal seen so far (failing over cancelling over
/// completing) until both directions are done.
#[derive(Debug)]
pub struct CallLifecycle {
    state: CallState,
    inbound_done: bool,
    outbound_done: bool,
    transitions: VecDeque<Transition>,
}

impl CallLifecycle {
    pub fn new() -> Self {
        Self {
            state: CallState::Created,
            inbound_done: false,
            outbound_done: false,
            transitions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminated(&self, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => self.inbound_done,
            Direction::Outbound => self.outbound_done,
        }
    }

    fn move_to(&mut self, to: CallState) {
        if self.state != to {
            self.transitions.push_back(Transition {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn activate(&mut self) {
        if self.state == CallState::Created {
            self.move_to(CallState::Active);
        }
    }

    fn terminate(&mut self, direction: Direction, kind: TerminalKind) {
        let done = match direction {
            Direction::Inbound => &mut self.inbound_done,
            Direction::Outbound => &mut self.outbound_done,
        };
        if *done {
            return;
        }
        *done = true;

        if self.inbound_done && self.outbound_done {
            self.move_to(CallState::Terminated);
            return;
        }

        let next = match kind {
            TerminalKind::Completed => CallState::Completing,
            TerminalKind::Cancelled => CallState::Cancelling,
            TerminalKind::Failed => CallState::Failing,
        };
        if severity(next) > severity(self.state) {
            self.move_to(next);
        }
    }
}

fn severity(state: CallState) -> u8 {
    match state {
        CallState::Created | CallState::Active => 0,
        CallState::Completing => 1,
        CallState::Cancelling => 2,
        CallState::Failing => 3,
        CallState::Terminated => 4,
    }
}

impl Default for CallLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for CallLifecycle {
    type Input = LifecycleInput;
    type Output = Transition;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            LifecycleInput::Activate => self.activate(),
            LifecycleInput::Terminate(direction, kind) => self.terminate(direction, kind),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.transitions.pop_front()
    }
}
