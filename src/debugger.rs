// Lunar Debugger Hook
// The narrow interface the VM calls into; concrete debuggers implement it

use rustc_hash::FxHashSet;

use crate::error::{LuaError, SourceRef};

/// What the debugger wants the VM to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerAction {
    Run,
    StepIn,
    StepOver,
    StepOut,
    SetBreakpoint { source_id: u32, line: u32, col: u32 },
    ClearBreakpoint { source_id: u32, line: u32, col: u32 },
    ToggleBreakpoint { source_id: u32, line: u32, col: u32 },
    /// Re-send watches and ask again
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    CallStack,
    Locals,
    VStack,
}

/// One row of a watch view
#[derive(Debug, Clone, PartialEq)]
pub struct WatchItem {
    pub name: String,
    pub value: String,
    pub location: Option<SourceRef>,
}

/// Watch views captured where execution paused
#[derive(Debug, Clone, Default)]
pub struct WatchSnapshot {
    pub call_stack: Vec<WatchItem>,
    pub locals: Vec<WatchItem>,
    pub operands: Vec<WatchItem>,
}

/// Source registered with the script
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub source_id: u32,
    pub name: String,
    pub code: String,
}

/// Capabilities a debugger advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebuggerCaps {
    pub can_debug_source: bool,
    pub can_debug_bytecode: bool,
    pub has_line_breakpoints: bool,
}

/// Implemented by debuggers attached to a script
///
/// `request_action` may block; it is only called at instruction boundaries.
pub trait DebuggerHook {
    fn capabilities(&self) -> DebuggerCaps;

    fn request_action(&mut self, ip: usize, source_ref: SourceRef) -> DebuggerAction;

    fn notify_watches_changed(&mut self, _kind: WatchKind, _items: &[WatchItem]) {}

    fn notify_source_loaded(&mut self, _source: &SourceDescriptor) {}

    fn notify_execution_ended(&mut self) {}

    /// Returns true to pause before the error reaches the host
    fn notify_runtime_exception(&mut self, _error: &LuaError) -> bool {
        false
    }

    fn is_pause_requested(&self) -> bool {
        false
    }
}

/// Line breakpoints keyed by (source id, line)
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    lines: FxHashSet<(u32, u32)>,
}

impl BreakpointSet {
    pub fn set(&mut self, source_id: u32, line: u32) {
        self.lines.insert((source_id, line));
    }

    pub fn clear(&mut self, source_id: u32, line: u32) {
        self.lines.remove(&(source_id, line));
    }

    /// Returns whether the breakpoint is now set
    pub fn toggle(&mut self, source_id: u32, line: u32) -> bool {
        if self.lines.remove(&(source_id, line)) {
            false
        } else {
            self.lines.insert((source_id, line));
            true
        }
    }

    pub fn contains(&self, source_ref: &SourceRef) -> bool {
        self.lines.contains(&(source_ref.source_id, source_ref.from_line))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepMode {
    Run,
    StepIn,
    /// Pause at the next location at or above this frame depth
    StepOver(usize),
    /// Pause once the frame depth drops below this
    StepOut(usize),
}

/// Debugger attached to a runtime, with its stepping state
pub(crate) struct DebuggerState {
    pub hook: Box<dyn DebuggerHook>,
    pub breakpoints: BreakpointSet,
    pub mode: StepMode,
    pub last_ref: Option<SourceRef>,
}

impl DebuggerState {
    pub fn new(hook: Box<dyn DebuggerHook>) -> Self {
        Self {
            hook,
            breakpoints: BreakpointSet::default(),
            // a freshly attached debugger gets control at the first statement
            mode: StepMode::StepIn,
            last_ref: None,
        }
    }

    /// Whether execution should pause before `source_ref` at call depth `depth`
    pub fn should_pause(&mut self, source_ref: SourceRef, depth: usize) -> bool {
        if self.last_ref == Some(source_ref) {
            return false;
        }
        self.last_ref = Some(source_ref);

        let stepping = match self.mode {
            StepMode::Run => false,
            StepMode::StepIn => true,
            StepMode::StepOver(d) => depth <= d,
            StepMode::StepOut(d) => depth < d,
        };
        stepping || self.breakpoints.contains(&source_ref) || self.hook.is_pause_requested()
    }

    fn send_watches(&mut self, watches: &WatchSnapshot) {
        self.hook.notify_watches_changed(WatchKind::CallStack, &watches.call_stack);
        self.hook.notify_watches_changed(WatchKind::Locals, &watches.locals);
        self.hook.notify_watches_changed(WatchKind::VStack, &watches.operands);
    }

    /// Sends the watches, then asks the hook for actions until one resumes execution
    pub fn pause(&mut self, ip: usize, source_ref: SourceRef, depth: usize, watches: &WatchSnapshot) {
        self.send_watches(watches);
        loop {
            match self.hook.request_action(ip, source_ref) {
                DebuggerAction::Run => self.mode = StepMode::Run,
                DebuggerAction::StepIn => self.mode = StepMode::StepIn,
                DebuggerAction::StepOver => self.mode = StepMode::StepOver(depth),
                DebuggerAction::StepOut => self.mode = StepMode::StepOut(depth),
                DebuggerAction::SetBreakpoint { source_id, line, .. } => {
                    self.breakpoints.set(source_id, line);
                    self.send_watches(watches);
                    continue;
                }
                DebuggerAction::ClearBreakpoint { source_id, line, .. } => {
                    self.breakpoints.clear(source_id, line);
                    self.send_watches(watches);
                    continue;
                }
                DebuggerAction::ToggleBreakpoint { source_id, line, .. } => {
                    self.breakpoints.toggle(source_id, line);
                    self.send_watches(watches);
                    continue;
                }
                DebuggerAction::Refresh => {
                    self.send_watches(watches);
                    continue;
                }
            }
            log::trace!("debugger resumed in {:?} mode", self.mode);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Vec<DebuggerAction>);

    impl DebuggerHook for Scripted {
        fn capabilities(&self) -> DebuggerCaps {
            DebuggerCaps {
                has_line_breakpoints: true,
                ..DebuggerCaps::default()
            }
        }

        fn request_action(&mut self, _ip: usize, _source_ref: SourceRef) -> DebuggerAction {
            if self.0.is_empty() {
                DebuggerAction::Run
            } else {
                self.0.remove(0)
            }
        }
    }

    fn at_line(line: u32) -> SourceRef {
        SourceRef {
            source_id: 1,
            from_line: line,
            from_col: 1,
            to_line: line,
            to_col: 5,
        }
    }

    #[test]
    fn breakpoint_actions_do_not_resume() {
        let mut state = DebuggerState::new(Box::new(Scripted(vec![
            DebuggerAction::SetBreakpoint { source_id: 1, line: 3, col: 0 },
            DebuggerAction::Refresh,
            DebuggerAction::Run,
        ])));
        assert!(state.should_pause(at_line(1), 1));
        state.pause(0, at_line(1), 1, &WatchSnapshot::default());
        assert_eq!(state.mode, StepMode::Run);
        assert!(!state.should_pause(at_line(2), 1));
        assert!(state.should_pause(at_line(3), 1));
    }

    #[test]
    fn step_over_ignores_deeper_frames() {
        let mut state = DebuggerState::new(Box::new(Scripted(vec![DebuggerAction::StepOver])));
        state.pause(0, at_line(1), 2, &WatchSnapshot::default());
        assert!(!state.should_pause(at_line(10), 3));
        assert!(state.should_pause(at_line(2), 2));
    }

    #[test]
    fn same_location_is_reported_once() {
        let mut state = DebuggerState::new(Box::new(Scripted(vec![])));
        assert!(state.should_pause(at_line(1), 1));
        assert!(!state.should_pause(at_line(1), 1));
        assert!(state.breakpoints.is_empty());
        assert!(state.breakpoints.toggle(1, 4));
        assert!(!state.breakpoints.toggle(1, 4));
    }

    #[derive(Default)]
    struct Watching {
        actions: Vec<DebuggerAction>,
        sent: std::rc::Rc<std::cell::RefCell<Vec<(WatchKind, usize)>>>,
    }

    impl DebuggerHook for Watching {
        fn capabilities(&self) -> DebuggerCaps {
            DebuggerCaps::default()
        }

        fn request_action(&mut self, _ip: usize, _source_ref: SourceRef) -> DebuggerAction {
            if self.actions.is_empty() {
                DebuggerAction::Run
            } else {
                self.actions.remove(0)
            }
        }

        fn notify_watches_changed(&mut self, kind: WatchKind, items: &[WatchItem]) {
            self.sent.borrow_mut().push((kind, items.len()));
        }
    }

    #[test]
    fn refresh_and_breakpoint_edits_resend_watches() {
        let hook = Watching {
            actions: vec![
                DebuggerAction::Refresh,
                DebuggerAction::ToggleBreakpoint { source_id: 1, line: 5, col: 0 },
                DebuggerAction::StepIn,
            ],
            ..Watching::default()
        };
        let sent = std::rc::Rc::clone(&hook.sent);
        let mut state = DebuggerState::new(Box::new(hook));
        let watches = WatchSnapshot {
            locals: vec![WatchItem {
                name: "x".to_string(),
                value: "1".to_string(),
                location: None,
            }],
            ..WatchSnapshot::default()
        };
        state.pause(0, at_line(1), 1, &watches);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 9);
        assert_eq!(sent[..3], [(WatchKind::CallStack, 0), (WatchKind::Locals, 1), (WatchKind::VStack, 0)]);
        assert_eq!(sent[3..6], sent[..3]);
        assert_eq!(sent[6..], sent[..3]);
        assert_eq!(state.mode, StepMode::StepIn);
        assert!(state.breakpoints.contains(&at_line(5)));
    }
}
