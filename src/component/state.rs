use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::message::{Message, MessageQueue};
use super::{Command, Component, Event, EventHandler, PortDirection, State};
use crate::core::{ErrorCode, MppError, Result};

pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// State, queue and event plumbing shared by every component.
///
/// `state` is the only field read from foreign threads; everything a worker
/// owns lives in its own private structure.
pub struct ComponentCore {
    name: String,
    state: Mutex<State>,
    messages: MessageQueue<Message>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
}

impl ComponentCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::Loaded),
            messages: MessageQueue::new(),
            handler: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    pub fn set_callback(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn notify(&self, event: Event) {
        debug!("{} {} event {:?}", log_ctx(), self.name, event);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_event(&self.name, event);
        }
    }

    pub fn post(&self, command: Command) {
        self.messages.put(Message::new(command));
    }

    pub fn messages(&self) -> &MessageQueue<Message> {
        &self.messages
    }
}

/// Validates a STATE_SET request against the lifecycle table.
pub fn check_transition(current: State, target: State) -> std::result::Result<(), ErrorCode> {
    if current == target {
        return Err(ErrorCode::SameState);
    }
    if current == State::Invalid {
        return Err(ErrorCode::InvalidState);
    }
    let allowed = match target {
        State::Invalid => true,
        State::Loaded => current == State::Idle,
        State::Idle => matches!(current, State::Loaded | State::Executing | State::Pause),
        State::Executing => matches!(current, State::Idle | State::Pause),
        State::Pause => current == State::Executing,
    };
    if allowed {
        Ok(())
    } else {
        Err(ErrorCode::IncorrectStateTransition)
    }
}

/// Runs one STATE_SET against `core`.
///
/// `enter(from, to)` performs the component-specific work; on `Ok` the state
/// is committed and CMD_COMPLETE is emitted, on `Err` an ERROR event is
/// emitted and the state is left untouched. INVALID is always entered.
pub(crate) fn handle_state_set<F>(core: &ComponentCore, target: State, enter: F) -> bool
where
    F: FnOnce(State, State) -> std::result::Result<(), ErrorCode>,
{
    let current = core.state();
    if let Err(code) = check_transition(current, target) {
        warn!(
            "{} {} rejects {:?} -> {:?}: {}",
            log_ctx(),
            core.name(),
            current,
            target,
            code
        );
        core.notify(Event::Error(code));
        return false;
    }

    if target == State::Invalid {
        if let Err(code) = enter(current, target) {
            warn!("{} {} cleanup on INVALID failed: {}", log_ctx(), core.name(), code);
        }
        core.set_state(State::Invalid);
        core.notify(Event::Error(ErrorCode::InvalidState));
        core.notify(Event::CmdComplete(Command::StateSet(State::Invalid)));
        return true;
    }

    match enter(current, target) {
        Ok(()) => {
            core.set_state(target);
            info!("{} {} {:?} -> {:?}", log_ctx(), core.name(), current, target);
            core.notify(Event::CmdComplete(Command::StateSet(target)));
            true
        }
        Err(code) => {
            warn!(
                "{} {} failed {:?} -> {:?}: {}",
                log_ctx(),
                core.name(),
                current,
                target,
                code
            );
            core.notify(Event::Error(code));
            false
        }
    }
}

/// Common bind validation: state gate, port range and direction match.
pub(crate) fn check_bind(
    core: &ComponentCore,
    allowed_states: &[State],
    own_direction: Option<PortDirection>,
    peer: Option<&Arc<dyn Component>>,
    peer_port: u32,
) -> Result<()> {
    if !allowed_states.contains(&core.state()) {
        return Err(MppError::Component(ErrorCode::InvalidState));
    }
    let direction = own_direction.ok_or(MppError::Component(ErrorCode::BadParameter))?;
    if let (PortDirection::Input, Some(peer)) = (direction, peer) {
        if peer.port_direction(peer_port) != Some(PortDirection::Output) {
            return Err(MppError::Component(ErrorCode::PortNotCompatible));
        }
    }
    Ok(())
}

/// Owned join handle of a component worker.
pub(crate) struct Worker {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| MppError::Thread(format!("spawn {} failed: {}", name, e)))?;
        Ok(Self {
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Posts STOP and joins. Idempotent.
    pub(crate) fn stop(&self, core: &ComponentCore) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            core.post(Command::Stop);
            if handle.join().is_err() {
                warn!("{} {} worker panicked", log_ctx(), core.name());
            }
        }
    }

    /// Teardown is only legal from LOADED.
    pub(crate) fn deinit(&self, core: &ComponentCore) -> Result<()> {
        if core.state() != State::Loaded {
            return Err(MppError::Component(ErrorCode::InvalidState));
        }
        self.stop(core);
        info!("{} {} deinit", log_ctx(), core.name());
        Ok(())
    }

    /// Used from `Drop` when `deinit` was skipped.
    pub(crate) fn stop_on_drop(&self, core: &ComponentCore) {
        if self.is_running() {
            warn!(
                "{} ⚠ {} dropped without deinit, stopping worker",
                log_ctx(),
                core.name()
            );
            self.stop(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_core() -> (ComponentCore, Arc<StdMutex<Vec<Event>>>) {
        let core = ComponentCore::new("test");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        core.set_callback(Arc::new(move |_: &str, event: Event| {
            sink.lock().unwrap().push(event);
        }));
        (core, events)
    }

    #[test]
    fn test_transition_table() {
        use State::*;
        assert_eq!(check_transition(Loaded, Idle), Ok(()));
        assert_eq!(check_transition(Idle, Executing), Ok(()));
        assert_eq!(check_transition(Executing, Pause), Ok(()));
        assert_eq!(check_transition(Pause, Executing), Ok(()));
        assert_eq!(check_transition(Pause, Idle), Ok(()));
        assert_eq!(check_transition(Executing, Idle), Ok(()));
        assert_eq!(check_transition(Idle, Loaded), Ok(()));
        assert_eq!(check_transition(Executing, Invalid), Ok(()));

        assert_eq!(check_transition(Loaded, Executing), Err(ErrorCode::IncorrectStateTransition));
        assert_eq!(check_transition(Loaded, Pause), Err(ErrorCode::IncorrectStateTransition));
        assert_eq!(check_transition(Executing, Loaded), Err(ErrorCode::IncorrectStateTransition));
        assert_eq!(check_transition(Idle, Pause), Err(ErrorCode::IncorrectStateTransition));
        assert_eq!(check_transition(Invalid, Idle), Err(ErrorCode::InvalidState));
    }

    #[test]
    fn test_same_state_is_rejected_for_every_state() {
        for state in [
            State::Loaded,
            State::Idle,
            State::Executing,
            State::Pause,
            State::Invalid,
        ] {
            let (core, events) = recording_core();
            core.set_state(state);
            assert!(!handle_state_set(&core, state, |_, _| Ok(())));
            assert_eq!(core.state(), state);
            assert_eq!(*events.lock().unwrap(), vec![Event::Error(ErrorCode::SameState)]);
        }
    }

    #[test]
    fn test_successful_transition_emits_cmd_complete() {
        let (core, events) = recording_core();
        assert!(handle_state_set(&core, State::Idle, |from, to| {
            assert_eq!((from, to), (State::Loaded, State::Idle));
            Ok(())
        }));
        assert_eq!(core.state(), State::Idle);
        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::CmdComplete(Command::StateSet(State::Idle))]
        );
    }

    #[test]
    fn test_failed_hook_keeps_state() {
        let (core, events) = recording_core();
        assert!(!handle_state_set(&core, State::Idle, |_, _| {
            Err(ErrorCode::InsufficientResources)
        }));
        assert_eq!(core.state(), State::Loaded);
        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Error(ErrorCode::InsufficientResources)]
        );
    }

    #[test]
    fn test_invalid_reports_error_then_complete() {
        let (core, events) = recording_core();
        assert!(handle_state_set(&core, State::Invalid, |_, _| Ok(())));
        assert_eq!(core.state(), State::Invalid);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Error(ErrorCode::InvalidState),
                Event::CmdComplete(Command::StateSet(State::Invalid)),
            ]
        );
    }

    #[test]
    fn test_worker_deinit_requires_loaded() {
        let core = Arc::new(ComponentCore::new("worker"));
        let worker = {
            let core = Arc::clone(&core);
            Worker::spawn("worker", move || loop {
                core.messages().wait_new_msg(0);
                if let Some(msg) = core.messages().get() {
                    if msg.command == Command::Stop {
                        break;
                    }
                }
            })
            .unwrap()
        };
        core.set_state(State::Idle);
        assert_eq!(
            worker.deinit(&core).unwrap_err().code(),
            ErrorCode::InvalidState
        );
        core.set_state(State::Loaded);
        worker.deinit(&core).unwrap();
        assert!(!worker.is_running());
    }
}
