// Lunar Coroutines
// Independent processors with their own stacks, switched on resume/yield

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::processor::{Exec, Processor};
use super::caller::ValueCaller;
use super::runtime::Runtime;
use super::value::Value;
use crate::error::{LuaError, LuaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    NotStarted,
    Suspended,
    Running,
    /// Active but currently resuming another coroutine
    Normal,
    Dead,
    /// The host thread
    Main,
}

impl CoroutineState {
    /// Name reported by `coroutine.status`
    pub fn as_str(self) -> &'static str {
        match self {
            CoroutineState::NotStarted | CoroutineState::Suspended => "suspended",
            CoroutineState::Running | CoroutineState::Main => "running",
            CoroutineState::Normal => "normal",
            CoroutineState::Dead => "dead",
        }
    }
}

pub struct Coroutine {
    state: Cell<CoroutineState>,
    /// Taken out while the coroutine runs
    processor: RefCell<Option<Box<Processor>>>,
    function: RefCell<Option<Value>>,
    /// Error value the coroutine died with
    error: RefCell<Option<Value>>,
}

impl Coroutine {
    /// Handle standing for the host thread
    pub fn main() -> Rc<Coroutine> {
        Rc::new(Coroutine {
            state: Cell::new(CoroutineState::Main),
            processor: RefCell::new(None),
            function: RefCell::new(None),
            error: RefCell::new(None),
        })
    }

    pub fn new(runtime: Rc<Runtime>, function: Value) -> Rc<Coroutine> {
        Rc::new_cyclic(|weak| Coroutine {
            state: Cell::new(CoroutineState::NotStarted),
            processor: RefCell::new(Some(Box::new(Processor::new(runtime, Some(weak.clone()))))),
            function: RefCell::new(Some(function)),
            error: RefCell::new(None),
        })
    }

    pub fn state(&self) -> CoroutineState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: CoroutineState) {
        log::trace!("coroutine {:?} -> {:?}", self.state.get(), state);
        self.state.set(state);
    }

    pub fn is_main(&self) -> bool {
        self.state.get() == CoroutineState::Main
    }

    /// Runs the coroutine until it yields or finishes
    ///
    /// `resumer` is the coroutine doing the resume (None for the host thread);
    /// it is marked Normal for the duration.
    pub fn resume(&self, args: Vec<Value>, resumer: Option<Rc<Coroutine>>) -> LuaResult<Value> {
        let starting = match self.state.get() {
            CoroutineState::NotStarted => true,
            CoroutineState::Suspended => false,
            CoroutineState::Dead => return Err(LuaError::cannot_resume_dead()),
            _ => return Err(LuaError::cannot_resume_not_suspended()),
        };
        let runtime = match self.processor.borrow().as_ref() {
            Some(processor) => processor.runtime(),
            None => return Err(LuaError::internal("coroutine has no processor")),
        };
        let _native = runtime.enter_native()?;
        let mut processor = self
            .processor
            .borrow_mut()
            .take()
            .ok_or_else(|| LuaError::internal("coroutine has no processor"))?;

        if let Some(resumer) = &resumer {
            resumer.set_state(CoroutineState::Normal);
        }
        self.set_state(CoroutineState::Running);

        let outcome = if starting {
            let function = self.function.borrow_mut().take().unwrap_or_default();
            processor.start(&function, args)
        } else {
            processor.resume(args)
        };

        *self.processor.borrow_mut() = Some(processor);
        if let Some(resumer) = &resumer {
            resumer.set_state(CoroutineState::Running);
        }

        match outcome {
            Ok(Exec::Yielded(values)) => {
                self.set_state(CoroutineState::Suspended);
                Ok(values)
            }
            Ok(Exec::Returned(values)) => {
                self.set_state(CoroutineState::Dead);
                Ok(values)
            }
            Err(err) => {
                self.set_state(CoroutineState::Dead);
                *self.error.borrow_mut() = Some(err.to_script_value());
                Err(err)
            }
        }
    }

    /// `coroutine.close`: closes pending to-be-closed variables and kills the coroutine
    pub fn close(&self) -> LuaResult<Value> {
        match self.state.get() {
            CoroutineState::NotStarted => {
                self.function.borrow_mut().take();
                self.set_state(CoroutineState::Dead);
                Ok(Value::Boolean(true))
            }
            CoroutineState::Suspended => {
                self.set_state(CoroutineState::Dead);
                let outcome = match self.processor.borrow_mut().as_mut() {
                    Some(processor) => processor.close_all(),
                    None => Ok(()),
                };
                match outcome {
                    Ok(()) => Ok(Value::Boolean(true)),
                    Err(err) => {
                        let value = err.to_script_value();
                        *self.error.borrow_mut() = Some(value.clone());
                        Ok(Value::from_values(vec![Value::Boolean(false), value]))
                    }
                }
            }
            CoroutineState::Dead => Ok(match self.error.borrow().clone() {
                Some(err) => Value::from_values(vec![Value::Boolean(false), err]),
                None => Value::Boolean(true),
            }),
            CoroutineState::Normal => Err(LuaError::runtime("cannot close a normal coroutine")),
            CoroutineState::Running | CoroutineState::Main => {
                Err(LuaError::runtime("cannot close a running coroutine"))
            }
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<coroutine {:?}>", self.state.get())
    }
}
