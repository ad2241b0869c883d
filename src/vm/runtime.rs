// Lunar Runtime
// State shared by every processor of one script: globals, code, cache, debugger

use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::coroutine::Coroutine;
use super::function::Closure;
use super::table::{Table, TableRef};
use super::value::{Number, Value};
use crate::cache::{CacheStats, CachedChunk, CompilationCache};
use crate::compiler::{disassemble, Compiler, Instruction};
use crate::debugger::{DebuggerHook, DebuggerState, SourceDescriptor};
use crate::error::{LuaError, LuaResult};
use crate::options::ScriptOptions;
use crate::parser::parse_chunk;
use crate::profile::{CompatibilityProfile, LuaVersion};

/// Recursion limits enforced by every processor
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_call_depth: usize,
    pub max_native_depth: usize,
}

pub struct Runtime {
    globals: TableRef,
    /// One flat instruction array for every chunk loaded into the script
    code: RefCell<Rc<Vec<Instruction>>>,
    profile: &'static CompatibilityProfile,
    string_metatable: RefCell<Option<TableRef>>,
    sources: RefCell<Vec<SourceDescriptor>>,
    cache: CompilationCache,
    pub(crate) debugger: RefCell<Option<DebuggerState>>,
    debugging: Cell<bool>,
    rng: RefCell<StdRng>,
    limits: Limits,
    main_thread: Rc<Coroutine>,
    started: Instant,
    warnings: Cell<bool>,
    chunk_prefix: String,
    chunk_counter: Cell<usize>,
    /// Native stack re-entries across every processor of the script
    native_depth: Cell<usize>,
}

/// Holds one level of native re-entry until dropped
pub(crate) struct NativeGuard {
    runtime: Rc<Runtime>,
}

impl Drop for NativeGuard {
    fn drop(&mut self) {
        let depth = &self.runtime.native_depth;
        depth.set(depth.get().saturating_sub(1));
    }
}

impl Runtime {
    pub fn new(options: &ScriptOptions) -> Rc<Runtime> {
        let profile = CompatibilityProfile::for_version(options.compatibility);
        log::debug!("creating runtime for {}", profile.display_name());
        Rc::new(Runtime {
            globals: Rc::new(RefCell::new(Table::new())),
            code: RefCell::new(Rc::new(Vec::new())),
            profile,
            string_metatable: RefCell::new(None),
            sources: RefCell::new(Vec::new()),
            cache: CompilationCache::new(options.cache_capacity),
            debugger: RefCell::new(None),
            debugging: Cell::new(false),
            rng: RefCell::new(StdRng::from_os_rng()),
            limits: Limits {
                max_call_depth: options.max_call_depth,
                max_native_depth: options.max_native_depth,
            },
            main_thread: Coroutine::main(),
            started: Instant::now(),
            warnings: Cell::new(false),
            chunk_prefix: options.chunk_name_prefix.clone(),
            chunk_counter: Cell::new(0),
            native_depth: Cell::new(0),
        })
    }

    pub fn globals(&self) -> &TableRef {
        &self.globals
    }

    pub fn profile(&self) -> &'static CompatibilityProfile {
        self.profile
    }

    pub fn version(&self) -> LuaVersion {
        self.profile.version
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Enters a nested run (native callback, metamethod, host call or resume)
    pub(crate) fn enter_native(self: &Rc<Self>) -> LuaResult<NativeGuard> {
        let depth = self.native_depth.get();
        if depth >= self.limits.max_native_depth {
            log::debug!("native re-entry limit {} reached", self.limits.max_native_depth);
            return Err(LuaError::stack_overflow());
        }
        self.native_depth.set(depth + 1);
        Ok(NativeGuard {
            runtime: Rc::clone(self),
        })
    }

    pub fn native_depth(&self) -> usize {
        self.native_depth.get()
    }

    pub fn main_thread(&self) -> Rc<Coroutine> {
        Rc::clone(&self.main_thread)
    }

    /// Snapshot of the instruction array; addresses stay valid as code is appended
    pub fn code(&self) -> Rc<Vec<Instruction>> {
        Rc::clone(&self.code.borrow())
    }

    /// Collapses integral floats for dialects without an integer subtype
    pub fn normalize(&self, n: Number) -> Number {
        if self.profile.integer_subtype {
            n
        } else {
            n.normalized()
        }
    }

    /// Compiles `source` (through the cache) and returns its main function
    pub fn load(&self, source: &str, chunk_name: &str) -> LuaResult<Value> {
        let version = self.profile.version;
        let chunk = match self.cache.try_get(source, version) {
            Some(chunk) => chunk,
            None => {
                let ast = parse_chunk(source, chunk_name, self.profile)?;
                let source_id = self.register_source(chunk_name, source);

                let mut guard = self.code.borrow_mut();
                let code = Rc::make_mut(&mut guard);
                let mark = code.len();
                let entry = match Compiler::new(code, source_id).compile_chunk(&ast) {
                    Ok(entry) => entry,
                    Err(err) => {
                        code.truncate(mark);
                        return Err(err);
                    }
                };
                drop(guard);

                let chunk = CachedChunk { entry, source_id };
                self.cache.store(source, version, chunk);
                chunk
            }
        };

        Ok(Value::Function(Rc::new(Closure::new(
            chunk.entry,
            Vec::new(),
            Rc::from("main chunk"),
            Rc::from(chunk_name),
        ))))
    }

    fn register_source(&self, name: &str, code: &str) -> u32 {
        let mut sources = self.sources.borrow_mut();
        let descriptor = SourceDescriptor {
            source_id: sources.len() as u32 + 1,
            name: name.to_string(),
            code: code.to_string(),
        };
        if let Some(debugger) = self.debugger.borrow_mut().as_mut() {
            debugger.hook.notify_source_loaded(&descriptor);
        }
        let id = descriptor.source_id;
        sources.push(descriptor);
        id
    }

    pub fn source(&self, source_id: u32) -> Option<SourceDescriptor> {
        let index = (source_id as usize).checked_sub(1)?;
        self.sources.borrow().get(index).cloned()
    }

    /// Name for an anonymous chunk: `<prefix>_<n>`
    pub fn next_chunk_name(&self) -> String {
        let n = self.chunk_counter.get() + 1;
        self.chunk_counter.set(n);
        format!("{}_{}", self.chunk_prefix, n)
    }

    pub fn string_metatable(&self) -> Option<TableRef> {
        self.string_metatable.borrow().clone()
    }

    pub fn set_string_metatable(&self, metatable: Option<TableRef>) {
        *self.string_metatable.borrow_mut() = metatable;
    }

    /// Metatable of any value; strings share one
    pub fn metatable_of(&self, value: &Value) -> Option<TableRef> {
        match value {
            Value::Table(t) => t.borrow().metatable.clone(),
            Value::UserData(u) => u.metatable.borrow().clone(),
            Value::String(_) => self.string_metatable(),
            _ => None,
        }
    }

    /// Non-nil metamethod `event` of `value`
    pub fn metamethod(&self, value: &Value, event: &str) -> Option<Value> {
        let metatable = self.metatable_of(value)?;
        let handler = metatable.borrow().get_str(event);
        if handler.is_nil() {
            None
        } else {
            Some(handler)
        }
    }

    pub fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }

    pub fn seed_rng(&self, seed: u64) {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(seed);
    }

    /// Seconds since the runtime was created
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn warnings_enabled(&self) -> bool {
        self.warnings.get()
    }

    pub fn set_warnings(&self, on: bool) {
        self.warnings.set(on);
    }

    pub fn attach_debugger(&self, hook: Box<dyn DebuggerHook>) {
        let mut state = DebuggerState::new(hook);
        for source in self.sources.borrow().iter() {
            state.hook.notify_source_loaded(source);
        }
        *self.debugger.borrow_mut() = Some(state);
        self.debugging.set(true);
        log::debug!("debugger attached");
    }

    pub fn detach_debugger(&self) -> Option<Box<dyn DebuggerHook>> {
        self.debugging.set(false);
        let state = self.debugger.borrow_mut().take()?;
        log::debug!("debugger detached");
        Some(state.hook)
    }

    pub fn is_debugging(&self) -> bool {
        self.debugging.get()
    }

    /// Offers an uncaught error to the debugger; pauses if it asks to
    pub fn offer_exception(&self, err: &LuaError) {
        let mut guard = self.debugger.borrow_mut();
        let Some(state) = guard.as_mut() else {
            return;
        };
        if state.hook.notify_runtime_exception(err) {
            if let Some(source_ref) = err.source_ref {
                state.pause(0, source_ref, 0);
            }
        }
    }

    pub fn notify_execution_ended(&self) {
        if let Some(state) = self.debugger.borrow_mut().as_mut() {
            state.hook.notify_execution_ended();
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn disassemble(&self) -> String {
        let code = self.code.borrow();
        disassemble(&code, 0, code.len())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("version", &self.profile.version)
            .field("instructions", &self.code.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_twice_hits_the_cache() {
        let runtime = Runtime::new(&ScriptOptions::default());
        let first = runtime.load("return 1 + 1", "a").unwrap();
        let size = runtime.code().len();
        let second = runtime.load("return 1 + 1", "b").unwrap();
        assert_eq!(runtime.code().len(), size);
        match (first, second) {
            (Value::Function(a), Value::Function(b)) => {
                assert_eq!(a.entry, b.entry);
                assert_eq!(&*b.chunk, "b");
            }
            _ => panic!("chunks load as functions"),
        }
        assert_eq!(runtime.cache_stats().hits, 1);
    }

    #[test]
    fn syntax_errors_leave_no_code_behind() {
        let runtime = Runtime::new(&ScriptOptions::default());
        assert!(runtime.load("return +", "bad").is_err());
        assert_eq!(runtime.code().len(), 0);
        assert_eq!(runtime.next_chunk_name(), "chunk_1");
        assert_eq!(runtime.next_chunk_name(), "chunk_2");
    }
}
