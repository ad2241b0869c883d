// Lunar Script
// Host entry point: owns a runtime, its globals and the standard library

use std::rc::Rc;

use crate::builtins::register_stdlib;
use crate::cache::CacheStats;
use crate::debugger::DebuggerHook;
use crate::error::LuaResult;
use crate::options::ScriptOptions;
use crate::profile::{CompatibilityProfile, LuaVersion};
use crate::vm::function::NativeFn;
use crate::vm::{Coroutine, Processor, Runtime, TableRef, Value};

/// An independent interpreter instance
pub struct Script {
    runtime: Rc<Runtime>,
    options: ScriptOptions,
}

impl Script {
    pub fn new(options: ScriptOptions) -> Self {
        let runtime = Runtime::new(&options);
        register_stdlib(&runtime, options.stdlib);
        Self { runtime, options }
    }

    pub fn with_version(version: LuaVersion) -> Self {
        Self::new(ScriptOptions::with_version(version))
    }

    pub fn options(&self) -> &ScriptOptions {
        &self.options
    }

    pub fn profile(&self) -> &'static CompatibilityProfile {
        self.runtime.profile()
    }

    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    /// Compiles `code` into a callable main-chunk function
    pub fn load_string(&self, code: &str, chunk_name: Option<&str>) -> LuaResult<Value> {
        let name = match chunk_name {
            Some(name) => name.to_string(),
            None => self.runtime.next_chunk_name(),
        };
        self.runtime.load(code, &name)
    }

    /// Compiles and runs `code`, returning its results
    pub fn do_string(&self, code: &str) -> LuaResult<Value> {
        let function = self.load_string(code, None)?;
        self.call(&function, Vec::new())
    }

    /// Calls any callable value from the host
    pub fn call(&self, function: &Value, args: Vec<Value>) -> LuaResult<Value> {
        let mut processor = Processor::new(Rc::clone(&self.runtime), None);
        let result = processor.call_function(function, args);
        if let Err(err) = &result {
            log::debug!("uncaught error: {}", err.decorated_message);
            self.runtime.offer_exception(err);
        }
        self.runtime.notify_execution_ended();
        result
    }

    pub fn globals(&self) -> &TableRef {
        self.runtime.globals()
    }

    pub fn set_global(&self, name: &str, value: Value) {
        self.runtime.globals().borrow_mut().set_str(name, value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.runtime.globals().borrow().get_str(name)
    }

    /// Exposes a host closure to scripts as the global `name`
    pub fn register_function(&self, name: &str, function: Rc<NativeFn>) {
        let native = Value::native(name, move |caller, args| function(caller, args));
        self.set_global(name, native);
    }

    /// A suspended coroutine running `function`, resumable by scripts or the host
    pub fn create_coroutine(&self, function: Value) -> Value {
        Value::Thread(Coroutine::new(Rc::clone(&self.runtime), function))
    }

    pub fn attach_debugger(&self, hook: Box<dyn DebuggerHook>) {
        self.runtime.attach_debugger(hook);
    }

    pub fn detach_debugger(&self) -> Option<Box<dyn DebuggerHook>> {
        self.runtime.detach_debugger()
    }

    pub fn disassemble(&self) -> String {
        self.runtime.disassemble()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.runtime.cache_stats()
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::new(ScriptOptions::default())
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").field("runtime", &self.runtime).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, LuaError};
    use crate::vm::ValueCaller;

    #[test]
    fn host_functions_are_callable_from_scripts() {
        let script = Script::default();
        script.register_function(
            "twice",
            Rc::new(|_: &mut dyn ValueCaller, args: Vec<Value>| -> LuaResult<Value> {
                let n = args.first().and_then(Value::to_integer).ok_or_else(|| LuaError::runtime("number expected"))?;
                Ok(Value::integer(n * 2))
            }),
        );
        assert_eq!(script.do_string("return twice(21)").unwrap(), Value::integer(42));
    }

    #[test]
    fn globals_are_shared_with_the_host() {
        let script = Script::default();
        script.set_global("answer", Value::integer(41));
        script.do_string("answer = answer + 1").unwrap();
        assert_eq!(script.get_global("answer"), Value::integer(42));
    }

    #[test]
    fn loaded_chunks_run_on_each_call() {
        let script = Script::default();
        let chunk = script.load_string("counter = (counter or 0) + 1 return counter", Some("count")).unwrap();
        script.call(&chunk, Vec::new()).unwrap();
        assert_eq!(script.call(&chunk, Vec::new()).unwrap(), Value::integer(2));
    }

    #[test]
    fn syntax_errors_surface_from_load() {
        let script = Script::default();
        let err = script.load_string("local = 1", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
    }

    #[test]
    fn host_created_coroutines_resume_from_scripts() {
        let script = Script::default();
        let body = script.load_string("coroutine.yield(1) return 2", None).unwrap();
        script.set_global("co", script.create_coroutine(body));
        let result = script
            .do_string("local _, a = coroutine.resume(co) local _, b = coroutine.resume(co) return a + b")
            .unwrap();
        assert_eq!(result, Value::integer(3));
    }
}
