// Lunar end-to-end tests
// Drive whole scripts through the public Script API

use std::cell::RefCell;
use std::rc::Rc;

use lunar_core::debugger::{DebuggerAction, DebuggerCaps, DebuggerHook, SourceDescriptor};
use lunar_core::error::SourceRef;
use lunar_core::{ErrorKind, LuaError, LuaVersion, Script, ScriptOptions, Value};

fn run(code: &str) -> Vec<Value> {
    run_in(LuaVersion::Lua54, code)
}

fn run_in(version: LuaVersion, code: &str) -> Vec<Value> {
    let script = Script::with_version(version);
    match script.do_string(code) {
        Ok(value) => value.tuple_values(),
        Err(err) => panic!("script failed: {}", err.decorated_message),
    }
}

fn fail_in(version: LuaVersion, code: &str) -> LuaError {
    let script = Script::with_version(version);
    match script.do_string(code) {
        Ok(value) => panic!("script succeeded with {}", value),
        Err(err) => err,
    }
}

fn int(i: i64) -> Value {
    Value::integer(i)
}

fn text(s: &str) -> Value {
    Value::string(s)
}

// ==================== Compilation cache ====================

#[test]
fn identical_sources_compile_once_per_version() {
    let script = Script::default();
    let first = script.load_string("return 40 + 2", Some("a")).unwrap();
    let second = script.load_string("return 40 + 2", Some("b")).unwrap();
    match (&first, &second) {
        (Value::Function(a), Value::Function(b)) => assert_eq!(a.entry, b.entry),
        _ => panic!("chunks load as functions"),
    }
    let stats = script.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(script.call(&second, Vec::new()).unwrap(), int(42));
}

#[test]
fn disabled_cache_recompiles() {
    let options = ScriptOptions {
        cache_capacity: 0,
        ..ScriptOptions::default()
    };
    let script = Script::new(options);
    script.load_string("return 1", None).unwrap();
    script.load_string("return 1", None).unwrap();
    assert_eq!(script.cache_stats().hits, 0);
}

// ==================== Loops ====================

#[test]
fn numeric_for_bounds_are_fixed_at_entry() {
    let result = run("local n = 0 for i = 1, 3 do i = i * 10 n = n + 1 end return n");
    assert_eq!(result, vec![int(3)]);

    let result = run("local limit, n = 3, 0 for i = 1, limit do limit = 10 n = n + 1 end return n");
    assert_eq!(result, vec![int(3)]);
}

#[test]
fn numeric_for_with_negative_and_float_steps() {
    assert_eq!(run("local s = 0 for i = 10, 1, -3 do s = s + i end return s"), vec![int(22)]);
    assert_eq!(run("local n = 0 for x = 0, 1, 0.25 do n = n + 1 end return n"), vec![int(5)]);
    let err = fail_in(LuaVersion::Lua54, "for i = 1, 10, 0 do end");
    assert!(err.message.contains("'for' step is zero"));
}

#[test]
fn ipairs_sums_a_sequence() {
    let result = run("local t={1,2,3}; local s=0; for i,v in ipairs(t) do s=s+v end; return s");
    assert_eq!(result, vec![int(6)]);
}

#[test]
fn pairs_visits_every_key() {
    let result = run(
        "local t = {10, 20, x = 1, y = 2} local keys, sum = 0, 0 \
         for k, v in pairs(t) do keys = keys + 1 sum = sum + v end return keys, sum",
    );
    assert_eq!(result, vec![int(4), int(33)]);
}

#[test]
fn while_repeat_and_break() {
    let result = run(
        "local i = 0 while true do i = i + 1 if i == 5 then break end end \
         local j = 0 repeat local k = j j = j + 1 until k >= 3 return i, j",
    );
    assert_eq!(result, vec![int(5), int(4)]);
}

#[test]
fn closures_capture_a_fresh_loop_variable_per_iteration() {
    let result = run(
        "local fs = {} for i = 1, 3 do fs[i] = function() return i end end \
         return fs[1]() + fs[2]() + fs[3]()",
    );
    assert_eq!(result, vec![int(6)]);
}

// ==================== goto ====================

#[test]
fn goto_into_the_scope_of_a_local_is_rejected() {
    let script = Script::with_version(LuaVersion::Lua54);
    let err = script.load_string("goto a; local x = 1; ::a::", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SyntaxError);
    assert!(err.message.contains("jumps into the scope of local 'x'"));
}

#[test]
fn label_at_block_end_is_exempt_before_lua54() {
    let script = Script::with_version(LuaVersion::Lua52);
    assert!(script.load_string("goto a; local x = 1; ::a::", None).is_ok());
}

#[test]
fn label_before_until_is_not_at_block_end() {
    let code = "local i = 0 repeat i = i + 1 goto a local x = 'never assigned' ::a:: until x or i > 2 return i";
    for version in [LuaVersion::Lua52, LuaVersion::Lua53, LuaVersion::Lua54] {
        let script = Script::with_version(version);
        let err = script.load_string(code, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert!(err.message.contains("jumps into the scope of local 'x'"), "{:?}", version);
    }
    let result = run_in(LuaVersion::Lua53, "local i = 0 repeat i = i + 1 goto a ::a:: until i > 2 return i");
    assert_eq!(result, vec![int(3)]);
}

#[test]
fn goto_is_an_identifier_in_lua51() {
    assert_eq!(run_in(LuaVersion::Lua51, "local goto = 3 return goto"), vec![int(3)]);
}

#[test]
fn goto_implements_continue() {
    let result = run(
        "local s = 0 for i = 1, 5 do if i % 2 == 0 then goto continue end s = s + i ::continue:: end return s",
    );
    assert_eq!(result, vec![int(9)]);
}

#[test]
fn backward_goto_loops() {
    let result = run("local i = 0 ::top:: i = i + 1 if i < 4 then goto top end return i");
    assert_eq!(result, vec![int(4)]);
}

// ==================== Coroutines ====================

#[test]
fn coroutine_round_trip() {
    let script = Script::default();
    script
        .do_string("co = coroutine.create(function() coroutine.yield(1); return 2 end)")
        .unwrap();
    let first = script.do_string("return coroutine.resume(co)").unwrap();
    assert_eq!(first.tuple_values(), vec![Value::Boolean(true), int(1)]);
    let second = script.do_string("return coroutine.resume(co)").unwrap();
    assert_eq!(second.tuple_values(), vec![Value::Boolean(true), int(2)]);
    let third = script.do_string("return coroutine.resume(co)").unwrap();
    assert_eq!(third.tuple_get(0), Value::Boolean(false));
    assert_eq!(third.tuple_get(1), text("cannot resume dead coroutine"));
}

#[test]
fn coroutine_locals_survive_yields() {
    let result = run(
        "local co = coroutine.create(function(a) local b = a * 2 local c = coroutine.yield(b) return a + b + c end) \
         local _, x = coroutine.resume(co, 5) local _, y = coroutine.resume(co, 100) return x, y",
    );
    assert_eq!(result, vec![int(10), int(115)]);
}

#[test]
fn coroutine_status_and_wrap() {
    let result = run(
        "local co co = coroutine.create(function() return coroutine.status(co) end) \
         local before = coroutine.status(co) local _, inside = coroutine.resume(co) \
         local gen = coroutine.wrap(function() for i = 1, 3 do coroutine.yield(i) end end) \
         return before, inside, coroutine.status(co), gen() + gen() + gen()",
    );
    assert_eq!(result, vec![text("suspended"), text("running"), text("dead"), int(6)]);
}

#[test]
fn wrap_raises_errors_and_resume_reports_them() {
    let result = run(
        "local co = coroutine.create(function() error('bad', 0) end) \
         local ok, msg = coroutine.resume(co) \
         local w = coroutine.wrap(function() error('worse', 0) end) \
         local ok2, msg2 = pcall(w) return ok, msg, ok2, msg2",
    );
    assert_eq!(result, vec![Value::Boolean(false), text("bad"), Value::Boolean(false), text("worse")]);
}

#[test]
fn yield_outside_a_coroutine_fails() {
    let err = fail_in(LuaVersion::Lua54, "coroutine.yield(1)");
    assert!(err.message.contains("attempt to yield from outside a coroutine"));
}

#[test]
fn yield_across_a_sort_comparator_fails() {
    let result = run(
        "local co = coroutine.create(function() table.sort({3, 2, 1}, function(a, b) coroutine.yield() return a < b end) end) \
         local ok, msg = coroutine.resume(co) return ok, msg",
    );
    assert_eq!(result[0], Value::Boolean(false));
    assert!(result[1].to_display_string().contains("attempt to yield across a C-call boundary"));
}

#[test]
fn coroutine_close_runs_pending_close_handlers() {
    let result = run(
        "local closed = false \
         local co = coroutine.create(function() \
           local x <close> = setmetatable({}, {__close = function() closed = true end}) \
           coroutine.yield() end) \
         coroutine.resume(co) local ok = coroutine.close(co) return ok, closed, coroutine.status(co)",
    );
    assert_eq!(result, vec![Value::Boolean(true), Value::Boolean(true), text("dead")]);
}

#[test]
fn running_and_isyieldable() {
    let result = run(
        "local main, ismain = coroutine.running() \
         local co = coroutine.create(function() return coroutine.isyieldable() end) \
         local _, y = coroutine.resume(co) return ismain, coroutine.isyieldable(), y",
    );
    assert_eq!(result, vec![Value::Boolean(true), Value::Boolean(false), Value::Boolean(true)]);
}

// ==================== Errors ====================

#[test]
fn pcall_catches_error_with_location() {
    let result = run("local ok, err = pcall(function() error(\"boom\") end); return ok, err");
    assert_eq!(result[0], Value::Boolean(false));
    let message = result[1].to_display_string();
    assert!(message.ends_with("boom"));
    assert!(message.contains(":1:"));
}

#[test]
fn error_values_pass_through_pcall() {
    let result = run("local ok, err = pcall(error, {code = 7}) return ok, err.code");
    assert_eq!(result, vec![Value::Boolean(false), int(7)]);
}

#[test]
fn xpcall_runs_the_handler() {
    let result = run(
        "local ok, msg = xpcall(function() error('x', 0) end, function(m) return 'handled ' .. m end) return ok, msg",
    );
    assert_eq!(result, vec![Value::Boolean(false), text("handled x")]);
}

#[test]
fn pcall_returns_all_results_on_success() {
    assert_eq!(
        run("return pcall(function(a, b) return a + b, a * b end, 3, 4)"),
        vec![Value::Boolean(true), int(7), int(12)]
    );
}

#[test]
fn uncaught_errors_carry_a_decorated_message() {
    let err = fail_in(LuaVersion::Lua54, "local t = nil\nreturn t.x");
    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert!(err.message.contains("attempt to index a nil value"));
    assert!(err.decorated_message.contains(":2:"));
}

#[test]
fn arithmetic_on_wrong_types_fails() {
    let err = fail_in(LuaVersion::Lua54, "return {} + 1");
    assert!(err.message.contains("attempt to perform arithmetic on a table value"));
    let err = fail_in(LuaVersion::Lua54, "return 1 < 'x'");
    assert!(err.message.contains("attempt to compare number with string"));
}

#[test]
fn runaway_recursion_is_a_stack_overflow() {
    let options = ScriptOptions {
        max_call_depth: 500,
        ..ScriptOptions::default()
    };
    let script = Script::new(options);
    let err = script.do_string("local function f() return 1 + f() end return f()").unwrap_err();
    assert!(err.message.contains("stack overflow"));
}

#[test]
fn nested_coroutine_resumes_hit_the_native_limit() {
    let options = ScriptOptions {
        max_native_depth: 12,
        ..ScriptOptions::default()
    };
    let script = Script::new(options);
    let code = "local function mk(n) return coroutine.create(function() \
                  if n == 0 then return 'bottom' end \
                  local ok, v = coroutine.resume(mk(n - 1)) return v end) end \
                return coroutine.resume(mk(%N%))";
    let shallow = script.do_string(&code.replace("%N%", "3")).unwrap().tuple_values();
    assert_eq!(shallow, vec![Value::Boolean(true), text("bottom")]);

    let deep = script.do_string(&code.replace("%N%", "10000")).unwrap().tuple_values();
    assert_eq!(deep[0], Value::Boolean(true));
    assert!(deep[1].to_display_string().contains("stack overflow"));
}

#[test]
fn protected_calls_reached_by_tail_calls_still_nest() {
    let result = run(
        "local function f() return pcall(f) end \
         local r = table.pack(f()) \
         return r.n > 2, r[1], r[r.n - 1], tostring(r[r.n])",
    );
    assert_eq!(result[..3], [Value::Boolean(true), Value::Boolean(true), Value::Boolean(false)]);
    assert!(result[3].to_display_string().contains("stack overflow"));
}

#[test]
fn tail_calls_do_not_grow_the_stack() {
    let options = ScriptOptions {
        max_call_depth: 200,
        ..ScriptOptions::default()
    };
    let script = Script::new(options);
    let result = script
        .do_string("local function loop(n) if n == 0 then return 'done' end return loop(n - 1) end return loop(10000)")
        .unwrap();
    assert_eq!(result, text("done"));
}

// ==================== Version profiles ====================

#[test]
fn lua52_exposes_bit32_but_not_table_move() {
    let result = run_in(LuaVersion::Lua52, "return bit32 ~= nil, table.move == nil, bit32.lshift(1, 4)");
    assert_eq!(result, vec![Value::Boolean(true), Value::Boolean(true), int(16)]);
}

#[test]
fn lua54_accepts_const_and_close_locals() {
    let result = run(
        "local closed = false \
         do local c <const> = 5 local h <close> = setmetatable({}, {__close = function() closed = true end}) end \
         return closed",
    );
    assert_eq!(result, vec![Value::Boolean(true)]);

    let script = Script::with_version(LuaVersion::Lua54);
    let err = script.load_string("local x <const> = 1; x = 2", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SyntaxError);
    assert!(err.message.contains("attempt to assign to const variable 'x'"));
}

#[test]
fn lua53_rejects_attributes() {
    let script = Script::with_version(LuaVersion::Lua53);
    assert!(script.load_string("local x <const> = 1", None).is_err());
}

#[test]
fn bitwise_operators_start_at_lua53() {
    assert_eq!(run_in(LuaVersion::Lua53, "return 6 & 3, 6 | 3, 6 ~ 3, ~0, 1 << 4, 256 >> 4, 7 // 2"), vec![
        int(2),
        int(7),
        int(5),
        int(-1),
        int(16),
        int(16),
        int(3)
    ]);
    let script = Script::with_version(LuaVersion::Lua52);
    assert!(script.load_string("return 1 & 2", None).is_err());
}

#[test]
fn integer_subtype_depends_on_version() {
    assert_eq!(run_in(LuaVersion::Lua53, "return math.type(1), math.type(1.0), 3 / 1"), vec![
        text("integer"),
        text("float"),
        Value::float(3.0)
    ]);
    assert_eq!(run_in(LuaVersion::Lua51, "return tostring(3 / 1), tostring(7 / 2)"), vec![text("3"), text("3.5")]);
    assert_eq!(run_in(LuaVersion::Lua54, "return tostring(3 / 1)"), vec![text("3.0")]);
}

#[test]
fn unpack_moved_from_global_to_table() {
    assert_eq!(run_in(LuaVersion::Lua51, "return unpack({1, 2})"), vec![int(1), int(2)]);
    assert_eq!(run_in(LuaVersion::Lua53, "return table.unpack({1, 2}), unpack == nil"), vec![
        int(1),
        Value::Boolean(true)
    ]);
    assert_eq!(run_in(LuaVersion::Lua53, "return unpack == nil, table.unpack({1, 2})"), vec![
        Value::Boolean(true),
        int(1),
        int(2)
    ]);
}

#[test]
fn version_string_matches_profile() {
    let expected = [
        (LuaVersion::Lua51, "Lua 5.1"),
        (LuaVersion::Lua52, "Lua 5.2"),
        (LuaVersion::Lua53, "Lua 5.3"),
        (LuaVersion::Lua54, "Lua 5.4"),
        (LuaVersion::Lua55, "Lua 5.5"),
        (LuaVersion::Latest, "Lua 5.4"),
    ];
    for (version, name) in expected {
        assert_eq!(run_in(version, "return _VERSION"), vec![text(name)], "{:?}", version);
    }
}

#[test]
fn utf8_library_from_lua53() {
    assert_eq!(run_in(LuaVersion::Lua53, "return utf8.char(72, 8364), utf8.len('h€')"), vec![
        text("H€"),
        int(2)
    ]);
    assert_eq!(run_in(LuaVersion::Lua52, "return utf8 == nil"), vec![Value::Boolean(true)]);
}

// ==================== Values and metatables ====================

#[test]
fn multiple_returns_expand_only_in_last_position() {
    let result = run(
        "local function f() return 1, 2, 3 end \
         local t = {f(), f()} return #t, select('#', f()), (f())",
    );
    assert_eq!(result, vec![int(4), int(3), int(1)]);
}

#[test]
fn varargs_and_select() {
    let result = run("local function f(...) local a, b = ... return select('#', ...), a, b, select(2, ...) end return f(4, 5, 6)");
    assert_eq!(result, vec![int(3), int(4), int(5), int(5), int(6)]);
}

#[test]
fn select_rejects_out_of_range_negative_indices() {
    let err = fail_in(LuaVersion::Lua54, "return select(math.mininteger, 1)");
    assert!(err.message.contains("bad argument #1 to 'select' (index out of range)"));
    let err = fail_in(LuaVersion::Lua54, "return select(-3, 1, 2)");
    assert!(err.message.contains("index out of range"));
    assert_eq!(run("return select(-2, 1, 2, 3)"), vec![int(2), int(3)]);
}

#[test]
fn long_flat_operator_chains_compile() {
    let result = run("return load('return 1' .. string.rep(' + 1', 20000))()");
    assert_eq!(result, vec![int(20001)]);

    let result = run("return load('local n = 0 return n' .. string.rep(' or n', 20000))()");
    assert_eq!(result, vec![int(0)]);
}

#[test]
fn long_suffix_chains_compile() {
    let result = run(
        "local t = {} t.t = t          local f = load('local t = ... return t' .. string.rep('.t', 20000) .. ' == t')          return f(t)",
    );
    assert_eq!(result, vec![Value::Boolean(true)]);
}

#[test]
fn metatables_drive_operators_and_indexing() {
    let result = run(
        "local V = {} V.__index = V \
         V.__add = function(a, b) return setmetatable({x = a.x + b.x}, V) end \
         V.__eq = function(a, b) return a.x == b.x end \
         V.__lt = function(a, b) return a.x < b.x end \
         V.__tostring = function(v) return 'V(' .. v.x .. ')' end \
         V.__len = function() return 99 end \
         function V.get(self) return self.x end \
         local a, b = setmetatable({x = 1}, V), setmetatable({x = 2}, V) \
         local c = a + b \
         return c:get(), tostring(c), a == setmetatable({x = 1}, V), a < b, #a",
    );
    assert_eq!(result, vec![int(3), text("V(3)"), Value::Boolean(true), Value::Boolean(true), int(99)]);
}

#[test]
fn index_and_newindex_functions() {
    let result = run(
        "local log = {} \
         local t = setmetatable({}, { \
           __index = function(_, k) return k .. '!' end, \
           __newindex = function(t, k, v) rawset(t, k, v * 2) log[#log + 1] = k end }) \
         t.a = 5 return t.a, t.b, #log",
    );
    assert_eq!(result, vec![int(10), text("b!"), int(1)]);
}

#[test]
fn call_metamethod_makes_tables_callable() {
    let result = run("local t = setmetatable({}, {__call = function(self, a) return a + 1 end}) return t(41)");
    assert_eq!(result, vec![int(42)]);
}

#[test]
fn call_metamethods_chain_through_callable_tables() {
    let result = run(
        "local inner = setmetatable({}, {__call = function(self, outer, a) return a * 2 end}) \
         local outer = setmetatable({}, {__call = inner}) \
         return outer(21)",
    );
    assert_eq!(result, vec![int(42)]);
    let err = fail_in(LuaVersion::Lua54, "local t = setmetatable({}, {__call = 5}) return t()");
    assert!(err.message.contains("attempt to call a number value"));
}

#[test]
fn assignment_through_a_nil_field_names_the_field() {
    let err = fail_in(LuaVersion::Lua54, "local t = {} t.x.y = 1");
    assert!(err.message.contains("attempt to index a nil value (field 'x')"));
    let err = fail_in(LuaVersion::Lua54, "local t = {} t.x[1] = 1");
    assert!(err.message.contains("(field 'x')"));
}

#[test]
fn protected_metatables() {
    let result = run(
        "local t = setmetatable({}, {__metatable = 'locked'}) \
         local ok = pcall(setmetatable, t, {}) return getmetatable(t), ok",
    );
    assert_eq!(result, vec![text("locked"), Value::Boolean(false)]);
}

#[test]
fn string_methods_through_the_string_metatable() {
    assert_eq!(run("return ('abc'):upper(), ('x'):rep(3, ',')"), vec![text("ABC"), text("x,x,x")]);
}

#[test]
fn concat_and_coercion() {
    assert_eq!(run("return 1 .. 2, '10' + 5, 2^10"), vec![text("12"), int(15), Value::float(1024.0)]);
}

#[test]
fn integer_division_and_modulo_follow_floor_semantics() {
    assert_eq!(run("return 7 // -2, -7 % 3, 7 % -3, 5.5 % 2"), vec![int(-4), int(2), int(-2), Value::float(1.5)]);
    let err = fail_in(LuaVersion::Lua54, "return 1 // 0");
    assert!(err.message.contains("attempt to perform 'n//0'"));
}

// ==================== Standard library ====================

#[test]
fn string_find_match_and_gsub() {
    let result = run(
        "local s = 'hello world from lua' \
         local i, j = s:find('world') \
         local word = s:match('(%a+)$') \
         local replaced, n = s:gsub('o', '0') \
         return i, j, word, replaced, n, ('a.b'):find('.', 1, true)",
    );
    assert_eq!(result, vec![int(7), int(11), text("lua"), text("hell0 w0rld fr0m lua"), int(3), int(2), int(2)]);
}

#[test]
fn gmatch_iterates_captures() {
    let result = run(
        "local out = {} for k, v in ('a=1, b=2'):gmatch('(%w+)=(%w+)') do out[#out + 1] = k .. v end \
         return table.concat(out, ';')",
    );
    assert_eq!(result, vec![text("a1;b2")]);
}

#[test]
fn string_format_conversions() {
    let result = run("return string.format('%5.2f|%d|%x|%s|%q|%-3s|', 3.14159, 42, 255, true, 'a\\nb', 'z')");
    assert_eq!(result, vec![text(" 3.14|42|ff|true|\"a\\\nb\"|z  |")]);
}

#[test]
fn string_byte_char_sub_reverse() {
    let result = run("return ('ABC'):byte(1, -1), string.char(104, 105), ('hello'):sub(-3), ('abc'):reverse()");
    assert_eq!(result, vec![int(65), text("hi"), text("llo"), text("cba")]);
    assert_eq!(run("return ('ABC'):byte(1, -1)"), vec![int(65), int(66), int(67)]);
}

#[test]
fn table_sort_with_and_without_comparator() {
    let result = run(
        "local t = {5, 2, 8, 1, 9, 3} table.sort(t) local a = table.concat(t, ',') \
         table.sort(t, function(x, y) return x > y end) return a, table.concat(t, ',')",
    );
    assert_eq!(result, vec![text("1,2,3,5,8,9"), text("9,8,5,3,2,1")]);
}

#[test]
fn table_sort_rejects_mixed_types() {
    let err = fail_in(LuaVersion::Lua54, "table.sort({1, 'a', 2})");
    assert!(err.message.contains("attempt to compare"));
}

#[test]
fn table_insert_remove_pack_move() {
    let result = run(
        "local t = {1, 2, 3} table.insert(t, 4) table.insert(t, 1, 0) local r = table.remove(t) \
         local p = table.pack('a', nil, 'c') local m = table.move({1, 2, 3}, 1, 3, 2) \
         return table.concat(t, ','), r, p.n, table.concat(m, ',')",
    );
    assert_eq!(result, vec![text("0,1,2,3"), int(4), int(3), text("1,1,2,3")]);
}

#[test]
fn math_functions() {
    let result = run(
        "return math.floor(3.7), math.ceil(3.2), math.max(1, 9, 4), math.min(2, -1), math.abs(-5), \
         math.tointeger(4.0), math.fmod(7, 3), math.huge > 1e308",
    );
    assert_eq!(result, vec![int(3), int(4), int(9), int(-1), int(5), int(4), int(1), Value::Boolean(true)]);
}

#[test]
fn seeded_random_is_reproducible() {
    let result = run(
        "math.randomseed(42) local a = {math.random(100), math.random(100)} \
         math.randomseed(42) local b = {math.random(100), math.random(100)} \
         local r = math.random() \
         return a[1] == b[1] and a[2] == b[2], r >= 0 and r < 1, pcall(math.random, 5, 1)",
    );
    assert_eq!(result[0], Value::Boolean(true));
    assert_eq!(result[1], Value::Boolean(true));
    assert_eq!(result[2], Value::Boolean(false));
}

#[test]
fn tonumber_and_tostring() {
    let result = run("return tonumber('0x10'), tonumber('z', 36), tonumber('1e2'), tonumber('nope'), tostring(nil)");
    assert_eq!(result, vec![int(16), int(35), Value::float(100.0), Value::Nil, text("nil")]);
}

#[test]
fn load_compiles_chunks_at_runtime() {
    let result = run(
        "local f = load('return 1 + ...') local g, err = load('return +') \
         local parts, i = {'return ', '7'}, 0 \
         local h = load(function() i = i + 1 return parts[i] end) \
         return f(41), g, type(err), h()",
    );
    assert_eq!(result, vec![int(42), Value::Nil, text("string"), int(7)]);
}

#[test]
fn os_time_and_date() {
    let result = run(
        "local t = os.time({year = 2024, month = 1, day = 1, hour = 0}) \
         local d = os.date('*t', t) return d.year, d.month, d.day, type(os.clock()), os.date('!%Y', 0)",
    );
    assert_eq!(result, vec![int(2024), int(1), int(1), text("number"), text("1970")]);
}

#[test]
fn disabled_modules_are_not_registered() {
    let mut options = ScriptOptions::default();
    options.stdlib.os = false;
    options.stdlib.math = false;
    let script = Script::new(options);
    assert_eq!(script.do_string("return os == nil, math == nil, string ~= nil").unwrap().tuple_values(), vec![
        Value::Boolean(true),
        Value::Boolean(true),
        Value::Boolean(true)
    ]);
}

// ==================== Host API ====================

#[test]
fn host_functions_receive_and_return_multiple_values() {
    let script = Script::default();
    script.register_function(
        "swap",
        Rc::new(|_: &mut dyn lunar_core::ValueCaller, args: Vec<Value>| -> lunar_core::LuaResult<Value> {
            let mut args = args;
            args.reverse();
            Ok(Value::from_values(args))
        }),
    );
    assert_eq!(script.do_string("return swap(1, 2)").unwrap().tuple_values(), vec![int(2), int(1)]);
}

#[test]
fn host_functions_can_call_back_into_scripts() {
    let script = Script::default();
    script.register_function(
        "apply",
        Rc::new(|caller: &mut dyn lunar_core::ValueCaller, args: Vec<Value>| -> lunar_core::LuaResult<Value> {
            let f = args.first().cloned().unwrap_or_default();
            caller.call(&f, args.into_iter().skip(1).collect())
        }),
    );
    assert_eq!(script.do_string("return apply(function(x) return x * 3 end, 14)").unwrap(), int(42));
}

#[test]
fn script_functions_are_callable_from_the_host() {
    let script = Script::default();
    script.do_string("function add(a, b) return a + b end").unwrap();
    let add = script.get_global("add");
    assert_eq!(script.call(&add, vec![int(2), int(3)]).unwrap(), int(5));
}

#[test]
fn disassembly_lists_instructions() {
    let script = Script::default();
    script.load_string("local x = 1 return x", None).unwrap();
    let listing = script.disassemble();
    assert!(listing.contains("RET"));
}

// ==================== Debugger ====================

#[derive(Default)]
struct Recorded {
    sources: Vec<String>,
    lines: Vec<u32>,
    exceptions: usize,
    ended: usize,
}

struct RecordingHook(Rc<RefCell<Recorded>>);

impl DebuggerHook for RecordingHook {
    fn capabilities(&self) -> DebuggerCaps {
        DebuggerCaps::default()
    }

    fn request_action(&mut self, _ip: usize, source_ref: SourceRef) -> DebuggerAction {
        self.0.borrow_mut().lines.push(source_ref.from_line);
        DebuggerAction::StepIn
    }

    fn notify_source_loaded(&mut self, source: &SourceDescriptor) {
        self.0.borrow_mut().sources.push(source.name.clone());
    }

    fn notify_execution_ended(&mut self) {
        self.0.borrow_mut().ended += 1;
    }

    fn notify_runtime_exception(&mut self, _error: &LuaError) -> bool {
        self.0.borrow_mut().exceptions += 1;
        false
    }
}

#[test]
fn debugger_hook_sees_sources_steps_and_errors() {
    let script = Script::default();
    let recorded = Rc::new(RefCell::new(Recorded::default()));
    script.attach_debugger(Box::new(RecordingHook(Rc::clone(&recorded))));

    let chunk = script.load_string("local a = 1\nlocal b = 2\nreturn a + b", Some("steps")).unwrap();
    assert_eq!(script.call(&chunk, Vec::new()).unwrap(), int(3));
    let _ = script.do_string("error('stop')");

    let recorded = recorded.borrow();
    assert!(recorded.sources.contains(&"steps".to_string()));
    assert!(recorded.lines.contains(&2));
    assert_eq!(recorded.exceptions, 1);
    assert_eq!(recorded.ended, 2);

    assert!(script.detach_debugger().is_some());
}
