// Lunar Table Library
// Provides: insert, remove, concat, unpack, pack, sort, move

use rustc_hash::FxHashMap;

use super::{arg, check_integer, check_table, library_table, opt_integer, values, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::profile::CompatibilityProfile;
use crate::vm::{Table, Value, ValueCaller};

pub fn create_table_lib(profile: &CompatibilityProfile) -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("insert", insert);
    functions.insert("remove", remove);
    functions.insert("concat", concat);
    functions.insert("sort", sort);
    if !profile.global_unpack {
        functions.insert("unpack", unpack);
        functions.insert("pack", pack);
    }
    if profile.table_move {
        functions.insert("move", move_elements);
    }

    library_table(functions)
}

fn insert(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "insert")?;
    let len = table.borrow().len() as i64;
    match args.len() {
        2 => table.borrow_mut().set_int(len + 1, arg(&args, 1)),
        3 => {
            let pos = check_integer(&args, 1, "insert")?;
            if pos < 1 || pos > len + 1 {
                return Err(LuaError::bad_argument(2, "insert", "position out of bounds"));
            }
            table.borrow_mut().insert(pos, arg(&args, 2));
        }
        _ => return Err(LuaError::runtime("wrong number of arguments to 'insert'")),
    }
    Ok(Value::Void)
}

fn remove(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "remove")?;
    let len = table.borrow().len() as i64;
    let pos = opt_integer(&args, 1, "remove", len)?;
    if pos != len && (pos < 1 || pos > len + 1) {
        return Err(LuaError::bad_argument(2, "remove", "position out of bounds"));
    }
    let removed = table.borrow_mut().remove(pos);
    Ok(removed)
}

fn concat(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "concat")?;
    let separator = super::opt_string(&args, 1, "concat")?;
    let first = opt_integer(&args, 2, "concat", 1)?;
    let last = match arg(&args, 3) {
        Value::Nil => table.borrow().len() as i64,
        _ => check_integer(&args, 3, "concat")?,
    };

    let table = table.borrow();
    let mut output = Vec::new();
    let mut i = first;
    while i <= last {
        match table.get_int(i).to_lua_bytes() {
            Some(bytes) => output.extend_from_slice(&bytes),
            None => {
                return Err(LuaError::runtime(format!(
                    "invalid value (at index {}) in table for 'concat'",
                    i
                )))
            }
        }
        if i < last {
            if let Some(sep) = &separator {
                output.extend_from_slice(sep);
            }
        }
        i += 1;
    }
    Ok(Value::from_bytes(output))
}

/// `table.unpack`, and the global `unpack` of 5.1
pub(crate) fn unpack(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "unpack")?;
    let first = opt_integer(&args, 1, "unpack", 1)?;
    let last = match arg(&args, 2) {
        Value::Nil => table.borrow().len() as i64,
        _ => check_integer(&args, 2, "unpack")?,
    };
    if first > last {
        return Ok(Value::Void);
    }
    if last.saturating_sub(first) >= 1_000_000 {
        return Err(LuaError::runtime("too many results to unpack"));
    }
    let table = table.borrow();
    Ok(values((first..=last).map(|i| table.get_int(i)).collect()))
}

fn pack(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let count = args.len() as i64;
    let mut table = Table::from_sequence(args);
    table.set_str("n", Value::integer(count));
    Ok(Value::table(table))
}

fn sort(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "sort")?;
    let comparator = arg(&args, 1);
    if !comparator.is_nil() && !comparator.is_function() {
        return Err(LuaError::bad_argument_type(2, "sort", "function", comparator.type_name()));
    }

    let items = table.borrow().sequence();
    let mut less = |a: &Value, b: &Value| -> LuaResult<bool> {
        if comparator.is_nil() {
            caller.less_than(a, b)
        } else {
            Ok(caller.call(&comparator, vec![a.clone(), b.clone()])?.is_truthy())
        }
    };
    let sorted = merge_sort(items, &mut less)?;

    let mut table = table.borrow_mut();
    for (i, value) in sorted.into_iter().enumerate() {
        table.set_int(i as i64 + 1, value);
    }
    Ok(Value::Void)
}

/// Stable merge sort whose comparator may fail
fn merge_sort<F>(items: Vec<Value>, less: &mut F) -> LuaResult<Vec<Value>>
where
    F: FnMut(&Value, &Value) -> LuaResult<bool>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let left = merge_sort(left, less)?;
    let right = merge_sort(right, less)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        if less(r, l)? {
            merged.extend(right.next());
        } else {
            merged.extend(left.next());
        }
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn move_elements(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let source = check_table(&args, 0, "move")?;
    let first = check_integer(&args, 1, "move")?;
    let last = check_integer(&args, 2, "move")?;
    let target_pos = check_integer(&args, 3, "move")?;
    let destination = match arg(&args, 4) {
        Value::Nil => source.clone(),
        _ => check_table(&args, 4, "move")?,
    };
    if last >= first {
        if first <= 0 && last >= i64::MAX + first {
            return Err(LuaError::bad_argument(3, "move", "too many elements to move"));
        }
        let count = last - first;
        if target_pos > i64::MAX - count {
            return Err(LuaError::bad_argument(4, "move", "destination wrap around"));
        }
        let moved: Vec<Value> = {
            let source = source.borrow();
            (first..=last).map(|i| source.get_int(i)).collect()
        };
        let mut destination = destination.borrow_mut();
        for (offset, value) in moved.into_iter().enumerate() {
            destination.set_int(target_pos + offset as i64, value);
        }
    }
    Ok(Value::Table(destination))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sort_is_stable_and_propagates_errors() {
        let items: Vec<Value> = [3, 1, 2, 1].iter().map(|&i| Value::integer(i)).collect();
        let mut by_value = |a: &Value, b: &Value| -> LuaResult<bool> {
            Ok(a.to_integer().unwrap_or(0) < b.to_integer().unwrap_or(0))
        };
        let sorted = merge_sort(items.clone(), &mut by_value).unwrap();
        let numbers: Vec<i64> = sorted.iter().filter_map(Value::to_integer).collect();
        assert_eq!(numbers, vec![1, 1, 2, 3]);

        let mut failing = |_: &Value, _: &Value| -> LuaResult<bool> {
            Err(LuaError::runtime("attempt to compare two table values"))
        };
        assert!(merge_sort(items, &mut failing).is_err());
    }

    #[test]
    fn move_is_only_in_lua53_and_later() {
        use crate::profile::LuaVersion;
        let lib52 = create_table_lib(CompatibilityProfile::for_version(LuaVersion::Lua52));
        assert!(lib52.get_str("move").is_nil());
        assert!(!lib52.get_str("pack").is_nil());
        let lib53 = create_table_lib(CompatibilityProfile::for_version(LuaVersion::Lua53));
        assert!(!lib53.get_str("move").is_nil());
    }
}
