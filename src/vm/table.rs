// Lunar Tables
// Array part plus an insertion-ordered hash part with stable `next` traversal

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::value::{Number, Value};
use crate::error::{LuaError, LuaResult};

pub type TableRef = Rc<RefCell<Table>>;

/// A normalized, hashable table key
#[derive(Clone, Debug)]
pub struct Key(Value);

impl Key {
    /// Normalizes integral floats to integers and rejects nil and NaN
    pub fn new(value: &Value) -> LuaResult<Key> {
        match value.to_scalar() {
            Value::Nil => Err(LuaError::runtime("table index is nil")),
            Value::Number(Number::Float(f)) if f.is_nan() => {
                Err(LuaError::runtime("table index is NaN"))
            }
            Value::Number(n) => Ok(Key(Value::Number(match n.as_integer() {
                Some(i) => Number::Integer(i),
                None => n,
            }))),
            other => Ok(Key(other)),
        }
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    fn as_integer(&self) -> Option<i64> {
        match self.0 {
            Value::Number(Number::Integer(i)) => Some(i),
            _ => None,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw_equals(&other.0)
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Boolean(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            Value::Number(Number::Integer(i)) => {
                1u8.hash(state);
                i.hash(state);
            }
            Value::Number(Number::Float(f)) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            other => {
                4u8.hash(state);
                other.address().hash(state);
            }
        }
    }
}

/// Lua table
#[derive(Default)]
pub struct Table {
    /// Values for keys 1..=array.len()
    array: Vec<Value>,
    /// Insertion-ordered hash entries; a nil value marks a removed entry
    entries: Vec<(Key, Value)>,
    index: FxHashMap<Key, usize>,
    removed: usize,
    pub metatable: Option<TableRef>,
}

/// Shallow: tables may reference themselves
impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("array", &self.array.len())
            .field("entries", &self.entries.len().saturating_sub(self.removed))
            .field("metatable", &self.metatable.is_some())
            .finish()
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self {
            array: Vec::with_capacity(array),
            entries: Vec::with_capacity(hash),
            index: FxHashMap::with_capacity_and_hasher(hash, Default::default()),
            ..Self::default()
        }
    }

    /// Builds a sequence table from values
    pub fn from_sequence(values: Vec<Value>) -> Self {
        let mut table = Self::new();
        for (i, value) in values.into_iter().enumerate() {
            table.set_int(i as i64 + 1, value);
        }
        table
    }

    pub fn get(&self, key: &Value) -> Value {
        match Key::new(key) {
            Ok(key) => self.get_key(&key),
            Err(_) => Value::Nil,
        }
    }

    fn get_key(&self, key: &Key) -> Value {
        if let Some(i) = key.as_integer() {
            return self.get_int(i);
        }
        self.index
            .get(key)
            .map(|&slot| self.entries[slot].1.clone())
            .unwrap_or(Value::Nil)
    }

    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1].clone();
        }
        let key = Key(Value::integer(i));
        self.index
            .get(&key)
            .map(|&slot| self.entries[slot].1.clone())
            .unwrap_or(Value::Nil)
    }

    pub fn get_str(&self, name: &str) -> Value {
        self.get_key(&Key(Value::string(name)))
    }

    pub fn set(&mut self, key: &Value, value: Value) -> LuaResult<()> {
        let key = Key::new(key)?;
        self.set_key(key, value);
        Ok(())
    }

    pub fn set_str(&mut self, name: &str, value: Value) {
        self.set_key(Key(Value::string(name)), value);
    }

    pub fn set_int(&mut self, i: i64, value: Value) {
        self.set_key(Key(Value::integer(i)), value);
    }

    fn set_key(&mut self, key: Key, value: Value) {
        let value = value.into_scalar();
        if let Some(i) = key.as_integer() {
            let len = self.array.len();
            if i >= 1 && (i as usize) <= len {
                self.array[i as usize - 1] = value;
                if i as usize == len {
                    self.trim_array();
                }
                return;
            }
            if i as usize == len + 1 && i >= 1 && !value.is_nil() {
                self.remove_hash(&key);
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }

        match self.index.get(&key) {
            Some(&slot) => {
                if value.is_nil() && !self.entries[slot].1.is_nil() {
                    self.removed += 1;
                } else if !value.is_nil() && self.entries[slot].1.is_nil() {
                    self.removed -= 1;
                }
                self.entries[slot].1 = value;
            }
            None => {
                if value.is_nil() {
                    return;
                }
                if self.removed > 8 && self.removed * 2 > self.entries.len() {
                    self.compact();
                }
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    fn remove_hash(&mut self, key: &Key) {
        if let Some(&slot) = self.index.get(key) {
            if !self.entries[slot].1.is_nil() {
                self.entries[slot].1 = Value::Nil;
                self.removed += 1;
            }
        }
    }

    fn trim_array(&mut self) {
        while matches!(self.array.last(), Some(v) if v.is_nil()) {
            self.array.pop();
        }
    }

    /// Moves keys len+1, len+2, ... from the hash part into the array part
    fn migrate_from_hash(&mut self) {
        loop {
            let next = Key(Value::integer(self.array.len() as i64 + 1));
            let Some(&slot) = self.index.get(&next) else {
                break;
            };
            let value = std::mem::take(&mut self.entries[slot].1);
            if value.is_nil() {
                break;
            }
            self.removed += 1;
            self.array.push(value);
        }
    }

    /// Drops removed entries; only done when inserting a new key
    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (slot, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(key.clone(), slot);
        }
        self.removed = 0;
    }

    /// Border of the sequence (`#t` without metamethods)
    pub fn len(&self) -> usize {
        if !self.array.is_empty() {
            return self.array.len();
        }
        let mut n = 0i64;
        while !self.get_int(n + 1).is_nil() {
            n += 1;
        }
        n as usize
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.entries.len() == self.removed
    }

    /// Successor of `key` in traversal order: array part first, then insertion order
    pub fn next(&self, key: &Value) -> LuaResult<Option<(Value, Value)>> {
        let start_entry = match key.to_scalar() {
            Value::Nil => {
                return Ok(self
                    .array_from(0)
                    .or_else(|| self.entries_from(0)));
            }
            other => {
                let key = Key::new(&other)?;
                match key.as_integer() {
                    Some(i) if i >= 1 && (i as usize) <= self.array.len() => {
                        return Ok(self
                            .array_from(i as usize)
                            .or_else(|| self.entries_from(0)));
                    }
                    _ => match self.index.get(&key) {
                        Some(&slot) => slot + 1,
                        None => return Err(LuaError::runtime("invalid key to 'next'")),
                    },
                }
            }
        };
        Ok(self.entries_from(start_entry))
    }

    fn array_from(&self, start: usize) -> Option<(Value, Value)> {
        self.array
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::integer(i as i64 + 1), v.clone()))
    }

    fn entries_from(&self, start: usize) -> Option<(Value, Value)> {
        self.entries
            .iter()
            .skip(start)
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.value().clone(), v.clone()))
    }

    /// Inserts at `pos`, shifting up `pos..=len`
    pub fn insert(&mut self, pos: i64, value: Value) {
        let len = self.len() as i64;
        let mut i = len;
        while i >= pos {
            let moved = self.get_int(i);
            self.set_int(i + 1, moved);
            i -= 1;
        }
        self.set_int(pos, value);
    }

    /// Removes at `pos`, shifting down `pos+1..=len`
    pub fn remove(&mut self, pos: i64) -> Value {
        let len = self.len() as i64;
        let removed = self.get_int(pos);
        for i in pos..len {
            let moved = self.get_int(i + 1);
            self.set_int(i, moved);
        }
        if pos <= len {
            self.set_int(len, Value::Nil);
        }
        removed
    }

    /// Values 1..=len, for library functions working on sequences
    pub fn sequence(&self) -> Vec<Value> {
        (1..=self.len() as i64).map(|i| self.get_int(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_float_keys_share_integer_slots() {
        let mut t = Table::new();
        t.set(&Value::float(1.0), Value::string("a")).unwrap();
        assert_eq!(t.get(&Value::integer(1)), Value::string("a"));
        assert_eq!(t.len(), 1);
        assert!(t.set(&Value::Nil, Value::integer(1)).is_err());
        assert!(t.set(&Value::float(f64::NAN), Value::integer(1)).is_err());
    }

    #[test]
    fn out_of_order_integer_keys_migrate_to_array() {
        let mut t = Table::new();
        t.set_int(3, Value::integer(3));
        t.set_int(2, Value::integer(2));
        assert_eq!(t.len(), 0);
        t.set_int(1, Value::integer(1));
        assert_eq!(t.len(), 3);
        assert_eq!(t.sequence(), vec![Value::integer(1), Value::integer(2), Value::integer(3)]);
    }

    #[test]
    fn next_visits_array_then_insertion_order() {
        let mut t = Table::from_sequence(vec![Value::integer(10), Value::integer(20)]);
        t.set_str("b", Value::integer(2));
        t.set_str("a", Value::integer(1));
        let mut keys = Vec::new();
        let mut key = Value::Nil;
        while let Some((k, _)) = t.next(&key).unwrap() {
            keys.push(k.to_display_string());
            key = k;
        }
        assert_eq!(keys, vec!["1", "2", "b", "a"]);
    }

    #[test]
    fn removing_during_traversal_keeps_next_valid() {
        let mut t = Table::new();
        t.set_str("x", Value::integer(1));
        t.set_str("y", Value::integer(2));
        let (first, _) = t.next(&Value::Nil).unwrap().unwrap();
        t.set(&first, Value::Nil).unwrap();
        let (second, _) = t.next(&first).unwrap().unwrap();
        assert_eq!(second, Value::string("y"));
        assert!(t.next(&Value::string("missing")).is_err());
    }

    #[test]
    fn insert_and_remove_shift_elements() {
        let mut t = Table::from_sequence(vec![Value::integer(1), Value::integer(3)]);
        t.insert(2, Value::integer(2));
        assert_eq!(t.sequence(), vec![Value::integer(1), Value::integer(2), Value::integer(3)]);
        assert_eq!(t.remove(1), Value::integer(1));
        assert_eq!(t.sequence(), vec![Value::integer(2), Value::integer(3)]);
    }
}
