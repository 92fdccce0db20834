use std::rc::Rc;

use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

/// Empty slot: `key == None`, `value == Nil`.
/// Tombstone slot: `key == None`, `value == Bool(true)`.
/// Both states share the `key == None` tag, distinguished by the value, so
/// probing can keep walking past a deleted entry without shrinking the
/// table.
struct Entry {
    key: Option<Rc<str>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, value: Value::Nil }
    }
}

/// Open-addressed hash table with linear probing and tombstone deletion,
/// grown at a 0.75 load factor. Used both for the VM's global-variable
/// bindings and, keyed by raw byte content instead of pointer identity via
/// `find_string`, as the string-interning set.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table { count: 0, entries: Vec::new() }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], capacity: usize, key: &Rc<str>) -> usize {
        let mut index = (fnv1a_hash(key.as_bytes()) as usize) % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match &entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) => {
                    if Rc::ptr_eq(k, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            entries.push(Entry::empty());
        }

        let mut count = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let dest = Self::find_entry(&entries, capacity, &key);
                entries[dest] = Entry { key: Some(key), value: entry.value };
                count += 1;
            }
        }

        self.entries = entries;
        self.count = count;
    }

    pub fn get(&self, key: &Rc<str>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[index].key.as_ref()?;
        Some(self.entries[index].value.clone())
    }

    /// Returns `true` if this inserted a new key. `vm.rs` uses this to report
    /// "Undefined variable" when a bare `SET_GLOBAL` targets a key that was
    /// never `var`-declared.
    pub fn set(&mut self, key: Rc<str>, value: Value) -> bool {
        if self.count + 1 > (self.capacity() as f64 * TABLE_MAX_LOAD) as usize {
            let capacity = grow_capacity(self.capacity());
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, self.capacity(), &key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: &Rc<str>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index].key = None;
        self.entries[index].value = Value::Bool(true);
        true
    }

    /// Looks the string up in the intern set and returns the canonical
    /// `Rc<str>`, allocating and inserting a fresh one on first sight. Every
    /// string-valued constant and every concatenation result passes through
    /// here so that two `Value`s holding equal text always share one `Rc`.
    pub fn intern(&mut self, s: &str) -> Rc<str> {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.find_interned(s, hash) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(s);
        self.set(Rc::clone(&rc), Value::Nil);
        rc
    }

    /// Intern-set lookup: finds an existing key by byte content rather than
    /// by the `Rc<str>` pointer identity `find_entry` uses, so the compiler
    /// and VM can deduplicate a freshly-allocated `String`/`Rc<str>` against
    /// one already interned.
    pub fn find_interned(&self, chars: &str, hash: u32) -> Option<Rc<str>> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(k) => {
                    if k.len() == chars.len() && k.as_ref() == chars {
                        return Some(Rc::clone(k));
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut table = Table::new();
        let key: Rc<str> = Rc::from("count");
        assert!(table.set(Rc::clone(&key), Value::Number(1.0)));
        assert_eq!(table.get(&key), Some(Value::Number(1.0)));
    }

    #[test]
    fn overwrite_returns_false_for_existing_key() {
        let mut table = Table::new();
        let key: Rc<str> = Rc::from("x");
        assert!(table.set(Rc::clone(&key), Value::Number(1.0)));
        assert!(!table.set(Rc::clone(&key), Value::Number(2.0)));
        assert_eq!(table.get(&key), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_get_misses_but_reinsert_after_tombstone_works() {
        let mut table = Table::new();
        let key: Rc<str> = Rc::from("x");
        table.set(Rc::clone(&key), Value::Number(1.0));
        assert!(table.delete(&key));
        assert_eq!(table.get(&key), None);
        assert!(table.set(Rc::clone(&key), Value::Number(3.0)));
        assert_eq!(table.get(&key), Some(Value::Number(3.0)));
    }

    #[test]
    fn grows_past_load_factor_and_keeps_every_key() {
        let mut table = Table::new();
        let keys: Vec<Rc<str>> = (0..64).map(|i| Rc::from(format!("k{i}").as_str())).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(Rc::clone(key), Value::Number(i as f64));
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_interned_locates_equal_content() {
        let mut table = Table::new();
        let key: Rc<str> = Rc::from("hello");
        table.set(Rc::clone(&key), Value::Nil);
        let hash = fnv1a_hash("hello".as_bytes());
        let found = table.find_interned("hello", hash).unwrap();
        assert!(Rc::ptr_eq(&found, &key));
    }
}
