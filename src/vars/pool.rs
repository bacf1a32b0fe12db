use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Offsets;

/// Pool kinds, listed in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Constant,
    Rotating,
    Exhaustible,
    Extracted,
}

/// A named source of substitution values.
pub trait VariablePool: Send + Sync {
    fn kind(&self) -> PoolKind;

    /// Value for `name`, or `None` when this pool does not declare it.
    fn lookup(&self, name: &str, offsets: &Offsets) -> Option<String>;

    fn contains(&self, name: &str) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct ConstantPool {
    values: HashMap<String, String>,
}

impl ConstantPool {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl VariablePool for ConstantPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Constant
    }

    fn lookup(&self, name: &str, _offsets: &Offsets) -> Option<String> {
        self.values.get(name).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Sampled uniformly at random on every substitution.
#[derive(Debug, Default, Clone)]
pub struct RotatingPool {
    values: HashMap<String, Vec<String>>,
}

impl RotatingPool {
    pub fn new(values: HashMap<String, Vec<String>>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &HashMap<String, Vec<String>> {
        &self.values
    }
}

impl VariablePool for RotatingPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Rotating
    }

    fn lookup(&self, name: &str, _offsets: &Offsets) -> Option<String> {
        let values = self.values.get(name)?;
        if values.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..values.len());
        Some(values[idx].clone())
    }

    fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Values consumed through a cursor. The cursor itself is driven by the
/// scheduler; `offset` is only the starting position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustibleVar {
    pub values: Vec<String>,
    pub offset: usize,
}

impl ExhaustibleVar {
    pub fn new(values: Vec<String>) -> Self {
        Self { values, offset: 0 }
    }

    pub fn get(&self, offset: usize) -> Option<&String> {
        if self.values.is_empty() {
            return None;
        }
        self.values.get(offset % self.values.len())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExhaustiblePool {
    vars: HashMap<String, ExhaustibleVar>,
}

impl ExhaustiblePool {
    pub fn new(vars: HashMap<String, ExhaustibleVar>) -> Self {
        Self { vars }
    }

    pub fn vars(&self) -> &HashMap<String, ExhaustibleVar> {
        &self.vars
    }
}

impl VariablePool for ExhaustiblePool {
    fn kind(&self) -> PoolKind {
        PoolKind::Exhaustible
    }

    fn lookup(&self, name: &str, offsets: &Offsets) -> Option<String> {
        let var = self.vars.get(name)?;
        let offset = offsets.get(name).copied().unwrap_or(var.offset);
        var.get(offset).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}

/// Values captured from responses. Concurrent writers race; the last one wins.
#[derive(Debug, Default)]
pub struct ExtractedPool {
    values: RwLock<HashMap<String, String>>,
}

impl ExtractedPool {
    pub fn set(&self, name: &str, value: &str) {
        self.values
            .write()
            .insert(name.to_string(), value.to_string());
    }
}

impl VariablePool for ExtractedPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Extracted
    }

    fn lookup(&self, name: &str, _offsets: &Offsets) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rotating_picks_declared_values() {
        let pool = RotatingPool::new(HashMap::from([(
            "v".to_string(),
            strings(&["a", "b", "c"]),
        )]));
        for _ in 0..50 {
            let picked = pool.lookup("v", &Offsets::new()).unwrap();
            assert!(["a", "b", "c"].contains(&picked.as_str()));
        }
        assert_eq!(pool.lookup("missing", &Offsets::new()), None);
    }

    #[test]
    fn test_empty_pools_do_not_resolve() {
        let rotating = RotatingPool::new(HashMap::from([("v".to_string(), vec![])]));
        assert_eq!(rotating.lookup("v", &Offsets::new()), None);

        let exhaustible = ExhaustiblePool::new(HashMap::from([(
            "e".to_string(),
            ExhaustibleVar::new(vec![]),
        )]));
        assert_eq!(exhaustible.lookup("e", &Offsets::new()), None);
    }

    #[test]
    fn test_exhaustible_uses_caller_offset() {
        let pool = ExhaustiblePool::new(HashMap::from([(
            "e".to_string(),
            ExhaustibleVar::new(strings(&["x", "y", "z"])),
        )]));
        let offsets = Offsets::from([("e".to_string(), 2)]);
        assert_eq!(pool.lookup("e", &offsets).as_deref(), Some("z"));
        assert_eq!(pool.lookup("e", &Offsets::new()).as_deref(), Some("x"));
        let wrapped = Offsets::from([("e".to_string(), 4)]);
        assert_eq!(pool.lookup("e", &wrapped).as_deref(), Some("y"));
    }

    #[test]
    fn test_extracted_last_writer_wins() {
        let pool = ExtractedPool::default();
        assert!(!pool.contains("session"));
        pool.set("session", "one");
        pool.set("session", "two");
        assert_eq!(
            pool.lookup("session", &Offsets::new()).as_deref(),
            Some("two")
        );
        assert!(pool.contains("session"));
    }
}
