//! Variable pools and `%(name)%` template resolution.
//!
//! Four pool kinds are consulted in a fixed order: constants, rotating
//! values (random pick), exhaustible values (at the caller's offset) and
//! values extracted from earlier responses. The first pool that declares a
//! name wins. Unknown names are left in the template untouched.

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::cli::config::Scenario;

pub mod pool;
pub mod snapshot;

pub use pool::{
    ConstantPool, ExhaustiblePool, ExhaustibleVar, ExtractedPool, PoolKind, RotatingPool,
    VariablePool,
};
pub use snapshot::VarSnapshot;

/// Per-iteration cursor position of each exhaustible variable.
pub type Offsets = HashMap<String, usize>;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\((.+?)\)%").expect("placeholder pattern is valid"));

#[derive(Debug, Default)]
pub struct VariableStore {
    constants: ConstantPool,
    rotating: RotatingPool,
    exhaustible: ExhaustiblePool,
    extracted: ExtractedPool,
}

impl VariableStore {
    pub fn new(
        constants: HashMap<String, String>,
        rotating: HashMap<String, Vec<String>>,
        exhaustible: HashMap<String, ExhaustibleVar>,
    ) -> Self {
        let store = Self {
            constants: ConstantPool::new(constants),
            rotating: RotatingPool::new(rotating),
            exhaustible: ExhaustiblePool::new(exhaustible),
            extracted: ExtractedPool::default(),
        };
        store.warn_on_shadowed_names();
        store
    }

    /// Build the store from the scenario's declared source files.
    pub fn load(scenario: &Scenario) -> Result<Self> {
        let mut rotating = HashMap::new();
        for source in &scenario.vars {
            let lines = load_lines(&scenario.source_path(source))
                .with_context(|| format!("variable '{}'", source.name))?;
            rotating.insert(source.name.clone(), lines);
        }

        let mut exhaustible = HashMap::new();
        for source in &scenario.exvars {
            let lines = load_lines(&scenario.source_path(source))
                .with_context(|| format!("exhaustible variable '{}'", source.name))?;
            exhaustible.insert(source.name.clone(), ExhaustibleVar::new(lines));
        }

        Ok(Self::new(scenario.consts.clone(), rotating, exhaustible))
    }

    /// Build the store on a node: constants come from the scenario, pools from
    /// the coordinator's snapshot.
    pub fn from_snapshot(scenario: &Scenario, snapshot: VarSnapshot) -> Self {
        Self::new(
            scenario.consts.clone(),
            snapshot.rotating,
            snapshot.exhaustible,
        )
    }

    pub fn snapshot(&self) -> VarSnapshot {
        VarSnapshot {
            rotating: self.rotating.values().clone(),
            exhaustible: self.exhaustible.vars().clone(),
        }
    }

    fn pools(&self) -> [&dyn VariablePool; 4] {
        [
            &self.constants,
            &self.rotating,
            &self.exhaustible,
            &self.extracted,
        ]
    }

    pub fn lookup(&self, name: &str, offsets: &Offsets) -> Option<String> {
        self.pools()
            .into_iter()
            .find_map(|pool| pool.lookup(name, offsets))
    }

    /// Replace every `%(name)%` in `template`. Substituted text is not scanned
    /// again.
    pub fn resolve(&self, template: &str, offsets: &Offsets) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                self.lookup(&caps[1], offsets)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn extract(&self, name: &str, value: &str) {
        self.extracted.set(name, value);
    }

    pub fn exhaustible(&self) -> &HashMap<String, ExhaustibleVar> {
        self.exhaustible.vars()
    }

    /// Fresh cursors positioned at each variable's starting offset.
    pub fn cursors(&self) -> Cursors {
        let mut entries: Vec<Cursor> = self
            .exhaustible
            .vars()
            .iter()
            .map(|(name, var)| Cursor {
                name: name.clone(),
                offset: var.offset,
                len: var.values.len(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Cursors { entries }
    }

    fn warn_on_shadowed_names(&self) {
        let pools = self.pools();
        for (i, later) in pools.iter().enumerate().skip(1) {
            let names: Vec<&String> = match later.kind() {
                PoolKind::Rotating => self.rotating.values().keys().collect(),
                PoolKind::Exhaustible => self.exhaustible.vars().keys().collect(),
                _ => continue,
            };
            for name in names {
                if let Some(earlier) = pools[..i].iter().find(|p| p.contains(name)) {
                    tracing::warn!(
                        name = %name,
                        shadowed = ?later.kind(),
                        by = ?earlier.kind(),
                        "variable declared in more than one pool"
                    );
                }
            }
        }
    }
}

fn load_lines(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    Ok(raw.lines().map(str::to_string).collect())
}

#[derive(Debug, Clone)]
struct Cursor {
    name: String,
    offset: usize,
    len: usize,
}

/// Drives the exhaustible offsets from the scheduler, one step per iteration.
#[derive(Debug, Clone)]
pub struct Cursors {
    entries: Vec<Cursor>,
}

impl Cursors {
    /// Offsets for the next iteration. Each cursor is captured first and then
    /// advanced, wrapping at the end of its sequence.
    pub fn advance(&mut self) -> Offsets {
        let mut offsets = Offsets::with_capacity(self.entries.len());
        for cursor in &mut self.entries {
            offsets.insert(cursor.name.clone(), cursor.offset);
            cursor.offset = if cursor.len == 0 {
                0
            } else {
                (cursor.offset + 1) % cursor.len
            };
        }
        offsets
    }
}
