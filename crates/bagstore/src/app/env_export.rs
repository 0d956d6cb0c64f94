//! Copying bag entries into environment variables.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use tracing::debug;

use crate::app::bag::Bag;

static SYSVAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("environment variable pattern is valid")
});

/// A place environment variables can be read from and written to.
pub trait EnvTarget {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&mut self, name: &str, value: &str);
}

/// The environment of the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvTarget for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }

    fn set(&mut self, name: &str, value: &str) {
        // SAFETY: bags are used from a single thread; callers that spawn threads must export
        // before doing so.
        unsafe { env::set_var(name, value) }
    }
}

/// The environment a child process will be spawned with.
pub struct CommandEnv<'a> {
    command: &'a mut Command,
}

impl<'a> CommandEnv<'a> {
    pub fn new(command: &'a mut Command) -> Self {
        Self { command }
    }
}

impl EnvTarget for CommandEnv<'_> {
    fn get(&self, name: &str) -> Option<String> {
        let explicit = self
            .command
            .get_envs()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value);
        match explicit {
            Some(Some(value)) => Some(value.to_string_lossy().into_owned()),
            Some(None) => None,
            None => env::var(name).ok(),
        }
    }

    fn set(&mut self, name: &str, value: &str) {
        self.command.env(name, value);
    }
}

impl EnvTarget for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }

    fn set(&mut self, name: &str, value: &str) {
        self.insert(name.to_owned(), value.to_owned());
    }
}

/// Which bag keys to export.
#[derive(Debug, Clone, Default)]
pub enum Selection {
    #[default]
    All,
    Keys(Vec<String>),
    Pattern(Regex),
}

impl Selection {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Keys(keys) => keys.iter().any(|candidate| candidate == key),
            Selection::Pattern(pattern) => pattern.is_match(key),
        }
    }
}

/// Controls which entries are exported and how.
#[derive(Debug, Clone)]
pub struct EnvExportOptions {
    pub selection: Selection,
    /// Only export keys that are valid environment variable names.
    pub sysvar_only: bool,
    /// Replace variables that are already set.
    pub overwrite: bool,
    /// Upper-case variable names.
    pub uppercase: bool,
}

impl Default for EnvExportOptions {
    fn default() -> Self {
        Self {
            selection: Selection::All,
            sysvar_only: true,
            overwrite: false,
            uppercase: false,
        }
    }
}

/// Assign the selected entries of `bag` in `target`.
///
/// Scalar values are rendered as strings; null, sequence, and mapping values are skipped.
/// Returns the variables that were actually assigned.
pub fn export_to_env<T: EnvTarget + ?Sized>(
    bag: &Bag,
    options: &EnvExportOptions,
    target: &mut T,
) -> BTreeMap<String, String> {
    let mut assigned = BTreeMap::new();

    for (key, value) in bag {
        if !options.selection.matches(key) {
            continue;
        }
        if options.sysvar_only && !SYSVAR_PATTERN.is_match(key) {
            debug!(key = key.as_str(), "skipping key that is not a valid variable name");
            continue;
        }
        let Some(rendered) = render_scalar(value) else {
            debug!(key = key.as_str(), "skipping non-scalar value");
            continue;
        };

        let name = if options.uppercase {
            key.to_uppercase()
        } else {
            key.clone()
        };
        if !options.overwrite && target.get(&name).is_some() {
            debug!(name = name.as_str(), "variable already set, not overwriting");
            continue;
        }

        target.set(&name, &rendered);
        assigned.insert(name, rendered);
    }

    debug!(bag = bag.name(), assigned = assigned.len(), "exported bag entries");
    assigned
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Bool(value) => Some(value.to_string()),
        Value::Number(value) => Some(value.to_string()),
        Value::Tagged(tagged) => render_scalar(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}
