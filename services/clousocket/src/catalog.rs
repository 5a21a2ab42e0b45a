//! Command catalog and request deserializer.
//!
//! The catalog is built once at startup from a directory of JSON descriptor
//! files and is immutable afterwards.  A descriptor named `<cmd>.json`
//! registers a main command; `<cmd>-<sub>.json` registers a sub-command
//! under `<cmd>`.  Each file body is `{"function": "<handler name>",
//! "args": [{"name": …}, …] | null}`.
//!
//! Deserialization turns a flat token vector into a [`CommandTree`]:
//! a `Command` root, an optional `SubCommand` directly beneath it, and a
//! right spine of `Data` nodes terminated by `End`.  Command names match
//! case-insensitively (lowercased on entry); sub-command names match
//! case-sensitively.  Results are memoized in a bounded LRU keyed by the
//! full input, so repeated requests return the same shared tree.

use lru::LruCache;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

// ---------------------------------------------------------------------------
// Command tree
// ---------------------------------------------------------------------------

/// A parsed request: tagged variants chained through shared `next` pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTree {
    End,
    Data(String, Arc<CommandTree>),
    SubCommand(String, Arc<CommandTree>),
    Command(String, Arc<CommandTree>),
}

impl CommandTree {
    /// The root command name, if this tree has a `Command` root.
    pub fn command_name(&self) -> Option<&str> {
        match self {
            CommandTree::Command(name, _) => Some(name),
            _ => None,
        }
    }

    /// The sub-command name directly under the root, if present.
    pub fn subcommand_name(&self) -> Option<&str> {
        match self {
            CommandTree::Command(_, next) => match next.as_ref() {
                CommandTree::SubCommand(name, _) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Collect the `Data` spine left to right, stopping at `End`.
    pub fn data_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut node = self;
        loop {
            node = match node {
                CommandTree::End => break,
                CommandTree::Command(_, next) | CommandTree::SubCommand(_, next) => next,
                CommandTree::Data(value, next) => {
                    args.push(value.clone());
                    next
                }
            };
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// One argument slot in a descriptor's `args` schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    function: String,
    #[serde(default)]
    args: Option<Vec<ArgSpec>>,
}

#[derive(Debug, Default)]
struct CommandEntry {
    /// Handler for the bare command; `None` when only sub-commands exist.
    function: Option<String>,
    args: Option<Vec<ArgSpec>>,
    subcommands: HashMap<String, SubCommandEntry>,
}

#[derive(Debug)]
pub struct SubCommandEntry {
    function: String,
    args: Option<Vec<ArgSpec>>,
}

impl SubCommandEntry {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> Option<&[ArgSpec]> {
        self.args.as_deref()
    }
}

/// The two-level command table.  Read-only after construction; share it as
/// `Arc<CommandTable>`.
#[derive(Debug, Default)]
pub struct CommandTable {
    commands: HashMap<String, CommandEntry>,
}

impl CommandTable {
    pub fn new() -> Self {
        CommandTable::default()
    }

    /// Build the table from a directory of `<cmd>.json` / `<cmd>-<sub>.json`
    /// descriptors.  Non-JSON files are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, CatalogError> {
        let mut table = CommandTable::new();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            CatalogError::Io(format!("reading commands directory '{}': {}", dir.display(), e))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| CatalogError::Io(format!("listing commands directory: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            table.load_descriptor(&path)?;
        }
        Ok(table)
    }

    fn load_descriptor(&mut self, path: &Path) -> Result<(), CatalogError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CatalogError::BadName(path.display().to_string()))?;
        let body = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("reading '{}': {}", path.display(), e)))?;
        let descriptor: DescriptorFile = serde_json::from_str(&body)
            .map_err(|e| CatalogError::BadDescriptor(path.display().to_string(), e.to_string()))?;

        match stem.split_once('-') {
            Some((cmd, sub)) => {
                self.register_subcommand(cmd, sub, &descriptor.function, descriptor.args);
            }
            None => self.register_command(stem, &descriptor.function, descriptor.args),
        }
        debug!(file = %path.display(), "command descriptor loaded");
        Ok(())
    }

    /// Register a main command.  The name is lowercased so lookups of
    /// lowercased inbound commands hit.
    pub fn register_command(&mut self, name: &str, function: &str, args: Option<Vec<ArgSpec>>) {
        let entry = self.commands.entry(name.to_lowercase()).or_default();
        entry.function = Some(function.to_owned());
        entry.args = args;
    }

    /// Register a sub-command.  The sub name is kept verbatim: matching is
    /// case-sensitive.
    pub fn register_subcommand(
        &mut self,
        command: &str,
        sub: &str,
        function: &str,
        args: Option<Vec<ArgSpec>>,
    ) {
        let entry = self.commands.entry(command.to_lowercase()).or_default();
        entry.subcommands.insert(
            sub.to_owned(),
            SubCommandEntry {
                function: function.to_owned(),
                args,
            },
        );
    }

    pub fn contains(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    pub fn subcommand(&self, command: &str, sub: &str) -> Option<&SubCommandEntry> {
        self.commands.get(command)?.subcommands.get(sub)
    }

    pub fn command_function(&self, command: &str) -> Option<&str> {
        self.commands.get(command)?.function.as_deref()
    }

    pub fn command_args(&self, command: &str) -> Option<&[ArgSpec]> {
        self.commands.get(command)?.args.as_deref()
    }

    /// Resolve the handler function name a tree dispatches to: the
    /// sub-command entry when the tree routes through one, the bare command
    /// entry otherwise.
    pub fn resolve(&self, tree: &CommandTree) -> Option<&str> {
        let command = tree.command_name()?;
        match tree.subcommand_name() {
            Some(sub) => Some(self.subcommand(command, sub)?.function()),
            None => self.command_function(command),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("descriptor file name is not valid UTF-8: {0}")]
    BadName(String),
    #[error("bad descriptor '{0}': {1}")]
    BadDescriptor(String, String),
}

// ---------------------------------------------------------------------------
// Deserializer
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeserializeError {
    #[error("Command '{0}' not found.")]
    CommandNotFound(String),
}

type CacheKey = (Vec<String>, bool);

/// Converts token vectors into [`CommandTree`]s against a fixed catalog,
/// memoizing by the full input (tokens plus recursion flag).
pub struct Deserializer {
    table: Arc<CommandTable>,
    cache: Mutex<LruCache<CacheKey, Arc<CommandTree>>>,
}

impl Deserializer {
    pub fn new(table: Arc<CommandTable>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("max(1) is non-zero");
        Deserializer {
            table,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn table(&self) -> &Arc<CommandTable> {
        &self.table
    }

    /// Parse a request token vector.  Identical inputs return the same
    /// shared tree as long as the entry survives in the cache.
    pub fn deserialize(&self, tokens: &[String]) -> Result<Arc<CommandTree>, DeserializeError> {
        self.convert(tokens, false)
    }

    fn convert(&self, tokens: &[String], recursive: bool) -> Result<Arc<CommandTree>, DeserializeError> {
        let key: CacheKey = (tokens.to_vec(), recursive);
        if let Some(tree) = self.cache.lock().unwrap().get(&key) {
            return Ok(tree.clone());
        }

        let tree = self.convert_uncached(tokens, recursive)?;
        self.cache.lock().unwrap().put(key, tree.clone());
        Ok(tree)
    }

    fn convert_uncached(
        &self,
        tokens: &[String],
        recursive: bool,
    ) -> Result<Arc<CommandTree>, DeserializeError> {
        if tokens.is_empty() {
            return Ok(Arc::new(CommandTree::End));
        }
        if recursive {
            // Below the top level every head token is data.
            let next = self.convert(&tokens[1..], true)?;
            return Ok(Arc::new(CommandTree::Data(tokens[0].clone(), next)));
        }

        let command = tokens[0].to_lowercase();
        if !self.table.contains(&command) {
            return Err(DeserializeError::CommandNotFound(command));
        }
        if tokens.len() == 1 {
            return Ok(Arc::new(CommandTree::Command(
                command,
                Arc::new(CommandTree::End),
            )));
        }

        let second = &tokens[1];
        let next = if self.table.subcommand(&command, second).is_some() {
            Arc::new(CommandTree::SubCommand(
                second.clone(),
                self.convert(&tokens[2..], true)?,
            ))
        } else {
            Arc::new(CommandTree::Data(
                second.clone(),
                self.convert(&tokens[2..], true)?,
            ))
        };
        Ok(Arc::new(CommandTree::Command(command, next)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
