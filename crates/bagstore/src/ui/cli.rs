//! Command-line interface over bags.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Command as Process;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use regex::Regex;
use serde_yaml::Value;

use crate::app::bag::{Bag, BagOptions};
use crate::app::env_export::{self, CommandEnv, Selection};
use crate::domain::model::Format;
use crate::infra::config::Config;
use crate::infra::store;

#[derive(Debug, Parser)]
#[command(
    name = "bagstore",
    author,
    version,
    about = "Persistent key/value bags backed by YAML files",
    long_about = None
)]
pub struct Cli {
    /// Directory holding bag files (defaults to $BAGSTORE_HOME or ~/.bagstore).
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,
    /// Open bags read only.
    #[arg(long, global = true)]
    pub read_only: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty bag if it does not exist yet
    Create { bag: String },
    /// Print the value stored under a key
    Get { bag: String, key: String },
    /// Store a value under a key
    Set {
        bag: String,
        key: String,
        value: String,
    },
    /// Remove a key, printing its previous value
    Delete { bag: String, key: String },
    /// Print every entry of a bag
    List {
        bag: String,
        /// Emit entries as a JSON object
        #[arg(long)]
        json: bool,
    },
    /// List the bags in the bag directory
    Bags,
    /// Run a command with bag entries exported as environment variables
    Exec {
        bag: String,
        /// Replace variables that are already set
        #[arg(long)]
        overwrite: bool,
        /// Only export keys matching this regular expression
        #[arg(long, value_name = "REGEX")]
        pattern: Option<String>,
        /// Upper-case variable names
        #[arg(long)]
        upper: bool,
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Generate shell completions
    Completions { shell: Shell },
}

/// Parse arguments, load configuration, and run the requested command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    let stdout = io::stdout();
    execute(cli, &config, &mut stdout.lock())
}

/// Run a parsed command, writing user-facing output to `out`.
pub fn execute(cli: Cli, config: &Config, out: &mut impl Write) -> Result<()> {
    let mut options = config.bag_options().read_only(cli.read_only);
    if let Some(home) = cli.home {
        options = options.with_directory(home);
    }

    match cli.command {
        Command::Create { bag } => {
            let bag = open(&bag, options)?;
            writeln!(out, "{}", bag.path().display())?;
        }
        Command::Get { bag: name, key } => {
            let bag = open(&name, options)?;
            let value = bag
                .get(&key)
                .ok_or_else(|| anyhow!("key '{key}' not found in bag '{name}'"))?;
            writeln!(out, "{}", render_value(value)?)?;
        }
        Command::Set { bag, key, value } => {
            let mut bag = open(&bag, options)?;
            bag.set(key, value)?;
            save(&mut bag)?;
        }
        Command::Delete { bag: name, key } => {
            let mut bag = open(&name, options)?;
            let Some(removed) = bag.delete(&key)? else {
                bail!("key '{key}' not found in bag '{name}'");
            };
            save(&mut bag)?;
            writeln!(out, "{}", render_value(&removed)?)?;
        }
        Command::List { bag, json } => {
            let bag = open(&bag, options)?;
            if json {
                let rendered = serde_json::to_string_pretty(bag.entries())
                    .context("failed to render bag as JSON")?;
                writeln!(out, "{rendered}")?;
            } else {
                for (key, value) in &bag {
                    writeln!(out, "{key}={}", render_value(value)?)?;
                }
            }
        }
        Command::Bags => {
            let directory = options.directory.unwrap_or_else(|| config.directory());
            let format = Format::from_extension(
                options
                    .extension
                    .as_deref()
                    .unwrap_or(Format::default().extension()),
            )?;
            for name in store::list_bags(&directory, format)? {
                writeln!(out, "{name}")?;
            }
        }
        Command::Exec {
            bag,
            overwrite,
            pattern,
            upper,
            command,
        } => {
            let bag = open(&bag, options.read_only(true))?;
            let mut export = config.env_export_options();
            export.overwrite |= overwrite;
            export.uppercase |= upper;
            if let Some(pattern) = pattern {
                let regex = Regex::new(&pattern)
                    .with_context(|| format!("invalid key pattern '{pattern}'"))?;
                export.selection = Selection::Pattern(regex);
            }

            let (program, args) = command
                .split_first()
                .context("missing command to execute")?;
            let mut process = Process::new(program);
            process.args(args);
            env_export::export_to_env(&bag, &export, &mut CommandEnv::new(&mut process));

            let status = process
                .status()
                .with_context(|| format!("failed to run {program}"))?;
            if !status.success() {
                bail!("{program} exited with {status}");
            }
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "bagstore", out);
        }
    }
    Ok(())
}

fn open(name: &str, options: BagOptions) -> Result<Bag> {
    Bag::open(name, options).with_context(|| format!("failed to open bag '{name}'"))
}

fn save(bag: &mut Bag) -> Result<()> {
    bag.save()
        .with_context(|| format!("failed to save bag '{}'", bag.name()))
}

fn render_value(value: &Value) -> Result<String> {
    match value {
        Value::String(value) => Ok(value.clone()),
        Value::Null => Ok(String::new()),
        Value::Bool(value) => Ok(value.to_string()),
        Value::Number(value) => Ok(value.to_string()),
        other => Ok(serde_yaml::to_string(other)
            .context("failed to render value")?
            .trim_end()
            .to_owned()),
    }
}
