//! Weft CLI - Command-line interface for the weft runtime
//!
//! Validates workflow definitions, runs them, and resumes persisted
//! instances waiting on bookmarks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;
use weft::runtime::activity::ActivityTree;
use weft::runtime::definition::TreeDocument;
use weft::runtime::engine::SequentialEngine;
use weft::runtime::instance::WorkflowInstance;
use weft::runtime::storage::{init_storage, load_config, write_config};
use weft::runtime::validation;
use weft::runtime::{Bookmark, BookmarkResumptionResult, BookmarkScope, Runtime, RuntimeConfig, WorkflowInstanceState};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Embeddable runtime for durable, suspendable activity trees", long_about = None)]
struct Cli {
    /// Root directory for the instance store
    #[arg(short, long, default_value = ".weft")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration to the store root
    Init {
        /// Disable lifecycle tracking output
        #[arg(long)]
        no_tracking: bool,
    },

    /// Validate a definition and print its errors and warnings
    Validate {
        /// Definition file (JSON)
        definition: PathBuf,

        /// Validate only the root activity
        #[arg(long)]
        single_level: bool,

        /// Skip the root's own configuration checks
        #[arg(long)]
        skip_root: bool,
    },

    /// Start a new instance and run it until it is idle or complete
    Run {
        /// Definition file (JSON)
        definition: PathBuf,

        /// Root input as NAME=JSON (repeatable)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
    },

    /// Resume a persisted instance waiting on a bookmark
    Resume {
        /// Definition file (JSON)
        definition: PathBuf,

        /// Instance id
        #[arg(long)]
        id: Uuid,

        /// Bookmark name
        #[arg(long)]
        bookmark: String,

        /// Resumption value (JSON)
        #[arg(long, default_value = "null")]
        value: String,
    },

    /// Look up a public activity by id
    Resolve {
        /// Definition file (JSON)
        definition: PathBuf,

        /// Activity id, e.g. "3"
        id: String,
    },

    /// List persisted instances
    Instances,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = stored_config(&cli.root)?;

    // Initialize tracing
    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Init { no_tracking } => {
            let config = RuntimeConfig {
                root: cli.root.clone(),
                tracking_enabled: !no_tracking,
                ..Default::default()
            };
            init_storage(&cli.root)?;
            write_config(&config)?;
            println!("Initialized weft store at {:?}", cli.root);
        }

        Commands::Validate {
            definition,
            single_level,
            skip_root,
        } => {
            let runtime = Runtime::new(config)?;
            let tree = load_definition(&runtime, &definition)?;
            let mut settings = runtime.config().validation.to_settings();
            settings.single_level |= single_level;
            settings.skip_validating_root_configuration |= skip_root;

            let results = runtime.validate_with(&tree, &settings)?;
            for item in results.all() {
                println!("{item}");
            }
            println!(
                "{} error(s), {} warning(s)",
                results.errors().len(),
                results.warnings().len()
            );
            if !results.is_valid() {
                std::process::exit(1);
            }
        }

        Commands::Run { definition, inputs } => {
            let runtime = Runtime::new(config)?;
            let tree = Arc::new(load_definition(&runtime, &definition)?);
            let inputs = parse_inputs(&inputs)?;

            let instance = runtime.create_instance(tree);
            instance.initialize(if inputs.is_empty() { None } else { Some(inputs) })?;
            instance.run()?;
            report(&runtime, &instance)?;
        }

        Commands::Resume {
            definition,
            id,
            bookmark,
            value,
        } => {
            let runtime = Runtime::new(config)?;
            let tree = Arc::new(load_definition(&runtime, &definition)?);
            let value: Value = serde_json::from_str(&value).context("Resumption value is not valid JSON")?;

            let instance = runtime.load_instance(id, tree)?;
            match instance.schedule_bookmark_resumption(&Bookmark::new(bookmark.as_str()), value, BookmarkScope::Default)? {
                BookmarkResumptionResult::Success => {}
                other => bail!("Bookmark '{}' could not be resumed: {:?}", bookmark, other),
            }
            instance.run()?;
            report(&runtime, &instance)?;
        }

        Commands::Resolve { definition, id } => {
            let runtime = Runtime::new(config)?;
            let tree = load_definition(&runtime, &definition)?;
            match validation::resolve(&tree, &id)? {
                Some(activity) => println!("{}: {} ({})", id, activity.display_name(), activity.type_name()),
                None => bail!("No public activity with id '{}'", id),
            }
        }

        Commands::Instances => {
            let runtime = Runtime::new(config)?;
            for id in runtime.store().list()? {
                println!("{id}");
            }
        }
    }

    Ok(())
}

/// Stored configuration when the root has one, defaults otherwise
fn stored_config(root: &Path) -> Result<RuntimeConfig> {
    if root.join("config.json").exists() {
        return load_config(root);
    }
    Ok(RuntimeConfig {
        root: root.to_path_buf(),
        ..Default::default()
    })
}

fn load_definition(runtime: &Runtime, path: &Path) -> Result<ActivityTree> {
    let document = TreeDocument::from_path(path)?;
    Ok(document.into_tree(runtime.types())?)
}

fn parse_inputs(inputs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut parsed = BTreeMap::new();
    for input in inputs {
        let (name, raw) = input
            .split_once('=')
            .with_context(|| format!("Input '{input}' is not NAME=JSON"))?;
        // Bare words are taken as strings.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        parsed.insert(name.to_string(), value);
    }
    Ok(parsed)
}

fn report(runtime: &Runtime, instance: &WorkflowInstance<SequentialEngine>) -> Result<()> {
    let state = instance.state();
    println!("Instance {} is {:?}", instance.id(), state);

    if state == WorkflowInstanceState::Idle {
        for info in instance.bookmarks(None)? {
            println!("  waiting on '{}' ({})", info.bookmark, info.owner_display_name);
        }
        instance.persist()?;
        println!("Persisted to {:?}", runtime.store().root());
    } else {
        for (name, value) in instance.mapped_variables()? {
            println!("  {name} = {value}");
        }
        // Finished instances are not resumable
        runtime.store().delete(instance.id())?;
    }
    instance.flush_tracking()?;
    Ok(())
}
