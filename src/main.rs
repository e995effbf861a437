//! docflow CLI Entry Point
//!
//! Administers workflows and moves items over a JSON-file content store.
//!
//! # Usage
//!
//! ```bash
//! # Check a definition file against the built-in step types
//! docflow validate submission.yaml
//!
//! # Import an exported document under a new name
//! docflow import submission.json --name thesis-review
//!
//! # Create an item and move it along
//! docflow create-item thesis-review "My thesis" --type document
//! docflow forward 12 true
//!
//! # Use another store file
//! docflow --store /data/docflow.json list
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use once_cell::sync::Lazy;

use docflow::execution::{EngineConfig, StepRegistry, TransitionEngine};
use docflow::store::{ContentStore, MemoryStore, NodeId};
use docflow::workflow::repository;
use docflow::workflow::{
    export_workflows, import_document, load_definition, quick_validate, ExportDocument, Format,
};
use docflow::{APP_NAME, VERSION};

/// Store file used when neither `--store` nor `DOCFLOW_STORE` is given.
const DEFAULT_STORE_FILE: &str = "./docflow-store.json";

static DEFAULT_STORE: Lazy<PathBuf> = Lazy::new(|| {
    env::var("DOCFLOW_STORE")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_FILE))
});

#[derive(Debug, PartialEq)]
enum Command {
    Validate {
        file: String,
    },
    Import {
        file: String,
        name: Option<String>,
    },
    Export {
        workflow: String,
        format: Format,
        output: Option<String>,
    },
    List,
    CreateItem {
        workflow: String,
        name: String,
        node_type: String,
    },
    Enter {
        workflow: String,
        item: NodeId,
    },
    Forward {
        item: NodeId,
        outcome: bool,
    },
    Status {
        item: NodeId,
    },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Option<Command>,
    store: Option<PathBuf>,
    max_chain: usize,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            store: None,
            max_chain: EngineConfig::default().max_chain_depth,
            verbose: false,
        }
    }
}

impl Config {
    fn store_path(&self) -> PathBuf {
        self.store.clone().unwrap_or_else(|| DEFAULT_STORE.clone())
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Content Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: docflow [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  validate <FILE>                     Validate a workflow YAML file");
    println!("  import <FILE> [--name NAME]         Import an exported document");
    println!("  export <WORKFLOW|all>               Export workflows");
    println!("         [--format json|yaml] [--output FILE]");
    println!("  list                                List workflows with item counts");
    println!("  create-item <WORKFLOW> <NAME>       Create an item and enter it");
    println!("         [--type TYPE]");
    println!("  enter <WORKFLOW> <ITEM>             Enter an existing item");
    println!("  forward <ITEM> <true|false>         Forward an item");
    println!("  status <ITEM>                       Show where an item is");
    println!();
    println!("Options:");
    println!("  --store PATH        Store file (default: $DOCFLOW_STORE or {})", DEFAULT_STORE_FILE);
    println!(
        "  --max-chain N       Maximum automatic transitions per request (default: {})",
        EngineConfig::default().max_chain_depth
    );
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

fn option_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", flag))
}

fn parse_item(value: &str) -> Result<NodeId, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid item id: {}", value))
}

fn parse_outcome(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(format!("Invalid outcome: {} (expected true or false)", value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional = Vec::new();
    let mut name = None;
    let mut format = Format::Json;
    let mut output = None;
    let mut node_type = "document".to_string();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--store" => {
                config.store = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--max-chain" => {
                let value = option_value(args, &mut i, arg)?;
                config.max_chain = value
                    .parse()
                    .map_err(|_| format!("Invalid max-chain value: {}", value))?;
            }
            "--name" => name = Some(option_value(args, &mut i, arg)?),
            "--output" => output = Some(option_value(args, &mut i, arg)?),
            "--type" => node_type = option_value(args, &mut i, arg)?,
            "--format" => {
                let value = option_value(args, &mut i, arg)?;
                format = Format::from_name(&value)
                    .ok_or_else(|| format!("Unknown format: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    let Some((command, rest)) = positional.split_first() else {
        return Ok(config);
    };

    let arity = |count: usize| -> Result<(), String> {
        if rest.len() == count {
            Ok(())
        } else {
            Err(format!(
                "'{}' expects {} argument(s), got {}",
                command,
                count,
                rest.len()
            ))
        }
    };

    let parsed = match command.as_str() {
        "validate" => {
            arity(1)?;
            Command::Validate {
                file: rest[0].clone(),
            }
        }
        "import" => {
            arity(1)?;
            Command::Import {
                file: rest[0].clone(),
                name,
            }
        }
        "export" => {
            arity(1)?;
            Command::Export {
                workflow: rest[0].clone(),
                format,
                output,
            }
        }
        "list" => {
            arity(0)?;
            Command::List
        }
        "create-item" => {
            arity(2)?;
            Command::CreateItem {
                workflow: rest[0].clone(),
                name: rest[1].clone(),
                node_type,
            }
        }
        "enter" => {
            arity(2)?;
            Command::Enter {
                workflow: rest[0].clone(),
                item: parse_item(&rest[1])?,
            }
        }
        "forward" => {
            arity(2)?;
            Command::Forward {
                item: parse_item(&rest[0])?,
                outcome: parse_outcome(&rest[1])?,
            }
        }
        "status" => {
            arity(1)?;
            Command::Status {
                item: parse_item(&rest[0])?,
            }
        }
        other => return Err(format!("Unknown command: {}", other)),
    };

    config.command = Some(parsed);
    Ok(config)
}

/// Prints where an item is and its last failure, if any.
fn print_status(
    engine: &TransitionEngine,
    store: &dyn ContentStore,
    item: NodeId,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = store.node(item)?;
    match engine.current_step(store, item)? {
        Some(step) => println!(
            "Item {} ('{}') is in {} / {}",
            item,
            node.name,
            step.workflow.cyan(),
            step.step.green()
        ),
        None => println!("Item {} ('{}') is {}", item, node.name, "not in any workflow".yellow()),
    }

    let failure = node.get("workflow.error");
    if !failure.is_empty() {
        println!(
            "  {} in step '{}' at {}: {}",
            "Last error".red(),
            node.get("workflow.errorstep"),
            node.get("workflow.errortime"),
            failure
        );
    }
    Ok(())
}

fn execute(
    command: Command,
    engine: &TransitionEngine,
    store: &MemoryStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = store.session();

    match command {
        Command::Validate { file } => {
            let definition = load_definition(&file, engine.registry())?;
            for warning in quick_validate(&definition, None) {
                println!("  {} {}", "warning:".yellow(), warning);
            }
            let start = definition.start_step()?;
            println!(
                "{} '{}' is valid: {} steps, start step '{}'",
                "✓".green(),
                definition.name,
                definition.len(),
                start.name
            );
        }
        Command::Import { file, name } => {
            let text = fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read '{}': {}", file, e))?;
            let document = ExportDocument::parse(&text)?;
            let created =
                import_document(&engine.repository(), &mut session, &document, name.as_deref())?;
            for workflow in created {
                println!("{} Imported '{}'", "✓".green(), workflow);
            }
        }
        Command::Export {
            workflow,
            format,
            output,
        } => {
            let names: Vec<&str> = if workflow == "all" {
                Vec::new()
            } else {
                vec![workflow.as_str()]
            };
            let text = export_workflows(&session, &names)?.to_text(format)?;
            match output {
                Some(path) => {
                    fs::write(&path, text)?;
                    info!("Export written to {}", path);
                }
                None => println!("{}", text),
            }
        }
        Command::List => {
            let workflows = repository::list_workflows(&session)?;
            if workflows.is_empty() {
                println!("No workflows defined");
            }
            for definition in workflows {
                let Some(node) = definition.node else {
                    continue;
                };
                let items = repository::workflow_items(&session, node)?.len();
                let failed = repository::failed_items(&session, node)?.len();
                let mut line = format!(
                    "{} {:>3} steps {:>5} items",
                    format!("{:<24}", definition.name).bold(),
                    definition.len(),
                    items
                );
                if failed > 0 {
                    line.push_str(&format!("  {}", format!("{} failed", failed).red()));
                }
                println!("{}", line);
                if !definition.description.is_empty() {
                    println!("    {}", definition.description);
                }
            }
        }
        Command::CreateItem {
            workflow,
            name,
            node_type,
        } => {
            let (item, _) = engine.create_item(&mut session, &workflow, &name, &node_type)?;
            println!("{} Created item {}", "✓".green(), item);
            print_status(engine, &session, item)?;
        }
        Command::Enter { workflow, item } => {
            engine.enter_workflow(&mut session, &workflow, item)?;
            print_status(engine, &session, item)?;
        }
        Command::Forward { item, outcome } => {
            let landed = engine.forward(&mut session, item, outcome)?;
            info!("Moved item {} to '{}'", item, landed.step);
            print_status(engine, &session, item)?;
        }
        Command::Status { item } => print_status(engine, &session, item)?,
    }

    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    let store_path = config.store_path();
    let Some(command) = config.command else {
        print_banner();
        print_usage();
        return Ok(());
    };

    info!("Store: {}", store_path.display());
    let store = MemoryStore::open(&store_path).map_err(|e| {
        error!("Failed to open store: {}", e);
        e
    })?;

    let registry = Arc::new(StepRegistry::with_builtin_steps()?);
    let engine = TransitionEngine::new(registry).with_config(EngineConfig {
        max_chain_depth: config.max_chain,
    });

    execute(command, &engine, &store)
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("docflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_no_command() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert!(config.command.is_none());
        assert_eq!(config.max_chain, 32);
    }

    #[test]
    fn test_parse_forward() {
        let config = parse_arguments(&args(&["forward", "12", "false", "--max-chain", "4"])).unwrap();
        assert_eq!(
            config.command,
            Some(Command::Forward {
                item: 12,
                outcome: false
            })
        );
        assert_eq!(config.max_chain, 4);
    }

    #[test]
    fn test_parse_export_options() {
        let config = parse_arguments(&args(&[
            "--store", "/tmp/s.json", "export", "all", "--format", "yaml", "--output", "out.yaml",
        ]))
        .unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/tmp/s.json"));
        assert_eq!(
            config.command,
            Some(Command::Export {
                workflow: "all".to_string(),
                format: Format::Yaml,
                output: Some("out.yaml".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["forward", "abc", "true"])).is_err());
        assert!(parse_arguments(&args(&["forward", "1", "maybe"])).is_err());
        assert!(parse_arguments(&args(&["status"])).is_err());
        assert!(parse_arguments(&args(&["launch"])).is_err());
        assert!(parse_arguments(&args(&["--format", "xml", "list"])).is_err());
        assert!(parse_arguments(&args(&["--store"])).is_err());
    }

    #[test]
    fn test_create_item_default_type() {
        let config = parse_arguments(&args(&["create-item", "submission", "thesis"])).unwrap();
        assert_eq!(
            config.command,
            Some(Command::CreateItem {
                workflow: "submission".to_string(),
                name: "thesis".to_string(),
                node_type: "document".to_string(),
            })
        );
    }
}
