//! tplvm CLI: run or disassemble a compiled module.

use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::rc::Rc;

use colored::Colorize;
use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

use tplvm::render;
use tplvm::vm::builtins;
use tplvm::{
    bytecode, AsyncResult, DirLoader, InterpreterConfig, ModuleObject, Runtime, RuntimeError,
    Value, VmError,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI command to execute.
enum Command {
    /// Import a module and print a rendering of its result
    Run {
        file: String,
        entry: Option<String>,
        globals: Vec<(String, String)>,
        json: bool,
    },
    /// Print a module's bytecode listing
    Disasm { file: String },
}

fn print_usage() {
    eprintln!("tplvm {} - template bytecode interpreter", VERSION);
    eprintln!();
    eprintln!("Usage: tplvm run <module.json> [--entry NAME] [--global NAME=VALUE]... [--json]");
    eprintln!("       tplvm disasm <module.json>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --entry NAME          Call NAME from the module frame and render its result");
    eprintln!("  --global NAME=VALUE   Add a global; VALUE is parsed as JSON, else taken as text");
    eprintln!("  --json                Print JSON instead of text");
    eprintln!("                        (always JSON without --entry: the module frame's variables)");
    eprintln!("  --help, -h            Show this help message");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TPLVM_MAX_FRAMES, TPLVM_TRACE_LIMIT, TPLVM_STACK_CAPACITY, TPLVM_MAX_STRING_BYTES, RUST_LOG");
}

fn usage_error(message: &str) -> ! {
    eprintln!("{}", message);
    print_usage();
    process::exit(64);
}

fn parse_args() -> Command {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        process::exit(64);
    };

    match command.as_str() {
        "--help" | "-h" => {
            print_usage();
            process::exit(0);
        }
        "--version" | "-v" => {
            println!("tplvm {}", VERSION);
            process::exit(0);
        }
        "disasm" => match args.get(1) {
            Some(file) if args.len() == 2 => Command::Disasm { file: file.clone() },
            _ => usage_error("disasm takes exactly one module file"),
        },
        "run" => {
            let mut file = None;
            let mut entry = None;
            let mut globals = Vec::new();
            let mut json = false;

            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--entry" => {
                        i += 1;
                        let Some(name) = args.get(i) else {
                            usage_error("--entry requires a name");
                        };
                        entry = Some(name.clone());
                    }
                    "--global" => {
                        i += 1;
                        let Some((name, value)) = args.get(i).and_then(|a| a.split_once('=')) else {
                            usage_error("--global requires NAME=VALUE");
                        };
                        globals.push((name.to_string(), value.to_string()));
                    }
                    "--json" => json = true,
                    arg if arg.starts_with('-') => {
                        usage_error(&format!("Unknown option for run command: {}", arg))
                    }
                    arg => {
                        if file.replace(arg.to_string()).is_some() {
                            usage_error(&format!("Unexpected argument: {}", arg));
                        }
                    }
                }
                i += 1;
            }

            let Some(file) = file else {
                usage_error("run command requires a module file");
            };
            Command::Run {
                file,
                entry,
                globals,
                json,
            }
        }
        other => usage_error(&format!("Unknown command: {}", other)),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let outcome = match parse_args() {
        Command::Run {
            file,
            entry,
            globals,
            json,
        } => run_module(&file, entry.as_deref(), globals, json),
        Command::Disasm { file } => disasm(&file),
    };

    if let Err(e) = outcome {
        eprintln!("{} {}", "error:".red().bold(), e.error);
        for entry in &e.trace {
            eprintln!("  {} {}", "at".dimmed(), entry);
        }
        process::exit(if e.is_internal() { 70 } else { 1 });
    }
}

fn read_module(file: &str) -> Result<ModuleObject, RuntimeError> {
    let source = fs::read_to_string(file)
        .map_err(|e| RuntimeError::new(format!("Failed to read file '{}': {}", file, e)))?;
    ModuleObject::from_json(&source)
}

fn disasm(file: &str) -> Result<(), VmError> {
    let module = read_module(file)?;
    print!("{}", bytecode::disassemble_module(&module));
    Ok(())
}

fn parse_global(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => render::from_json(&json),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// The outcome of an invocation that must have completed without host suspension.
fn settled(result: AsyncResult<Value>) -> Result<Value, VmError> {
    result.outcome().unwrap_or_else(|| {
        Err(RuntimeError::new("module is waiting on a host result that never settles").into())
    })
}

fn run_module(
    file: &str,
    entry: Option<&str>,
    globals: Vec<(String, String)>,
    json: bool,
) -> Result<(), VmError> {
    let path = Path::new(file);
    let module = read_module(file)?;
    let root = path.parent().unwrap_or(Path::new("."));

    let config = InterpreterConfig::from_env()?;
    let globals: IndexMap<String, Value> = globals
        .iter()
        .map(|(name, raw)| (name.clone(), parse_global(raw)))
        .collect();
    let loader = Rc::new(DirLoader::new(root));
    // Serve the file itself from memory so its name need not match the file stem.
    let name = loader.insert(module).name.clone();
    let runtime = Runtime::new(config, Rc::new(builtins::registry()), loader, globals);
    let module_frame = settled(runtime.import_module(&name))?;

    let value = match entry {
        Some(entry) => {
            let callable = module_frame.as_frame()?.borrow().get_value(entry)?.as_callable()?;
            settled(runtime.exec_callable(&callable, Vec::new(), None))?
        }
        None => module_frame,
    };
    let json = json || entry.is_none();

    let output = runtime.with_interpreter(|interp| {
        if json {
            let json = render::to_json(interp, &value)?;
            serde_json::to_string_pretty(&json).map_err(|e| RuntimeError::new(e.to_string()))
        } else {
            render::to_text(interp, &value)
        }
    })??;
    println!("{}", output);
    Ok(())
}
