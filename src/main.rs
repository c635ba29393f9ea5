use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use droidbrew::bytecode::disassemble;
use droidbrew::dex::{read_dex_file, DexParser};
use droidbrew::program::binary_name;
use droidbrew::{LoadError, Runtime, RuntimeError, Value, VmConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs DEX bytecode on the host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Heap capacity in bytes
    #[arg(long, global = true)]
    heap_size: Option<usize>,

    /// Heap occupancy, in (0, 1], that triggers a collection
    #[arg(long, global = true)]
    gc_threshold: Option<f64>,

    /// Invocations before a method is promoted
    #[arg(long, global = true)]
    jit_threshold: Option<u64>,

    #[arg(long, global = true, help = "Interpret every method")]
    no_jit: bool,

    #[arg(long, global = true, help = "Print the call trace after the run")]
    trace_calls: bool,

    #[arg(long, global = true, help = "Reject images whose checksum does not match")]
    verify_checksum: bool,

    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an image and run its `main(String[])`
    Run {
        file: PathBuf,
        /// Arguments handed to `main`
        args: Vec<String>,
    },
    /// Print the classes, methods and disassembly of an image
    Dump { file: PathBuf },
}

impl Cli {
    fn config(&self) -> VmConfig {
        let defaults = VmConfig::default();
        VmConfig {
            heap_capacity: self.heap_size.unwrap_or(defaults.heap_capacity),
            gc_threshold: self.gc_threshold.unwrap_or(defaults.gc_threshold),
            jit_threshold: self.jit_threshold.unwrap_or(defaults.jit_threshold),
            jit_enabled: !self.no_jit,
            trace_calls: self.trace_calls,
            verify_checksum: self.verify_checksum,
            ..defaults
        }
    }
}

fn read(file: &Path) -> Result<Vec<u8>, RuntimeError> {
    read_dex_file(file).map_err(|err| RuntimeError::Load(LoadError::Io(err)))
}

fn run(cli: &Cli, file: &Path, args: &[String]) -> Result<(), RuntimeError> {
    let bytes = read(file)?;
    let mut runtime = Runtime::new(cli.config())?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let result = runtime.run_entry_point_with_args(&bytes, &args);
    if cli.trace_calls {
        eprint!("{}", runtime.trace_dump());
    }
    match result? {
        Some(Value::Object(id)) => match runtime.string_value(&Value::Object(id)) {
            Some(s) => println!("result: {:?}", s),
            None => println!("result: object {}", id),
        },
        Some(value) => println!("result: {:?}", value),
        None => {}
    }
    let heap = runtime.heap_stats();
    let gc = runtime.gc_stats();
    log::info!(
        "heap {}/{} bytes, {} objects, {} collections, {} promotions",
        heap.used_bytes,
        heap.capacity_bytes,
        heap.object_count,
        gc.collections,
        runtime.jit().promotions()
    );
    Ok(())
}

fn dump(file: &Path) -> Result<(), RuntimeError> {
    let bytes = read(file)?;
    let image = DexParser::parse(&bytes)?;
    println!(
        "dex version {:03}, {} strings, {} types, {} methods",
        image.header.version(),
        image.strings.len(),
        image.types.len(),
        image.methods.len()
    );
    for class in &image.classes {
        println!("class {} extends {}", binary_name(&class.name), binary_name(&class.superclass));
        for method in class.methods() {
            println!("  {}{} flags={:#x}", method.name, method.proto.signature(), method.access_flags);
            match &method.code {
                Some(code) => {
                    for line in disassemble(code) {
                        println!("    {}", line);
                    }
                }
                None => println!("    (no code)"),
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match &cli.command {
        Command::Run { file, args } => run(&cli, file, args),
        Command::Dump { file } => dump(file),
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}
