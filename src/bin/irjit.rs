//! Command line driver: optimize, print, compile, interpret or run an IR text module.

use clap::{Parser, ValueEnum};
use irjit::core::TargetArch;
use irjit::driver::{run_module, DriverOptions, DEFAULT_MEMORY_SIZE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    Arm64,
    X64,
}

impl From<TargetArg> for TargetArch {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Arm64 => TargetArch::Arm64,
            TargetArg::X64 => TargetArch::X64,
        }
    }
}

#[derive(Parser)]
#[command(name = "irjit")]
#[command(about = "Optimize and compile guest IR blocks", long_about = None)]
struct Cli {
    /// IR text module to process
    file: PathBuf,

    /// Code generation target (defaults to the host)
    #[arg(long, value_enum)]
    target: Option<TargetArg>,

    /// Comma separated pass list replacing the default pipeline
    #[arg(long, value_name = "LIST")]
    passes: Option<String>,

    /// Skip every optimization pass
    #[arg(long, conflicts_with = "passes")]
    no_opt: bool,

    /// Print each block after optimization
    #[arg(long)]
    print_ir: bool,

    /// Compile each block and print a code summary
    #[arg(long)]
    compile: bool,

    /// Hex dump the machine code of each block
    #[arg(long)]
    hex: bool,

    /// Execute each block with the interpreter
    #[arg(long)]
    interpret: bool,

    /// Compile each block and execute it natively
    #[arg(long)]
    run: bool,

    /// Write the compiled blocks to an ELF object file
    #[arg(long, value_name = "FILE")]
    emit_obj: Option<PathBuf>,

    /// Print compilation statistics
    #[arg(long)]
    stats: bool,

    /// Guest memory size in bytes for executed blocks
    #[arg(long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory_size: usize,
}

impl Cli {
    fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            target: self.target.map(TargetArch::from).unwrap_or_else(TargetArch::host),
            passes: self.passes.clone(),
            no_opt: self.no_opt,
            print_ir: self.print_ir,
            compile: self.compile,
            hex: self.hex,
            interpret: self.interpret,
            run: self.run,
            stats: self.stats,
            emit_obj: self.emit_obj.clone(),
            memory_size: self.memory_size,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let text = match std::fs::read_to_string(&cli.file) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("error: {}: {}", cli.file.display(), err);
            return ExitCode::FAILURE;
        }
    };

    match run_module(&text, &cli.driver_options()) {
        Ok(report) => {
            print!("{}", report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
