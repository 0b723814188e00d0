use clap::Parser;
use std::path::PathBuf;
use std::process;

use ipa::config::IpaConfig;
use ipa::pass::PassId;
use ipa::pipeline::analyze_program_through;
use ipa::program::Program;
use ipa::rules::StandardRules;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Indented program dump with size annotations
    Annotated,
    /// The rewritten program as JSON
    Json,
    /// Graphviz DOT
    Dot,
    /// Analysis report as JSON
    Report,
}

#[derive(Parser, Debug)]
#[command(
    name = "ipa",
    version,
    about = "Inter-procedural size and sparsity analysis for matrix programs"
)]
struct Cli {
    /// Input program (JSON)
    program: PathBuf,

    /// Pass configuration (JSON); missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output form
    #[arg(long, value_enum, default_value_t = EmitStage::Annotated)]
    emit: EmitStage,

    /// Stop after the named pass
    #[arg(long, value_parser = parse_pass)]
    stop_after: Option<PassId>,

    /// Output file path (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log passes and timing to stderr
    #[arg(long)]
    verbose: bool,
}

fn parse_pass(name: &str) -> Result<PassId, String> {
    PassId::from_name(name).ok_or_else(|| {
        let names: Vec<&str> = ipa::pass::ALL_PASSES.iter().map(|p| p.name()).collect();
        format!("unknown pass '{}' (expected one of: {})", name, names.join(", "))
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "ipa=debug" } else { "ipa=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // ── Load configuration ──
    let config = match &cli.config {
        Some(path) => match IpaConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("ipa: {}: {}", path.display(), e.render());
                process::exit(2);
            }
        },
        None => IpaConfig::default(),
    };

    // ── Read and validate program ──
    let text = match std::fs::read_to_string(&cli.program) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ipa: error: {}: {}", cli.program.display(), e);
            process::exit(2);
        }
    };
    let mut program: Program = match serde_json::from_str(&text) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("ipa: error: {}: {}", cli.program.display(), e);
            process::exit(2);
        }
    };
    if let Err(e) = program.validate() {
        eprintln!("ipa: {}", e.render());
        process::exit(2);
    }

    // ── Analyze ──
    let stop_after = cli.stop_after.unwrap_or(PassId::ConstantOps);
    let report = match analyze_program_through(&mut program, &config, &StandardRules, stop_after)
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("ipa: {}", e.render());
            process::exit(1);
        }
    };
    if cli.verbose {
        for t in &report.timings {
            eprintln!("ipa: {} complete, {:.1}ms", t.pass, t.elapsed_ms);
        }
    }

    // ── Emit ──
    let rendered = match cli.emit {
        EmitStage::Annotated => Ok(program.to_string()),
        EmitStage::Json => serde_json::to_string_pretty(&program),
        EmitStage::Dot => Ok(ipa::dot::emit_dot(&program)),
        EmitStage::Report => serde_json::to_string_pretty(&report),
    };
    let mut rendered = match rendered {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ipa: error: serialization failed: {}", e);
            process::exit(1);
        }
    };
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &rendered) {
                eprintln!("ipa: error: {}: {}", path.display(), e);
                process::exit(2);
            }
        }
        None => print!("{}", rendered),
    }
}
