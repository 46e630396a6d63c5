use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mergetree::{json, merge, yaml, EvalOptions, Evaluator, Path, Phase, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mergetree")]
#[command(version, about = "Merge YAML documents and resolve (( operator )) calls", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge the files left to right and print the evaluated result.
    Merge {
        /// Remove this path from the output (repeatable; `*` matches any key).
        #[arg(long)]
        prune: Vec<String>,

        /// Merge only; leave operator calls untouched.
        #[arg(long)]
        skip_eval: bool,

        /// Print JSON instead of YAML.
        #[arg(long)]
        json: bool,

        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print the order in which a phase's operator calls would run.
    Dataflow {
        #[arg(long, value_enum, default_value_t = PhaseArg::Eval)]
        phase: PhaseArg,

        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    Merge,
    Eval,
    Param,
}

impl From<PhaseArg> for Phase {
    fn from(p: PhaseArg) -> Phase {
        match p {
            PhaseArg::Merge => Phase::Merge,
            PhaseArg::Eval => Phase::Eval,
            PhaseArg::Param => Phase::Param,
        }
    }
}

fn load(files: &[String]) -> Result<Value> {
    let mut docs = Vec::with_capacity(files.len());
    for file in files {
        let text =
            std::fs::read_to_string(file).with_context(|| format!("read input file {}", file))?;
        let doc = yaml::from_yaml_str(&text).with_context(|| format!("parse {}", file))?;
        docs.push(doc);
    }
    merge::merge_all(docs).context("merge input documents")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.cmd {
        Commands::Merge {
            prune,
            skip_eval,
            json: as_json,
            files,
        } => {
            let prune = prune
                .iter()
                .map(|p| Path::parse(p).with_context(|| format!("bad --prune path {}", p)))
                .collect::<Result<Vec<_>>>()?;
            let options = EvalOptions {
                prune,
                skip_eval,
                ..EvalOptions::default()
            };
            let mut ev = Evaluator::new(load(&files)?).with_options(options);
            if let Err(errors) = ev.run() {
                eprintln!("{}", errors);
                std::process::exit(2);
            }
            if as_json {
                println!("{}", json::to_json_pretty(&ev.tree));
            } else {
                print!("{}", yaml::to_yaml_string(&ev.tree)?);
            }
        }
        Commands::Dataflow { phase, files } => {
            let mut ev = Evaluator::new(load(&files)?);
            let ops = match ev.data_flow(phase.into()) {
                Ok(ops) => ops,
                Err(errors) => bail!("{}", errors),
            };
            let report: Vec<Value> = ops
                .iter()
                .map(|op| {
                    let mut entry = mergetree::Map::new();
                    entry.insert(op.location().to_string(), Value::from(op.src()));
                    Value::Map(entry)
                })
                .collect();
            print!("{}", yaml::to_yaml_string(&Value::Seq(report))?);
        }
    }

    Ok(())
}
