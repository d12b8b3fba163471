use anyhow::Context;
use clap::{Parser, Subcommand};
use classlist::{ClassListLine, ClassListParser};
use common::{CdsConfig, Runtime};
use precompiler::TrainingData;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use writer::{DumpSession, MappedArchive, RestoredArchive};

/// Archive written when neither `--output` nor `SharedArchiveFile` names one.
const DEFAULT_ARCHIVE: &str = "app.aot";

/// Extra `-XX:` options, whitespace separated, applied before the command line.
const OPTIONS_ENV: &str = "AOTCDS_OPTIONS";

#[derive(Parser)]
#[command(name = "aotcds")]
#[command(about = "Ahead-of-time class data sharing archiver", long_about = None)]
struct Cli {
    /// Maximum level of the log written to stderr.
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a training snapshot to an archive.
    Dump {
        /// Runtime snapshot (JSON) recorded by the training run.
        #[arg(long)]
        snapshot: PathBuf,
        /// Class list; defaults to `SharedClassListFile`.
        #[arg(long)]
        classlist: Option<PathBuf>,
        /// Method profiles (JSON) for precompilation.
        #[arg(long)]
        training_data: Option<PathBuf>,
        /// Archive path; defaults to `SharedArchiveFile`, then `app.aot`.
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Configuration file (JSON) applied before `-X` options.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Runtime option, e.g. `-X ArchiveHeap=false` or `-X -XX:+VerifySharedSpaces`.
        #[arg(short = 'X', value_name = "OPTION", allow_hyphen_values = true)]
        options: Vec<String>,
    },
    /// Print an archive's header, section table and record counts.
    Print {
        archive: PathBuf,
        #[arg(short = 'X', value_name = "OPTION", allow_hyphen_values = true)]
        options: Vec<String>,
    },
    /// Map an archive into a production runtime and replay its init list.
    Replay {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(short = 'X', value_name = "OPTION", allow_hyphen_values = true)]
        options: Vec<String>,
    },
    /// Parse a class list and report its diagnostics.
    CheckClasslist { file: PathBuf },
}

fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: .env: {}", e);
        }
    }
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .without_time()
        .with_max_level(cli.log_level)
        .init();

    match &cli.command {
        Commands::Dump {
            snapshot,
            classlist,
            training_data,
            output,
            config,
            options,
        } => cmd_dump(
            snapshot,
            classlist.as_deref(),
            training_data.as_deref(),
            output.as_deref(),
            &load_config(config.as_deref(), options)?,
        )?,
        Commands::Print { archive, options } => cmd_print(archive, &load_config(None, options)?)?,
        Commands::Replay {
            snapshot,
            archive,
            config,
            options,
        } => cmd_replay(snapshot, archive, &load_config(config.as_deref(), options)?)?,
        Commands::CheckClasslist { file } => cmd_check_classlist(file)?,
    }

    Ok(())
}

/// Config file, then `AOTCDS_OPTIONS`, then `-X` options in order.
fn load_config(file: Option<&Path>, options: &[String]) -> anyhow::Result<CdsConfig> {
    let mut config = match file {
        Some(path) => CdsConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => CdsConfig::default(),
    };
    let env = std::env::var(OPTIONS_ENV).unwrap_or_default();
    for option in env.split_whitespace().map(str::to_string).chain(options.iter().cloned()) {
        config
            .apply_option(&option)
            .with_context(|| format!("bad option {option}"))?;
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// dump
// ---------------------------------------------------------------------------

fn cmd_dump(
    snapshot: &Path,
    classlist: Option<&Path>,
    training_data: Option<&Path>,
    output: Option<&Path>,
    config: &CdsConfig,
) -> anyhow::Result<()> {
    let rt = Runtime::load_snapshot(snapshot).with_context(|| format!("loading {}", snapshot.display()))?;
    let mut session = DumpSession::new(rt, config.clone())?;
    if let Some(path) = training_data {
        session = session.with_training_data(TrainingData::load(path)?);
    }

    let classlist = classlist
        .map(Path::to_path_buf)
        .or_else(|| config.shared_class_list_file.as_ref().map(PathBuf::from));
    let mut warnings = 0;
    if let Some(path) = &classlist {
        let list = ClassListParser::parse_file(path)?;
        let report = session.apply_class_list(&list)?;
        warnings = report.warnings.len();
        info!(
            target: "classlist",
            "{}: {} classes, {} unregistered, {} lambda proxies, {} not found",
            path.display(),
            report.classes_loaded,
            report.unregistered,
            report.lambda_proxies,
            report.not_found
        );
    }

    let image = session.dump()?;
    let output = output
        .map(Path::to_path_buf)
        .or_else(|| config.shared_archive_file.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE));
    image.write_to(&output)?;

    let s = &image.summary;
    println!("+------------------------------------------+");
    println!("| AOTCDS DUMP                              |");
    println!("+------------------------------------------+");
    println!("| Classes          : {:>20} |", s.classes);
    println!("| Excluded         : {:>20} |", image.report.classes_excluded);
    println!("| Heap objects     : {:>20} |", s.heap_objects);
    println!("| Heap roots       : {:>20} |", s.roots);
    println!("| Subgraphs        : {:>20} |", s.subgraphs);
    println!("| Init list        : {:>20} |", s.init_entries);
    println!("| Lambda sites     : {:>20} |", s.lambda_sites);
    println!("| Class-list warns : {:>20} |", warnings);
    println!("| File size        : {:>20} |", s.file_size);
    println!("+------------------------------------------+");
    println!("Archive written to {}", output.display());

    if config.print_shared_archive_and_exit {
        cmd_print(&output, config)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// print
// ---------------------------------------------------------------------------

fn cmd_print(archive: &Path, config: &CdsConfig) -> anyhow::Result<()> {
    let mapped = MappedArchive::open(archive, config)?;
    print!("{}", mapped.describe());
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

fn cmd_replay(snapshot: &Path, archive: &Path, config: &CdsConfig) -> anyhow::Result<()> {
    let mut rt = Runtime::load_snapshot(snapshot).with_context(|| format!("loading {}", snapshot.display()))?;
    rt.take_events();

    // Start-up continues without the archive when it cannot be used.
    let mapped = match MappedArchive::open(archive, config) {
        Ok(mapped) => mapped,
        Err(e) => {
            warn!(target: "cds", "Unable to use shared archive {}: {}", archive.display(), e);
            if config.auto_create_shared_archive {
                info!(target: "cds", "AutoCreateSharedArchive: run `aotcds dump` to regenerate the archive");
            }
            return Ok(());
        }
    };
    let restored = match RestoredArchive::restore(&mapped, &mut rt, config) {
        Ok(restored) => restored,
        Err(e) => {
            warn!(target: "cds", "Unable to restore shared archive {}: {}", archive.display(), e);
            return Ok(());
        }
    };
    let startup = restored.start_up(&mut rt, config);

    let r = restored.report();
    let replay = &startup.replay;
    println!("+------------------------------------------+");
    println!("| AOTCDS REPLAY                            |");
    println!("+------------------------------------------+");
    println!("| Classes mapped   : {:>20} |", r.classes_mapped);
    println!("| Classes skipped  : {:>20} |", r.classes_skipped);
    println!("| Heap objects     : {:>20} |", r.heap_objects);
    println!("| Subgraphs        : {:>20} |", r.subgraphs_installed);
    println!("| Preloaded        : {:>20} |", startup.preloaded + replay.preloaded);
    println!("| Prelinked        : {:>20} |", startup.prelinked + replay.prelinked);
    println!("| Preinitialized   : {:>20} |", replay.preinitialized);
    println!("| Indy resolved    : {:>20} |", replay.indy_resolved);
    println!("| Replay failures  : {:>20} |", replay.failures);
    println!("| Precompiled      : {:>20} |", startup.compiled);
    println!("+------------------------------------------+");
    Ok(())
}

// ---------------------------------------------------------------------------
// check-classlist
// ---------------------------------------------------------------------------

fn cmd_check_classlist(file: &Path) -> anyhow::Result<()> {
    let list = ClassListParser::parse_file(file)?;
    let (mut lambda, mut cp, mut other) = (0, 0, 0);
    for line in &list.lines {
        match line.kind {
            ClassListLine::Class(_) => {}
            ClassListLine::LambdaProxy { .. } => lambda += 1,
            ClassListLine::ConstantPool { .. } => cp += 1,
            _ => other += 1,
        }
    }
    let unregistered = list.classes().filter(|(_, c)| c.is_unregistered()).count();
    println!("{}: {} lines", file.display(), list.lines.len());
    println!("  classes       {:>6}", list.class_count());
    println!("  unregistered  {:>6}", unregistered);
    println!("  lambda-proxy  {:>6}", lambda);
    println!("  cp            {:>6}", cp);
    println!("  other tagged  {:>6}", other);
    Ok(())
}
