use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use worldstore::builtin_content::{builtin_tags, register_builtin_content};
use worldstore::codec::decode_any;
use worldstore::{
    Category, ContentManifest, Identifier, RecordEncoding, RecordPipeline, RegistryBuilder,
    StoreConfig, TagIndex, TypeRegistry, ValidationMode,
};

#[derive(Parser)]
#[command(
    name = "worldstore-cli",
    about = "Inspect, migrate and validate versioned world records"
)]
struct Cli {
    /// Store configuration JSON (default: built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the header and payload of one record file
    Inspect {
        /// Input record file
        #[arg(long, short)]
        input: PathBuf,
    },
    /// Load a record through the fixer chain and write it at the current version
    Migrate {
        /// Input record file
        #[arg(long, short)]
        input: PathBuf,
        /// Output record file (default: <input>.migrated)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Content manifest JSON; may be repeated
        #[arg(long)]
        manifest: Vec<PathBuf>,
        /// Output encoding: "binary" or "json" (default: from config)
        #[arg(long)]
        encoding: Option<RecordEncoding>,
        /// Report the result without writing output
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Load every input and report each outcome
    Validate {
        /// Input record files
        #[arg(long, short, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Content manifest JSON; may be repeated
        #[arg(long)]
        manifest: Vec<PathBuf>,
        /// Report every schema violation instead of the first
        #[arg(long, default_value_t = false)]
        diagnostic: bool,
    },
    /// List the members of a tag
    Tags {
        /// "block", "entity" or "item"
        #[arg(long)]
        category: Category,
        /// Tag identifier, e.g. core:can_be_burnt
        #[arg(long)]
        tag: Identifier,
        /// Content manifest JSON; may be repeated
        #[arg(long)]
        manifest: Vec<PathBuf>,
    },
}

fn invalid_data(error: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error.to_string())
}

fn load_config(path: Option<&Path>) -> io::Result<StoreConfig> {
    match path {
        Some(path) => StoreConfig::load(path).map_err(invalid_data),
        None => Ok(StoreConfig::default()),
    }
}

fn load_manifests(paths: &[PathBuf]) -> io::Result<Vec<ContentManifest>> {
    paths
        .iter()
        .map(|path| ContentManifest::load(path).map_err(invalid_data))
        .collect()
}

fn build_registry(manifests: &[ContentManifest]) -> io::Result<Arc<TypeRegistry>> {
    let mut builder = RegistryBuilder::new();
    register_builtin_content(&mut builder).map_err(invalid_data)?;
    for manifest in manifests {
        manifest.register_into(&mut builder).map_err(invalid_data)?;
    }
    builder.build().map(Arc::new).map_err(invalid_data)
}

fn run_inspect(input: &Path) -> io::Result<()> {
    let bytes = std::fs::read(input)?;
    let record = decode_any(&bytes).map_err(invalid_data)?;
    println!("File:     {}", input.display());
    println!("Bytes:    {}", bytes.len());
    println!("Category: {}", record.category);
    println!("Id:       {}", record.id);
    println!("Version:  {}", record.version);
    let pretty = serde_json::to_string_pretty(&record.payload).map_err(invalid_data)?;
    println!("Payload:\n{pretty}");
    Ok(())
}

fn run_migrate(
    config: &StoreConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    manifests: &[PathBuf],
    encoding: Option<RecordEncoding>,
    dry_run: bool,
) -> io::Result<()> {
    let registry = build_registry(&load_manifests(manifests)?)?;
    let pipeline = RecordPipeline::from_config(registry, config)
        .with_encoding(encoding.unwrap_or(config.encoding));
    let bytes = std::fs::read(&input)?;
    let loaded = pipeline.load_record(&bytes).map_err(invalid_data)?;
    let saved = pipeline
        .save_record(loaded.record.as_ref())
        .map_err(invalid_data)?;
    let current = decode_any(&saved).map_err(invalid_data)?.version;
    println!(
        "{} {}: v{} -> v{}{}",
        loaded.record.category(),
        loaded.record.identity(),
        loaded.stored_version,
        current,
        if loaded.is_placeholder() {
            " (unregistered, kept as is)"
        } else {
            ""
        }
    );
    if dry_run {
        println!("Dry run: no output written");
        return Ok(());
    }
    let output = output.unwrap_or_else(|| {
        let mut name = input.clone().into_os_string();
        name.push(".migrated");
        PathBuf::from(name)
    });
    std::fs::write(&output, saved)?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn run_validate(
    config: &StoreConfig,
    inputs: &[PathBuf],
    manifests: &[PathBuf],
    diagnostic: bool,
) -> io::Result<()> {
    let registry = build_registry(&load_manifests(manifests)?)?;
    let mode = if diagnostic {
        ValidationMode::Diagnostic
    } else {
        config.validation_mode
    };
    let pipeline = RecordPipeline::from_config(registry, config).with_mode(mode);
    let blobs = inputs
        .iter()
        .map(std::fs::read)
        .collect::<io::Result<Vec<_>>>()?;
    let results = pipeline.par_load_batch(&blobs);

    let mut failures = 0usize;
    for (path, result) in inputs.iter().zip(&results) {
        match result {
            Ok(loaded) if loaded.is_placeholder() => println!(
                "{}: unregistered {} {} kept",
                path.display(),
                loaded.record.category(),
                loaded.record.identity()
            ),
            Ok(loaded) => println!(
                "{}: ok {} {} (stored v{})",
                path.display(),
                loaded.record.category(),
                loaded.record.identity(),
                loaded.stored_version
            ),
            Err(error) => {
                failures += 1;
                println!("{}: FAILED {error}", path.display());
            }
        }
    }
    println!("{} records, {failures} failed", results.len());
    if failures > 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{failures} of {} records failed to load", results.len()),
        ));
    }
    Ok(())
}

fn run_tags(category: Category, tag: &Identifier, manifests: &[PathBuf]) -> io::Result<()> {
    let manifests = load_manifests(manifests)?;
    let declarations = builtin_tags()
        .map_err(invalid_data)?
        .into_iter()
        .chain(manifests.iter().flat_map(ContentManifest::tag_source));
    let index = TagIndex::build(declarations);
    let members = index.members(category, tag);
    if members.is_empty() {
        println!("{category} tag {tag} has no members");
    }
    for member in members {
        println!("{member}");
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Inspect { input } => run_inspect(&input),
        Command::Migrate {
            input,
            output,
            manifest,
            encoding,
            dry_run,
        } => run_migrate(&config, input, output, &manifest, encoding, dry_run),
        Command::Validate {
            input,
            manifest,
            diagnostic,
        } => run_validate(&config, &input, &manifest, diagnostic),
        Command::Tags {
            category,
            tag,
            manifest,
        } => run_tags(category, &tag, &manifest),
    });
    if let Err(err) = result {
        exit_with_error(err);
    }
}

fn exit_with_error(err: io::Error) -> ! {
    eprintln!("Error: {}", err);
    std::process::exit(1);
}
