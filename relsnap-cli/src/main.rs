/*!
relsnap CLI - offline tools for relationship backup files.

These commands read, verify and redact backup files without talking to a
permission service. Every `<file>` argument accepts `-` for stdin.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relsnap_core::observability::{init_observability, DEFAULT_DIRECTIVE};
use relsnap_core::{
    Compression, Decoder, NoopRewriter, PrefixFilter, RedactionMap, RedactionOptions, Redactor,
    Rewriter,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

const STDIO: &str = "-";

#[derive(Parser)]
#[command(name = "relsnap")]
#[command(about = "Inspect, verify and redact relationship backups")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, env = "RELSNAP_VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "RELSNAP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a copy of a backup with names and object ids replaced
    Redact(RedactArgs),
    /// Print the schema stored in a backup
    ParseSchema {
        /// Backup file, or - for stdin
        file: PathBuf,
        /// Keep only definitions and caveats under this prefix
        #[arg(long)]
        prefix_filter: Option<String>,
    },
    /// Print the snapshot token a backup was taken at
    ParseRevision {
        /// Backup file, or - for stdin
        file: PathBuf,
    },
    /// Print the relationships stored in a backup, one per line
    ParseRelationships {
        /// Backup file, or - for stdin
        file: PathBuf,
        /// Keep only relationships under this prefix
        #[arg(long)]
        prefix_filter: Option<String>,
    },
    /// Read a whole backup and check its integrity trailer
    Verify {
        /// Backup file, or - for stdin
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RedactArgs {
    /// Backup file, or - for stdin
    file: PathBuf,

    /// Output file, or - for stdout [default: <file>.redacted]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep definition and caveat names
    #[arg(long)]
    no_redact_definitions: bool,

    /// Keep relation and permission names
    #[arg(long)]
    no_redact_relations: bool,

    /// Keep object ids
    #[arg(long)]
    no_redact_object_ids: bool,

    /// Print the original to redacted object id mapping
    #[arg(long)]
    print_redacted_object_ids: bool,

    /// Write the redacted backup without gzip
    #[arg(long)]
    uncompressed: bool,
}

impl RedactArgs {
    fn options(&self) -> RedactionOptions {
        RedactionOptions {
            redact_definitions: !self.no_redact_definitions,
            redact_relations: !self.no_redact_relations,
            redact_object_ids: !self.no_redact_object_ids,
            record_object_ids: self.print_redacted_object_ids,
        }
    }

    fn compression(&self) -> Compression {
        if self.uncompressed {
            Compression::None
        } else {
            Compression::Gzip
        }
    }

    fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| default_redacted_path(&self.file))
    }
}

#[derive(Tabled)]
struct RenameRow {
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Original")]
    original: String,
    #[tabled(rename = "Redacted")]
    redacted: String,
}

#[derive(Tabled, Debug, PartialEq)]
struct ResourceTypeRow {
    #[tabled(rename = "Resource Type")]
    resource_type: String,
    #[tabled(rename = "Relationships")]
    relationships: u64,
    #[tabled(rename = "Caveated")]
    caveated: u64,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json)?;

    match cli.command {
        Commands::Redact(args) => redact(&args)?,
        Commands::ParseSchema {
            file,
            prefix_filter,
        } => {
            let decoder = open_backup(&file)?;
            let schema = rewriter(prefix_filter.as_deref())?.rewrite_schema(decoder.schema())?;
            print!("{schema}");
            if !schema.ends_with('\n') {
                println!();
            }
        }
        Commands::ParseRevision { file } => {
            let decoder = open_backup(&file)?;
            println!("{}", decoder.zed_token());
        }
        Commands::ParseRelationships {
            file,
            prefix_filter,
        } => {
            let decoder = open_backup(&file)?;
            let rewriter = rewriter(prefix_filter.as_deref())?;
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let printed = print_relationships(decoder, rewriter.as_ref(), &mut out)?;
            out.flush()?;
            debug!(relationships = printed, "printed relationships");
        }
        Commands::Verify { file } => verify(&file)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    let directive = if verbose { "relsnap=debug" } else { DEFAULT_DIRECTIVE };
    init_observability(json, directive)?;
    Ok(())
}

fn is_stdio(path: &Path) -> bool {
    path == Path::new(STDIO)
}

fn open_backup(path: &Path) -> Result<Decoder<Box<dyn Read>>, anyhow::Error> {
    let reader: Box<dyn Read> = if is_stdio(path) {
        Box::new(io::stdin().lock())
    } else {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };

    Decoder::new(reader).with_context(|| format!("failed to read backup {}", path.display()))
}

fn rewriter(prefix: Option<&str>) -> Result<Box<dyn Rewriter>, anyhow::Error> {
    Ok(match prefix {
        Some(prefix) => Box::new(PrefixFilter::new(prefix)?),
        None => Box::new(NoopRewriter),
    })
}

/// `prod.backup` becomes `prod.redacted.backup`; stdin redacts to stdout
fn default_redacted_path(input: &Path) -> PathBuf {
    if is_stdio(input) {
        return PathBuf::from(STDIO);
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{stem}.redacted.{}", ext.to_string_lossy()),
        None => format!("{stem}.redacted"),
    };
    input.with_file_name(name)
}

/// Run `write` against `target`, replacing the file only once `write` succeeds
fn write_output<T>(
    target: &Path,
    write: impl FnOnce(&mut dyn Write) -> Result<T, anyhow::Error>,
) -> Result<T, anyhow::Error> {
    if is_stdio(target) {
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        let result = write(&mut out)?;
        out.flush()?;
        return Ok(result);
    }

    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;

    let result = write(temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(target)
        .with_context(|| format!("failed to write {}", target.display()))?;

    Ok(result)
}

fn redact(args: &RedactArgs) -> Result<(), anyhow::Error> {
    let output = args.output_path();
    if !is_stdio(&output) && output == args.file {
        bail!("refusing to overwrite the input backup {}", output.display());
    }

    info!(input = %args.file.display(), output = %output.display(), "redacting backup");

    let decoder = open_backup(&args.file)?;
    let map = write_output(&output, |out| {
        let redactor = Redactor::new(decoder, out, args.options(), args.compression())?;
        let (_, map) = redactor.finish()?;
        Ok(map)
    })?;

    let rows = map_rows(&map);
    debug!(renamed = rows.len(), "redaction map built");
    // The backup itself may be on stdout
    eprintln!("{}", Table::new(rows));
    if !is_stdio(&output) {
        eprintln!("✓ Redacted backup written to {}", output.display());
    }

    Ok(())
}

fn map_rows(map: &RedactionMap) -> Vec<RenameRow> {
    let named = [
        ("definition", map.definitions()),
        ("caveat", map.caveats()),
        ("relation", map.relations()),
        ("object id", map.object_ids().unwrap_or_default()),
    ];

    named
        .into_iter()
        .flat_map(|(kind, pairs)| {
            pairs.into_iter().map(move |(original, redacted)| RenameRow {
                kind,
                original: original.to_string(),
                redacted: redacted.to_string(),
            })
        })
        .collect()
}

fn print_relationships<R: Read>(
    decoder: Decoder<R>,
    rewriter: &dyn Rewriter,
    out: &mut impl Write,
) -> Result<u64, anyhow::Error> {
    let mut printed = 0;
    for relationship in decoder {
        if let Some(relationship) = rewriter.rewrite_relationship(relationship?)? {
            writeln!(out, "{relationship}")?;
            printed += 1;
        }
    }
    Ok(printed)
}

/// Read every relationship and tally them per resource type
fn resource_type_rows<R: Read>(
    decoder: &mut Decoder<R>,
) -> Result<Vec<ResourceTypeRow>, anyhow::Error> {
    let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    while let Some(relationship) = decoder.next_relationship()? {
        let entry = counts.entry(relationship.resource_type).or_default();
        entry.0 += 1;
        if relationship.caveat_name.is_some() {
            entry.1 += 1;
        }
    }

    Ok(counts
        .into_iter()
        .map(|(resource_type, (relationships, caveated))| ResourceTypeRow {
            resource_type,
            relationships,
            caveated,
        })
        .collect())
}

fn verify(path: &Path) -> Result<(), anyhow::Error> {
    info!("Verifying backup: {}", path.display());

    let mut decoder = open_backup(path)?;
    let rows = match resource_type_rows(&mut decoder) {
        Ok(rows) => rows,
        Err(e) => {
            error!("✗ Failed to verify backup: {:#}", e);
            return Err(e);
        }
    };

    let header = decoder.header();
    println!("Backup Details:");
    println!("  Format Version: {}", header.format_version);
    println!("  Revision: {}", header.zed_token);
    println!("  Created: {}", format_timestamp(header.created_at.timestamp()));
    println!("  Compression: {}", decoder.compression().algorithm_name());
    println!("  Schema: {}", format_size(header.schema.len() as u64));
    println!("  Relationships: {}", decoder.records_read());

    if !rows.is_empty() {
        println!("{}", Table::new(rows));
    }
    println!("✓ Backup is valid and integrity check passed");

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}
