use aggspill::operators::DocumentStream;
use aggspill::utils::{format_bytes, format_duration, setup_logging, throughput};
use aggspill::{
    AggregateRequest, CancellationToken, Document, EngineConfig, EngineError, ExecutionCoordinator,
    ExecutionStats, Stage,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "aggspill")]
#[command(about = "Memory-bounded $group / $sort / $limit pipelines over JSON-lines documents")]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Input file with one JSON document per line")]
    input: PathBuf,

    #[arg(short, long, help = "Pipeline file: a stage array or a full aggregate request")]
    pipeline: PathBuf,

    #[arg(short, long, help = "Output file for result documents (stdout if omitted)")]
    output: Option<PathBuf>,

    #[arg(short, long, default_value = "aggspill_config.json", help = "Configuration file")]
    config: PathBuf,

    #[arg(long, help = "Allow operators to spill to the temp directory")]
    allow_disk_use: bool,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        EngineConfig::from_file(&args.config)?
    } else {
        eprintln!("📄 Config file not found, creating default: {}", args.config.display());
        let default_config = EngineConfig::default();
        default_config.to_file(&args.config)?;
        default_config
    };

    if args.verbose {
        config.verbose = true;
    }
    setup_logging(if config.verbose { "verbose" } else { "normal" })?;

    if !args.input.exists() {
        return Err(anyhow::anyhow!("Input file does not exist: {}", args.input.display()));
    }

    let mut request = load_request(&args.pipeline)?;
    if args.allow_disk_use {
        request.allow_disk_use = true;
    }

    info!("Input: {}", args.input.display());
    info!("Memory limit per operator: {}", format_bytes(config.memory_limit() as u64));
    info!("Spill directory: {}", config.temp_directory.display());

    let cancellation = CancellationToken::new();
    let signal_token = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, cancelling the pipeline");
            signal_token.cancel();
        }
    });

    let coordinator = ExecutionCoordinator::new(config)?.with_cancellation(cancellation);
    let start_time = Instant::now();

    let input = args.input.clone();
    let output = args.output.clone();
    let result = tokio::task::spawn_blocking(move || {
        run_pipeline(&coordinator, request, &input, output.as_deref())
    })
    .await?;

    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            if let Some(engine_error) = e.downcast_ref::<EngineError>() {
                eprintln!("❌ Aggregation failed with code {}: {}", engine_error.code(), engine_error);
            }
            return Err(e);
        }
    };

    let elapsed = start_time.elapsed().as_secs_f64();
    eprintln!("\n🎉 Aggregation completed");
    eprintln!("📥 Documents in: {}", stats.documents_in);
    eprintln!("📤 Documents out: {}", stats.documents_out);
    eprintln!(
        "💿 Spilled: {} runs, {} records, {}",
        stats.runs_spilled,
        stats.records_spilled,
        format_bytes(stats.bytes_spilled)
    );
    eprintln!("💾 Peak operator memory: {}", format_bytes(stats.peak_memory_bytes as u64));
    eprintln!("⏱️ Total time: {}", format_duration(elapsed));
    if let Some(rate) = throughput(stats.documents_in, elapsed) {
        eprintln!("🔄 Throughput: {:.0} documents/sec", rate);
    }

    Ok(())
}

/// Accepts either a bare stage array or `{"pipeline": [...], "allowDiskUse": ...}`.
fn load_request(path: &Path) -> Result<AggregateRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
    let spec: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Pipeline file {} is not valid JSON", path.display()))?;

    let request = if spec.is_array() {
        AggregateRequest::new(Stage::parse_pipeline(&spec)?)
    } else {
        AggregateRequest::from_json(&spec)?
    };
    Ok(request)
}

fn read_documents(path: &Path, io_buffer_size: usize) -> Result<DocumentStream> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::with_capacity(io_buffer_size, file);
    let path = path.to_path_buf();

    Ok(Box::new(reader.lines().enumerate().filter_map(move |(index, line)| {
        match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(parse_document(&line, index + 1)),
            Err(e) => Some(Err(EngineError::io(&path, e))),
        }
    })))
}

fn parse_document(line: &str, line_number: usize) -> aggspill::error::Result<Document> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
        EngineError::invalid_argument(format!("input line {} is not valid JSON: {}", line_number, e))
    })?;
    Document::from_json(value)
}

fn write_documents<W: Write>(
    writer: &mut W,
    documents: impl Iterator<Item = aggspill::error::Result<Document>>,
) -> Result<()> {
    for document in documents {
        serde_json::to_writer(&mut *writer, &document?.to_json())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn run_pipeline(
    coordinator: &ExecutionCoordinator,
    request: AggregateRequest,
    input: &Path,
    output: Option<&Path>,
) -> Result<ExecutionStats> {
    let source = read_documents(input, coordinator.config().io_buffer_size_bytes())?;
    let mut stream = coordinator.execute_stream(request, source)?;

    match output {
        Some(path) => {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&parent)?;

            // Results only appear at `path` once the whole pipeline succeeded
            let staging = NamedTempFile::new_in(&parent)?;
            let mut writer = BufWriter::new(staging.as_file());
            write_documents(&mut writer, stream.by_ref())?;
            drop(writer);
            staging
                .persist(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Results written to {}", path.display());
        }
        None => {
            // Staged as well, so a failure mid-stream prints nothing
            let mut staging = tempfile::tempfile()?;
            let mut writer = BufWriter::new(&staging);
            write_documents(&mut writer, stream.by_ref())?;
            drop(writer);

            staging.seek(SeekFrom::Start(0))?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            std::io::copy(&mut staging, &mut out)?;
            out.flush()?;
        }
    }

    Ok(stream.stats())
}
