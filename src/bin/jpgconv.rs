//! CLI binary for jpgconv.
//!
//! A thin shim over the library crate: `convert` runs one batch locally and
//! writes the ZIP to disk, `serve` starts the HTTP service.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use jpgconv::server::{self, AppState};
use jpgconv::{
    BatchProcessor, BatchRequest, ConversionConfig, ConversionProgressCallback, ProgressCallback,
    Task, TaskStore, UploadedFile,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch plus a log line per
/// file. Files finish out of order when converted concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, index: usize) -> String {
        let ms = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, _task_id: &str, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_files} file(s)…"))
        ));
    }

    fn on_file_start(&self, index: usize, _total: usize, filename: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(filename.to_string());
    }

    fn on_file_complete(&self, index: usize, total: usize, filename: &str, outputs: usize) {
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}  {}",
            green("✓"),
            index,
            total,
            filename,
            dim(&format!("{outputs} jpg")),
            dim(&self.elapsed(index)),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, index: usize, total: usize, filename: &str, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(['\u{2026}']).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}  {}",
            red("✗"),
            index,
            total,
            filename,
            red(&msg),
            dim(&self.elapsed(index)),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_files: usize, success_count: usize) {
        let failed = total_files.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} file(s) converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} file(s) converted  ({} failed)",
                if failed == total_files { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_files,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert photos and a PDF into one archive
  jpgconv convert IMG_0001.heic IMG_0002.heic scan.pdf -o photos.zip

  # Lower quality, JSON summary on stdout
  jpgconv convert --quality 60 --json *.heic -o small.zip

  # Rasterise PDF pages that contain no embedded image
  jpgconv convert --render-pages slides.pdf -o slides.zip

  # Start the HTTP service
  jpgconv serve --bind 0.0.0.0:8000

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH   pdfium shared library (file or directory); system path if unset
  RUST_LOG          tracing filter, overrides -v / -q
  JPGCONV_*         every flag has a JPGCONV_ equivalent (see --help)
"#;

#[derive(Parser, Debug)]
#[command(
    name = "jpgconv",
    version,
    about = "Batch-convert HEIC, PDF and raster images to JPG",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug-level logs.
    #[arg(short, long, global = true, env = "JPGCONV_VERBOSE")]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, global = true, env = "JPGCONV_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert local files into a ZIP archive.
    Convert(ConvertArgs),
    /// Run the HTTP upload/download service.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Files to convert (HEIC/HEIF, PDF, PNG, JPEG, WebP, BMP, TIFF, GIF).
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Where to write the archive.
    #[arg(short, long, env = "JPGCONV_OUTPUT", default_value = "converted_images.zip")]
    output: PathBuf,

    /// JPEG quality 1–100; out-of-range values are clamped.
    #[arg(long, env = "JPGCONV_QUALITY", allow_negative_numbers = true)]
    quality: Option<i64>,

    /// Alias of --quality kept for older clients.
    #[arg(long, env = "JPGCONV_COMPRESSION", allow_negative_numbers = true)]
    compression: Option<i64>,

    /// Print the batch summary as JSON on stdout.
    #[arg(long, env = "JPGCONV_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "JPGCONV_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "JPGCONV_BIND", default_value = "127.0.0.1:8000")]
    bind: SocketAddr,

    /// Root of task storage. Default: a `jpgconv` directory under the system temp dir.
    #[arg(long, env = "JPGCONV_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Seconds a finished task is kept before the sweeper purges it.
    #[arg(long, env = "JPGCONV_RETENTION_SECS", default_value_t = 300)]
    retention_secs: u64,

    /// Seconds between retention sweeps.
    #[arg(long, env = "JPGCONV_SWEEP_INTERVAL_SECS", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_secs: u64,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(Args, Debug)]
struct LimitArgs {
    /// Largest accepted file in MiB.
    #[arg(long, env = "JPGCONV_MAX_FILE_SIZE_MB", default_value_t = 100)]
    max_file_size_mb: usize,

    #[arg(long, env = "JPGCONV_MAX_BATCH_FILES", default_value_t = 50)]
    max_batch_files: usize,

    #[arg(long, env = "JPGCONV_MAX_PDF_PAGES", default_value_t = 100)]
    max_pdf_pages: usize,

    #[arg(long, env = "JPGCONV_MAX_IMAGES_PER_PAGE", default_value_t = 10)]
    max_images_per_page: usize,

    /// Rasterise PDF pages without embedded images.
    #[arg(long, env = "JPGCONV_RENDER_PAGES")]
    render_pages: bool,

    /// Longest edge of a rasterised PDF page.
    #[arg(long, env = "JPGCONV_MAX_RENDERED_PIXELS", default_value_t = 2000)]
    max_rendered_pixels: u32,

    /// Conversions running at once. Default: number of CPUs.
    #[arg(short, long, env = "JPGCONV_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Time budget of a whole batch, in seconds.
    #[arg(long, env = "JPGCONV_BATCH_TIMEOUT_SECS", default_value_t = 300)]
    batch_timeout_secs: u64,

    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar is the user-facing feedback for `convert`; library
    // INFO logs would interleave with it.
    let show_progress = match &cli.command {
        Command::Convert(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::Serve(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Convert(args) => run_convert(args, show_progress, cli.quiet).await,
        Command::Serve(args) => run_serve(args).await,
    }
}

fn build_config(limits: &LimitArgs, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .max_file_size(limits.max_file_size_mb.saturating_mul(1024 * 1024))
        .max_batch_files(limits.max_batch_files)
        .max_pdf_pages(limits.max_pdf_pages)
        .max_images_per_page(limits.max_images_per_page)
        .render_page_fallback(limits.render_pages)
        .max_rendered_pixels(limits.max_rendered_pixels)
        .batch_timeout_secs(limits.batch_timeout_secs);

    if let Some(n) = limits.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(ref p) = limits.pdfium_lib_path {
        builder = builder.pdfium_lib_path(p.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn run_convert(args: ConvertArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&args.limits, progress_cb)?;

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        files.push(UploadedFile::new(name, bytes));
    }

    let mut request = BatchRequest::new(files);
    request.quality = args.quality;
    request.compression = args.compression;

    // Scratch store, removed when this function returns.
    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let store = Arc::new(TaskStore::new(scratch.path()).context("Failed to open task store")?);
    let processor = BatchProcessor::new(config, store.clone());

    let task = processor.process(request).await.context("Conversion failed")?;

    if task.processed_files() > 0 {
        let zip = store
            .read_archive(&task.task_id)
            .await
            .context("Failed to read archive")?;
        write_atomically(&args.output, &zip).await?;
    }

    if args.json {
        let mut summary = task.summary("");
        summary.download_url = args.output.display().to_string();
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !quiet {
        print_summary(&task, &args.output, show_progress);
    }

    store.purge(&task.task_id).await.ok();

    if task.processed_files() == 0 {
        bail!("none of the {} file(s) could be converted", task.results.len());
    }
    Ok(())
}

fn print_summary(task: &Task, output: &Path, show_progress: bool) {
    // With the bar active the per-file lines were already printed.
    if !show_progress {
        for r in &task.results {
            match &r.error {
                None => eprintln!("  {} {}  {} jpg", green("✓"), r.source_filename, r.outputs.len()),
                Some(e) => eprintln!("  {} {}  {}", red("✗"), r.source_filename, red(e)),
            }
        }
    }
    let jpgs: usize = task.results.iter().map(|r| r.outputs.len()).sum();
    if task.processed_files() > 0 {
        eprintln!(
            "{}  {}/{} files  {} jpg  →  {}",
            if task.failed_files() == 0 { green("✔") } else { cyan("⚠") },
            task.processed_files(),
            task.results.len(),
            jpgs,
            bold(&output.display().to_string()),
        );
    }
}

/// Write via a temp file + rename so a failed run never leaves a partial ZIP.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("zip.tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move archive to {}", path.display()))?;
    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = build_config(&args.limits, None)?;
    let root = args
        .store_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("jpgconv"));
    let store = Arc::new(TaskStore::new(&root).context("Failed to open task store")?);
    let processor = BatchProcessor::new(config, store.clone());

    let shutdown = CancellationToken::new();
    let sweeper = server::spawn_retention_sweeper(
        store,
        Duration::from_secs(args.retention_secs),
        Duration::from_secs(args.sweep_interval_secs),
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!(
        "Listening on http://{} (tasks in {}, retention {}s)",
        args.bind,
        root.display(),
        args.retention_secs
    );

    let stop = shutdown.clone();
    axum::serve(listener, server::app(AppState::new(processor)))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = stop.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    sweeper.await.ok();
    info!("Server stopped");
    Ok(())
}
