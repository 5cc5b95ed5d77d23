use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use waifu2x_core::compositor::TileProgress;
use waifu2x_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use waifu2x_core::error::classify;
use waifu2x_core::image_io::{decode, is_supported_image, save_png};
use waifu2x_core::inference::Pass;
use waifu2x_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use waifu2x_core::model::registry::warn_missing;
use waifu2x_core::model::store::StoreConfig;
use waifu2x_core::model::{InferenceBackend, ModelRegistry, ModelStore};
use waifu2x_core::{UpscaleOptions, Upscaler};

const DEFAULT_INPUT_DIR: &str = "input";
const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Parser, Debug)]
#[command(
    name = "waifu2x",
    about = "Denoise and upscale images with waifu2x models"
)]
struct Cli {
    #[arg(help = "Image file or directory to process", default_value = DEFAULT_INPUT_DIR)]
    input: PathBuf,

    #[arg(help = "Output file (for a file input) or directory")]
    output: Option<PathBuf>,

    #[arg(long, help = "Final size relative to the input (overrides SCALE and config)")]
    scale: Option<f64>,

    #[arg(long = "tile-size")]
    tile_size: Option<usize>,

    #[arg(long)]
    margin: Option<usize>,

    #[arg(long = "denoise-model", value_name = "NAME_OR_PATH")]
    denoise_model: Option<String>,

    #[arg(long = "upscale-model", value_name = "NAME_OR_PATH")]
    upscale_model: Option<String>,

    #[arg(long, help = "ONNX execution provider: cpu, cuda, or tensorrt")]
    backend: Option<String>,

    #[arg(long, help = "Final resample filter: bilinear or nearest")]
    filter: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long, help = "Do not draw the progress bar")]
    quiet: bool,
}

/// One input image and where its PNG goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub fn run_from_env() -> Result<BatchSummary> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    waifu2x_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    waifu2x_core::runtime::log_runtime_lib_status();

    initialize_data_dir(&resolved_data_dir)?;
    let cfg_path = config_path(&resolved_data_dir);
    let mut config = AppConfig::load_from_path(&cfg_path)?;
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    apply_overrides(&mut config, &cli);
    let options = config.upscale_options(cli.scale)?;
    let mut store = build_store(&config, &resolved_data_dir)?;
    let jobs = plan_jobs(&cli.input, cli.output.as_deref())?;

    run_batch(&jobs, &mut store, options, cli.quiet)
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(tile_size) = cli.tile_size {
        config.tiling.tile_size = tile_size;
    }
    if let Some(margin) = cli.margin {
        config.tiling.margin = margin;
    }
    if let Some(model) = &cli.denoise_model {
        config.models.denoise = model.clone();
    }
    if let Some(model) = &cli.upscale_model {
        config.models.upscale = model.clone();
    }
    if let Some(backend) = &cli.backend {
        config.models.backend = backend.clone();
    }
    if let Some(filter) = &cli.filter {
        config.output.filter = filter.clone();
    }
}

fn build_store(config: &AppConfig, data_dir: &Path) -> Result<ModelStore> {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let mut registry = ModelRegistry::with_builtin_models(models_dir);
    registry.discover()?;
    warn_missing(
        &registry,
        &[config.models.denoise.as_str(), config.models.upscale.as_str()],
    );

    Ok(ModelStore::new(StoreConfig {
        denoise: registry.resolve(&config.models.denoise, Pass::Denoise)?,
        upscale: registry.resolve(&config.models.upscale, Pass::Upscale)?,
        backend: InferenceBackend::from_str_lossy(&config.models.backend),
        onnx_planes: config.models.onnx_planes,
        trt_cache_dir: Some(resolve_relative_to(data_dir, &config.paths.trt_cache_dir)),
    }))
}

/// Map the input to jobs. A file goes to `output` (default
/// `output/<stem>.png`); a directory is walked recursively and mirrored
/// under `output` with `.png` extensions.
pub fn plan_jobs(input: &Path, output: Option<&Path>) -> Result<Vec<Job>> {
    if input.is_file() {
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => {
                let stem = input
                    .file_stem()
                    .with_context(|| format!("input has no file name: {}", input.display()))?;
                Path::new(DEFAULT_OUTPUT_DIR).join(stem).with_extension("png")
            }
        };
        return Ok(vec![Job {
            input: input.to_path_buf(),
            output,
        }]);
    }

    if !input.is_dir() {
        bail!("input not found: {}", input.display());
    }

    let output_root = output.unwrap_or_else(|| Path::new(DEFAULT_OUTPUT_DIR));
    let mut files = Vec::new();
    walk_files(input, &mut files)?;
    files.sort();

    let mut jobs = Vec::with_capacity(files.len());
    for file in files {
        if !is_supported_image(&file) {
            warn!(path = %file.display(), "Skipping file with unsupported extension");
            continue;
        }
        let relative = file
            .strip_prefix(input)
            .with_context(|| format!("{} is outside {}", file.display(), input.display()))?;
        jobs.push(Job {
            output: output_root.join(relative).with_extension("png"),
            input: file,
        });
    }
    Ok(jobs)
}

fn walk_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

/// Process every job in order. Decode and inference failures are counted
/// and the batch moves on; configuration errors stop it.
pub fn run_batch(
    jobs: &[Job],
    store: &mut ModelStore,
    options: UpscaleOptions,
    quiet: bool,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();
    let started = Instant::now();

    for job in jobs {
        eprintln!("{}", job.input.display());
        match process_job(job, store, options, quiet) {
            Ok(()) => {
                summary.succeeded += 1;
                info!(input = %job.input.display(), output = %job.output.display(), "Saved");
            }
            Err(e) => {
                if classify(&e).is_some_and(|kind| kind.is_fatal_for_batch()) {
                    return Err(e.context(format!("aborting batch at {}", job.input.display())));
                }
                summary.failed += 1;
                error!(input = %job.input.display(), "{e:#}");
            }
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Batch finished"
    );
    Ok(summary)
}

fn process_job(job: &Job, store: &mut ModelStore, options: UpscaleOptions, quiet: bool) -> Result<()> {
    let image = decode(&job.input)?;

    let (tx, rx) = mpsc::channel();
    let renderer = (!quiet).then(|| spawn_progress_renderer(rx));

    let result = Upscaler::new(store, options).and_then(|upscaler| {
        let mut upscaler = upscaler.with_events(tx);
        upscaler.upscale(&image)
    });

    // The upscaler owned the only sender, so the renderer sees the channel close.
    if let Some(handle) = renderer {
        let _ = handle.join();
    }

    let upscaled = result?;
    save_png(&upscaled, &job.output)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn spawn_progress_renderer(rx: Receiver<TileProgress>) -> JoinHandle<()> {
    thread::spawn(move || {
        let started = Instant::now();
        let mut drew = false;
        for event in rx {
            eprint!(
                "\r{}",
                render_progress_line(
                    f64::from(event.progress),
                    event.tile_index + 1,
                    event.tile_count,
                    started.elapsed().as_secs_f64(),
                )
            );
            let _ = std::io::stderr().flush();
            drew = true;
        }
        if drew {
            eprintln!();
        }
    })
}

fn render_progress_line(fraction: f64, done: usize, total: usize, elapsed: f64) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    format!(
        "[{}] {:5.1}% | Tile {}/{} | Elapsed: {}    ",
        bar,
        fraction * 100.0,
        done,
        total,
        format_duration(elapsed)
    )
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use waifu2x_core::inference::{IdentityEngine, InferenceAdapter};
    use waifu2x_core::model::{ModelFormat, ModelSource};
    use waifu2x_core::UpscaleError;

    fn write_png(path: &Path, width: u32, height: u32) {
        use waifu2x_core::UpscaledImage;
        let image = UpscaledImage {
            width,
            height,
            rgba: vec![90; (width * height * 4) as usize],
            has_alpha: true,
        };
        save_png(&image, path).unwrap();
    }

    fn identity_store() -> ModelStore {
        ModelStore::preloaded(
            InferenceAdapter::new(
                Box::new(IdentityEngine::new(1)),
                Box::new(IdentityEngine::new(3)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(59.4), "00:00:59");
        assert_eq!(format_duration(3725.0), "01:02:05");
    }

    #[test]
    fn progress_line_is_clamped() {
        let line = render_progress_line(1.5, 4, 4, 1.0);
        assert!(line.contains("100.0%"));
        assert!(line.contains("Tile 4/4"));
        assert!(!line.contains('░'));
    }

    #[test]
    fn progress_line_follows_row_fraction_not_tile_count() {
        // Last tile of the first row in a 2x2 grid: 2 of 4 tiles, row progress 0.
        let line = render_progress_line(0.0, 2, 4, 0.0);
        assert!(line.contains("  0.0%"));
        assert!(line.contains("Tile 2/4"));
        assert!(!line.contains('█'));
    }

    #[test]
    fn single_file_defaults_to_output_dir() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("cat.jpg");
        fs::write(&input, b"x").unwrap();

        let jobs = plan_jobs(&input, None).unwrap();
        assert_eq!(
            jobs,
            vec![Job {
                input: input.clone(),
                output: PathBuf::from("output/cat.png"),
            }]
        );

        let explicit = temp.path().join("big.png");
        let jobs = plan_jobs(&input, Some(&explicit)).unwrap();
        assert_eq!(jobs[0].output, explicit);
    }

    #[test]
    fn directory_is_mirrored_with_png_extensions() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("in");
        fs::create_dir_all(input.join("nested/deeper")).unwrap();
        fs::write(input.join("a.jpg"), b"x").unwrap();
        fs::write(input.join("nested/b.webp"), b"x").unwrap();
        fs::write(input.join("nested/deeper/c.png"), b"x").unwrap();
        fs::write(input.join("notes.txt"), b"x").unwrap();

        let out = temp.path().join("out");
        let jobs = plan_jobs(&input, Some(&out)).unwrap();
        let outputs: Vec<PathBuf> = jobs.iter().map(|j| j.output.clone()).collect();
        assert_eq!(
            outputs,
            vec![
                out.join("a.png"),
                out.join("nested/b.png"),
                out.join("nested/deeper/c.png"),
            ]
        );
    }

    #[test]
    fn missing_input_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = plan_jobs(&temp.path().join("nope"), None).unwrap_err();
        assert!(err.to_string().contains("input not found"));
    }

    #[test]
    fn batch_continues_past_undecodable_images() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("in");
        fs::create_dir_all(&input).unwrap();
        write_png(&input.join("good.png"), 5, 5);
        fs::write(input.join("broken.png"), b"not a png").unwrap();

        let out = temp.path().join("out");
        let jobs = plan_jobs(&input, Some(&out)).unwrap();
        let mut store = identity_store();
        let summary = run_batch(&jobs, &mut store, UpscaleOptions::default(), true).unwrap();

        assert_eq!(summary, BatchSummary { succeeded: 1, failed: 1 });
        assert!(out.join("good.png").is_file());
        assert!(!out.join("broken.png").exists());

        let written = waifu2x_core::image_io::decode(&out.join("good.png")).unwrap();
        assert_eq!((written.width(), written.height()), (8, 8));
    }

    #[test]
    fn empty_output_fails_only_that_image() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("in");
        fs::create_dir_all(&input).unwrap();
        write_png(&input.join("a_tiny.png"), 1, 1);
        write_png(&input.join("b_big.png"), 10, 10);

        let out = temp.path().join("out");
        let jobs = plan_jobs(&input, Some(&out)).unwrap();
        let mut store = identity_store();
        let options = UpscaleOptions {
            final_scale: 0.5,
            ..Default::default()
        };
        let summary = run_batch(&jobs, &mut store, options, true).unwrap();

        assert_eq!(summary, BatchSummary { succeeded: 1, failed: 1 });
        assert!(!out.join("a_tiny.png").exists());
        let written = waifu2x_core::image_io::decode(&out.join("b_big.png")).unwrap();
        assert_eq!((written.width(), written.height()), (5, 5));
    }

    #[test]
    fn configuration_errors_abort_the_batch() {
        let temp = tempfile::tempdir().unwrap();
        let model = temp.path().join("two_planes.json");
        fs::write(
            &model,
            r#"[{"nInputPlane": 2, "nOutputPlane": 2, "kW": 1, "kH": 1,
                "weight": [[[[1.0]], [[0.0]]], [[[0.0]], [[1.0]]]], "bias": [0.0, 0.0]}]"#,
        )
        .unwrap();
        let source = ModelSource {
            name: "two_planes".to_string(),
            path: model,
            format: ModelFormat::Json,
            input_planes: None,
            sha256: None,
        };
        let mut store = ModelStore::new(StoreConfig {
            denoise: source.clone(),
            upscale: source,
            backend: InferenceBackend::Cpu,
            onnx_planes: 3,
            trt_cache_dir: None,
        });

        let input = temp.path().join("one.png");
        write_png(&input, 4, 4);
        let jobs = vec![
            Job {
                input: input.clone(),
                output: temp.path().join("a.png"),
            },
            Job {
                input,
                output: temp.path().join("b.png"),
            },
        ];
        let err = run_batch(&jobs, &mut store, UpscaleOptions::default(), true).unwrap_err();
        assert!(format!("{err:#}").contains("aborting batch"));
        assert!(matches!(classify(&err), Some(UpscaleError::Config(_))));
        assert!(!temp.path().join("a.png").exists());
        assert!(!temp.path().join("b.png").exists());
    }

    #[test]
    fn upscale_model_in_denoise_slot_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.models.denoise = "art/scale2x".to_string();
        let err = build_store(&config, temp.path()).err().unwrap();
        assert!(matches!(classify(&err), Some(UpscaleError::Config(_))));

        assert!(build_store(&AppConfig::default(), temp.path()).is_ok());
    }

    #[test]
    fn cli_overrides_win_over_config() {
        let cli = Cli::parse_from([
            "waifu2x",
            "pics",
            "--tile-size",
            "32",
            "--margin",
            "4",
            "--denoise-model",
            "art/noise1",
            "--backend",
            "cuda",
            "--filter",
            "nearest",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.tiling.tile_size, 32);
        assert_eq!(config.tiling.margin, 4);
        assert_eq!(config.models.denoise, "art/noise1");
        assert_eq!(config.models.upscale, "art/scale2x");
        assert_eq!(config.models.backend, "cuda");
        assert_eq!(config.output.filter, "nearest");
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["waifu2x"]);
        assert_eq!(cli.input, PathBuf::from("input"));
        assert!(cli.output.is_none());
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
    }
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = "ort=error";

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(NOISE, Some("info"), 2, None);
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(NOISE, Some("warn"), 2, Some("waifu2x_core=trace"));
        assert_eq!(selected, "waifu2x_core=trace");
    }
}
