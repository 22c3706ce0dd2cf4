use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use ghost_studio_core::collaborators::http::{
    HttpClient, HttpGeneration, HttpPartAnalysis, HttpSegmentation, HttpSemanticReviewer,
};
use ghost_studio_core::collaborators::keys::KeySource;
use ghost_studio_core::collaborators::{
    Collaborators, LocalMetrics, PrecomputedMasks, SharedPartAnalysis, SharedSegmentation,
    SharedSemanticReviewer, Unconfigured,
};
use ghost_studio_core::default_app_root;
use ghost_studio_core::facts::validation::validate_facts_files;
use ghost_studio_core::facts::{GarmentFacts, CURRENT_SCHEMA_VERSION};
use ghost_studio_core::features::FeatureExtractor;
use ghost_studio_core::fusion::{MaskFusionEngine, SoftMask};
use ghost_studio_core::imaging::GrayField;
use ghost_studio_core::orchestrator::{ImageJob, Orchestrator};
use ghost_studio_core::planner::PartPlanner;
use ghost_studio_core::routing::{Backend, PriorAttempt, RoutingPolicy};
use ghost_studio_core::runlog::write_mask_png;
use ghost_studio_core::scoring::{QaSignal, QaSignals, QualityScorer};
use ghost_studio_core::settings::{
    load_studio_settings, StudioSettings, StudioSettingsLayerPaths, StudioSettingsOverlay,
};
use ghost_studio_core::worker::run_batch_and_persist;
use image::RgbImage;
use serde::Deserialize;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Flags that keep consuming values until the next `--flag`.
const MULTI_VALUE_FLAGS: [&str; 2] = ["--facts", "--mask"];

fn main() -> CliResult<()> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let Some(command) = cli_args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };
    let args = cli_args.iter().skip(1).cloned().collect::<Vec<_>>();
    if args.iter().any(|arg| matches!(arg.as_str(), "-h" | "--help")) {
        print_usage();
        return Ok(());
    }

    match command {
        "validate-facts" => run_validate_facts_cli(&args),
        "extract-features" => run_extract_features_cli(&args),
        "fuse-masks" => run_fuse_masks_cli(&args),
        "plan-parts" => run_plan_parts_cli(&args),
        "route" => run_route_cli(&args),
        "score" => run_score_cli(&args),
        "process" => run_process_cli(&args),
        "process-batch" => run_process_batch_cli(&args),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        unknown => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SettingsArgs {
    app_root: Option<PathBuf>,
    project_root: Option<PathBuf>,
    app_settings_path: Option<String>,
    project_settings_path: Option<String>,
}

impl SettingsArgs {
    fn app_root(&self) -> PathBuf {
        self.app_root.clone().unwrap_or_else(default_app_root)
    }

    fn load(&self, overrides: &StudioSettingsOverlay) -> CliResult<StudioSettings> {
        let settings = load_studio_settings(
            &self.app_root(),
            self.project_root.as_deref(),
            &StudioSettingsLayerPaths {
                app_settings_path: self.app_settings_path.clone(),
                project_settings_path: self.project_settings_path.clone(),
            },
            overrides,
        )?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliArgs {
    settings: SettingsArgs,
    values: BTreeMap<String, Vec<String>>,
}

impl CliArgs {
    fn one(&self, flag: &str) -> Option<&str> {
        self.values
            .get(flag)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn all(&self, flag: &str) -> &[String] {
        self.values.get(flag).map(Vec::as_slice).unwrap_or(&[])
    }

    fn required(&self, flag: &str) -> CliResult<&str> {
        self.one(flag)
            .ok_or_else(|| std::io::Error::other(format!("Missing required {flag}")).into())
    }

    fn parsed<T>(&self, flag: &str) -> CliResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.one(flag) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|error| {
                std::io::Error::other(format!("Invalid value for {flag}: {raw} ({error})")).into()
            }),
        }
    }

    fn required_parsed<T>(&self, flag: &str) -> CliResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parsed(flag)?
            .ok_or_else(|| std::io::Error::other(format!("Missing required {flag}")).into())
    }
}

fn parse_cli_args(args: &[String], accepted: &[&str]) -> CliResult<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => parsed.settings.app_root = Some(PathBuf::from(needs_value(i)?)),
            "--project-root" => parsed.settings.project_root = Some(PathBuf::from(needs_value(i)?)),
            "--app-settings" => parsed.settings.app_settings_path = Some(needs_value(i)?),
            "--project-settings" => parsed.settings.project_settings_path = Some(needs_value(i)?),
            known if accepted.contains(&known) => {
                let values = parsed.values.entry(known.to_string()).or_default();
                values.push(needs_value(i)?);
                if MULTI_VALUE_FLAGS.contains(&known) {
                    while let Some(next) = args.get(i + 2).filter(|a| !a.starts_with("--")) {
                        values.push(next.clone());
                        i += 1;
                    }
                }
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
        i += 2;
    }
    Ok(parsed)
}

fn print_json(value: &impl serde::Serialize) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_rgb(path: &str) -> CliResult<RgbImage> {
    let image = image::open(path)
        .map_err(|error| std::io::Error::other(format!("failed to open image '{path}': {error}")))?;
    Ok(image.to_rgb8())
}

fn open_mask(path: &str) -> CliResult<GrayField> {
    let image = image::open(path)
        .map_err(|error| std::io::Error::other(format!("failed to open mask '{path}': {error}")))?;
    Ok(GrayField::from_luma8(&image.to_luma8()))
}

/// `source=path` pairs; a bare path takes its file stem as the source tag.
fn parse_mask_specs(specs: &[String]) -> CliResult<Vec<SoftMask>> {
    specs
        .iter()
        .map(|spec| -> CliResult<SoftMask> {
            let (source, path) = match spec.split_once('=') {
                Some((source, path)) => (source.trim().to_string(), path.trim()),
                None => (
                    Path::new(spec)
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                        .unwrap_or_else(|| spec.clone()),
                    spec.as_str(),
                ),
            };
            Ok(SoftMask::new(source, open_mask(path)?))
        })
        .collect()
}

fn run_validate_facts_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(args, &["--facts", "--schema-version"])?;
    let paths = parsed.all("--facts").iter().map(PathBuf::from).collect::<Vec<_>>();
    if paths.is_empty() {
        return Err(std::io::Error::other("Missing required --facts").into());
    }
    let version = parsed.one("--schema-version").unwrap_or(CURRENT_SCHEMA_VERSION);
    print_json(&validate_facts_files(&paths, version))
}

fn run_extract_features_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(args, &["--image", "--max-colors", "--seed"])?;
    let settings = parsed.settings.load(&StudioSettingsOverlay {
        max_colors: parsed.parsed("--max-colors")?,
        clustering_seed: parsed.parsed("--seed")?,
        ..StudioSettingsOverlay::default()
    })?;
    let image = open_rgb(parsed.required("--image")?)?;
    let features = FeatureExtractor::new(settings.features).extract(&image)?;
    print_json(&features)
}

fn run_fuse_masks_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(args, &["--image", "--mask", "--subtract", "--out"])?;
    let settings = parsed.settings.load(&StudioSettingsOverlay::default())?;
    let image = open_rgb(parsed.required("--image")?)?;
    let masks = parse_mask_specs(parsed.all("--mask"))?;
    let subtract = parsed
        .one("--subtract")
        .map(|path| open_mask(path).map(|field| SoftMask::new("human-subtract", field)))
        .transpose()?;

    let fused = MaskFusionEngine::new(settings.fusion).fuse(
        &GrayField::luminance_of(&image),
        &masks,
        subtract.as_ref(),
        &settings.mask_weights,
    )?;
    if let Some(out) = parsed.one("--out") {
        write_mask_png(Path::new(out), &fused.soft.to_luma8())?;
    }
    print_json(&json!({
        "quality": fused.quality,
        "coverage": fused.hard.coverage(0.5),
        "bounding_box": fused.hard.bounding_box(0.5),
        "mask_path": parsed.one("--out"),
    }))
}

fn run_plan_parts_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(args, &["--facts", "--image"])?;
    let settings = parsed.settings.load(&StudioSettingsOverlay::default())?;
    let facts = GarmentFacts::load(Path::new(parsed.required("--facts")?))?;
    let image = open_rgb(parsed.required("--image")?)?;
    let features = FeatureExtractor::new(settings.features).extract(&image)?;
    let parts = PartPlanner::new(settings.planner).plan(&facts, &features);
    print_json(&json!({ "parts": parts, "features": features }))
}

fn run_route_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(
        args,
        &["--facts", "--attempt", "--prior-backend", "--prior-failed"],
    )?;
    let settings = parsed.settings.load(&StudioSettingsOverlay::default())?;
    let facts = GarmentFacts::load(Path::new(parsed.required("--facts")?))?;
    let attempt = parsed.parsed::<u32>("--attempt")?.unwrap_or(1).max(1);
    let policy = RoutingPolicy::new(settings.routing);

    let prior = if attempt > 1 {
        let mut decision = policy.route(&facts, attempt - 1, None);
        if let Some(raw) = parsed.one("--prior-backend") {
            decision.backend = Backend::parse(raw).ok_or_else(|| {
                std::io::Error::other(format!("Invalid value for --prior-backend: {raw}"))
            })?;
        }
        let failed_signals = parse_signal_list(parsed.one("--prior-failed").unwrap_or(""))?;
        Some(PriorAttempt {
            decision,
            failed_signals,
        })
    } else {
        None
    };
    print_json(&policy.route(&facts, attempt, prior.as_ref()))
}

fn parse_signal_list(raw: &str) -> CliResult<Vec<QaSignal>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| -> CliResult<QaSignal> {
            QaSignal::parse(item).ok_or_else(|| {
                std::io::Error::other(format!("Unknown QA signal: {item}")).into()
            })
        })
        .collect()
}

fn run_score_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(
        args,
        &[
            "--edge",
            "--background",
            "--color-delta-e",
            "--semantic",
            "--facts",
            "--attempt",
        ],
    )?;
    let settings = parsed.settings.load(&StudioSettingsOverlay::default())?;
    let facts = GarmentFacts::load(Path::new(parsed.required("--facts")?))?;
    let scorer = QualityScorer::new(settings.qa);
    let signals = QaSignals {
        edge_gate: parsed.required_parsed("--edge")?,
        background_gate: parsed.required_parsed("--background")?,
        color_fidelity: scorer.color_fidelity(parsed.required_parsed("--color-delta-e")?, &facts)?,
        semantic_alignment: parsed.required_parsed("--semantic")?,
    };
    let attempt = parsed.parsed::<u32>("--attempt")?.unwrap_or(1);
    print_json(&scorer.score(&signals, attempt, &facts)?)
}

/// Builds the HTTP-backed collaborators. Must run outside the async runtime:
/// blocking clients may not be created or dropped inside it.
fn build_collaborators(
    settings: &StudioSettings,
    app_root: &Path,
    masks: Vec<SoftMask>,
) -> CliResult<Collaborators> {
    let endpoints = &settings.endpoints;
    let keys = KeySource::load(app_root).unwrap_or_else(|error| {
        warn!(
            app_root = %app_root.display(),
            error = %error,
            "key file unreadable, using process environment only"
        );
        KeySource::default()
    });
    let http = HttpClient::new(
        endpoints,
        &keys,
        settings.orchestrator.collaborator_timeout_secs,
    )?;

    let remote_segmentation = match endpoints.segmentation.as_deref() {
        Some(_) => Some(Arc::new(HttpSegmentation::new(http.clone(), endpoints)?) as SharedSegmentation),
        None => None,
    };
    let segmentation: SharedSegmentation = if masks.is_empty() {
        match remote_segmentation {
            Some(remote) => remote,
            None => {
                return Err(std::io::Error::other(
                    "No garment masks: pass --mask or configure collaborators.segmentation_endpoint",
                )
                .into())
            }
        }
    } else {
        Arc::new(PrecomputedMasks::new(masks, remote_segmentation))
    };
    let part_analysis: SharedPartAnalysis = match endpoints.part_analysis.as_deref() {
        Some(_) => Arc::new(HttpPartAnalysis::new(http.clone(), endpoints)?),
        None => Arc::new(Unconfigured("part_analysis")),
    };
    let semantic = match endpoints.semantic_review.as_deref() {
        Some(_) => Some(Arc::new(HttpSemanticReviewer::new(http.clone(), endpoints)?) as SharedSemanticReviewer),
        None => None,
    };

    Ok(Collaborators {
        segmentation,
        part_analysis,
        generation: Arc::new(HttpGeneration::new(http, endpoints)?),
        semantic,
        metrics: Arc::new(LocalMetrics::default()),
    })
}

fn build_runtime() -> CliResult<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn image_id_for(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn run_process_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(
        args,
        &["--facts", "--image", "--mask", "--output", "--image-id", "--prompt-extra"],
    )?;
    let settings = parsed.settings.load(&StudioSettingsOverlay {
        output_dir: parsed.one("--output").map(str::to_string),
        ..StudioSettingsOverlay::default()
    })?;
    let facts = GarmentFacts::load(Path::new(parsed.required("--facts")?))?;
    let image_path = parsed.required("--image")?;
    let mut job = ImageJob::new(
        parsed
            .one("--image-id")
            .map(str::to_string)
            .unwrap_or_else(|| image_id_for(image_path)),
        open_rgb(image_path)?,
        facts,
    );
    job.custom_additions = parsed.one("--prompt-extra").map(str::to_string);

    let collaborators = build_collaborators(
        &settings,
        &parsed.settings.app_root(),
        parse_mask_specs(parsed.all("--mask"))?,
    )?;
    let orchestrator = Orchestrator::new(&settings, collaborators);
    let runtime = build_runtime()?;
    let report = runtime.block_on(orchestrator.process_image(job));
    drop(runtime);
    print_json(&report)
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    image: String,
    facts: String,
    #[serde(default)]
    image_id: Option<String>,
}

fn run_process_batch_cli(args: &[String]) -> CliResult<()> {
    let parsed = parse_cli_args(args, &["--jobs", "--output", "--concurrency"])?;
    let settings = parsed.settings.load(&StudioSettingsOverlay {
        output_dir: parsed.one("--output").map(str::to_string),
        concurrency: parsed.parsed("--concurrency")?,
        ..StudioSettingsOverlay::default()
    })?;
    let jobs_path = parsed.required("--jobs")?;
    let raw = std::fs::read_to_string(jobs_path)
        .map_err(|error| std::io::Error::other(format!("failed to read '{jobs_path}': {error}")))?;
    let entries = serde_json::from_str::<Vec<BatchEntry>>(&raw)?;

    let mut jobs = Vec::with_capacity(entries.len());
    for entry in entries {
        let facts = GarmentFacts::load(Path::new(&entry.facts))?;
        let image_id = entry
            .image_id
            .unwrap_or_else(|| image_id_for(entry.image.as_str()));
        jobs.push(ImageJob::new(image_id, open_rgb(&entry.image)?, facts));
    }

    let collaborators = build_collaborators(&settings, &parsed.settings.app_root(), Vec::new())?;
    let orchestrator = Arc::new(Orchestrator::new(&settings, collaborators));
    let runtime = build_runtime()?;
    let (report, path) = runtime.block_on(run_batch_and_persist(Arc::clone(&orchestrator), jobs))?;
    drop(runtime);
    print_json(&json!({ "batch": report, "report_path": path.display().to_string() }))
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  ghost-studio-core validate-facts --facts <file>... [--schema-version 3.2]\n",
        "  ghost-studio-core extract-features --image <file> [--max-colors N] [--seed N]\n",
        "  ghost-studio-core fuse-masks --image <file> --mask <source>=<file>... [--subtract <file>] [--out <png>]\n",
        "  ghost-studio-core plan-parts --facts <file> --image <file>\n",
        "  ghost-studio-core route --facts <file> [--attempt N] [--prior-backend primary|secondary] [--prior-failed semantic,color]\n",
        "  ghost-studio-core score --edge F --background F --color-delta-e F --semantic F --facts <file> [--attempt N]\n",
        "  ghost-studio-core process --facts <file> --image <file> [--mask <source>=<file>...] [--output <dir>] [--image-id ID] [--prompt-extra TEXT]\n",
        "  ghost-studio-core process-batch --jobs <jobs.json> [--output <dir>] [--concurrency N]\n\n",
        "Common flags:\n",
        "  --app-root PATH (default: crate directory), --project-root PATH,\n",
        "  --app-settings PATH, --project-settings PATH\n",
        "  app settings default: config/studio.settings.toml (fallback: config/studio.settings.json)\n",
        "  project settings default: <project_root>/.ghost-studio/studio.settings.json\n"
    ));
}
