//! Layered studio settings: app TOML (or JSON) -> project JSON -> CLI
//! overrides, resolved into the concrete component configs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::collaborators::http::HttpEndpoints;
use crate::features::FeatureConfig;
use crate::fusion::FusionParams;
use crate::orchestrator::OrchestratorConfig;
use crate::planner::PlannerConfig;
use crate::routing::RoutingConfig;
use crate::scoring::QaConfig;

pub const APP_SETTINGS_TOML: &str = "config/studio.settings.toml";
pub const APP_SETTINGS_JSON: &str = "config/studio.settings.json";
pub const PROJECT_SETTINGS_DIR: &str = ".ghost-studio";
pub const PROJECT_SETTINGS_FILE: &str = "studio.settings.json";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StudioSettingsOverlay {
    pub max_colors: Option<usize>,
    pub clustering_seed: Option<u64>,
    pub kmeans_iterations: Option<usize>,
    pub frequency_cutoff: Option<f32>,
    pub pattern_threshold: Option<f32>,
    pub detect_text: Option<bool>,

    pub fusion_cutoff: Option<f32>,
    pub fusion_delta: Option<f32>,
    pub blur_sigma: Option<f32>,
    pub dilation_radius: Option<u8>,
    pub feather_sigma: Option<f32>,
    pub edge_tolerance_px: Option<u8>,
    pub mask_weights: Option<BTreeMap<String, f32>>,

    pub high_complexity_threshold: Option<f64>,
    pub high_transparency_threshold: Option<f64>,

    pub risk_threshold: Option<f64>,
    pub conditioning_threshold: Option<f64>,
    pub conditioning_weight_min: Option<f64>,
    pub conditioning_weight_max: Option<f64>,

    pub pass_threshold: Option<f64>,
    pub max_retries: Option<u32>,
    pub solid_delta_e_ceiling: Option<f64>,
    pub textured_delta_e_ceiling: Option<f64>,
    pub edge_floor: Option<f64>,
    pub background_floor: Option<f64>,
    pub color_floor: Option<f64>,
    pub semantic_floor: Option<f64>,

    pub concurrency: Option<usize>,
    pub image_timeout_secs: Option<u64>,
    pub collaborator_timeout_secs: Option<u64>,
    pub min_parts_detected: Option<usize>,
    pub output_dir: Option<String>,

    pub segmentation_endpoint: Option<String>,
    pub part_analysis_endpoint: Option<String>,
    pub generation_primary_endpoint: Option<String>,
    pub generation_secondary_endpoint: Option<String>,
    pub semantic_review_endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub part_analysis_model: Option<String>,
    pub semantic_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StudioSettingsLayerPaths {
    pub app_settings_path: Option<String>,
    pub project_settings_path: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StudioSettings {
    pub features: FeatureConfig,
    pub fusion: FusionParams,
    pub mask_weights: BTreeMap<String, f32>,
    pub planner: PlannerConfig,
    pub routing: RoutingConfig,
    pub qa: QaConfig,
    pub orchestrator: OrchestratorConfig,
    pub endpoints: HttpEndpoints,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read studio settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse studio settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse studio settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("studio settings root must be a JSON object")]
    RootMustBeObject,
    #[error("studio settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("studio settings field '{field}' is invalid: {message}")]
    InvalidValue { field: String, message: String },
}

pub fn load_app_studio_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<StudioSettingsOverlay, SettingsError> {
    if let Some(path) = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
    {
        return load_optional_overlay_by_extension(path.as_path());
    }

    let toml_path = app_root.join(APP_SETTINGS_TOML);
    if toml_path.exists() {
        return load_optional_overlay_from_toml_path(toml_path.as_path());
    }
    load_optional_overlay_from_json_path(app_root.join(APP_SETTINGS_JSON).as_path())
}

pub fn load_project_studio_settings(
    project_root: Option<&Path>,
    explicit_path: Option<&str>,
) -> Result<StudioSettingsOverlay, SettingsError> {
    let Some(path) = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| {
            if p.is_absolute() {
                p
            } else if let Some(root) = project_root {
                root.join(p)
            } else {
                p
            }
        })
        .or_else(|| {
            project_root.map(|root| root.join(PROJECT_SETTINGS_DIR).join(PROJECT_SETTINGS_FILE))
        })
    else {
        return Ok(StudioSettingsOverlay::default());
    };
    load_optional_overlay_from_json_path(path.as_path())
}

/// Loads both layers and resolves them against the CLI overrides.
pub fn load_studio_settings(
    app_root: &Path,
    project_root: Option<&Path>,
    paths: &StudioSettingsLayerPaths,
    overrides: &StudioSettingsOverlay,
) -> Result<StudioSettings, SettingsError> {
    let app = load_app_studio_settings(app_root, paths.app_settings_path.as_deref())?;
    let project = load_project_studio_settings(project_root, paths.project_settings_path.as_deref())?;
    resolve_studio_settings(&merge_studio_settings_overlays(&app, &project, overrides))
}

pub fn merge_studio_settings_overlays(
    app: &StudioSettingsOverlay,
    project: &StudioSettingsOverlay,
    overrides: &StudioSettingsOverlay,
) -> StudioSettingsOverlay {
    let layers = [overrides, project, app];
    StudioSettingsOverlay {
        max_colors: pick(layers.map(|l| l.max_colors)),
        clustering_seed: pick(layers.map(|l| l.clustering_seed)),
        kmeans_iterations: pick(layers.map(|l| l.kmeans_iterations)),
        frequency_cutoff: pick(layers.map(|l| l.frequency_cutoff)),
        pattern_threshold: pick(layers.map(|l| l.pattern_threshold)),
        detect_text: pick(layers.map(|l| l.detect_text)),
        fusion_cutoff: pick(layers.map(|l| l.fusion_cutoff)),
        fusion_delta: pick(layers.map(|l| l.fusion_delta)),
        blur_sigma: pick(layers.map(|l| l.blur_sigma)),
        dilation_radius: pick(layers.map(|l| l.dilation_radius)),
        feather_sigma: pick(layers.map(|l| l.feather_sigma)),
        edge_tolerance_px: pick(layers.map(|l| l.edge_tolerance_px)),
        mask_weights: overrides
            .mask_weights
            .clone()
            .or_else(|| project.mask_weights.clone())
            .or_else(|| app.mask_weights.clone()),
        high_complexity_threshold: pick(layers.map(|l| l.high_complexity_threshold)),
        high_transparency_threshold: pick(layers.map(|l| l.high_transparency_threshold)),
        risk_threshold: pick(layers.map(|l| l.risk_threshold)),
        conditioning_threshold: pick(layers.map(|l| l.conditioning_threshold)),
        conditioning_weight_min: pick(layers.map(|l| l.conditioning_weight_min)),
        conditioning_weight_max: pick(layers.map(|l| l.conditioning_weight_max)),
        pass_threshold: pick(layers.map(|l| l.pass_threshold)),
        max_retries: pick(layers.map(|l| l.max_retries)),
        solid_delta_e_ceiling: pick(layers.map(|l| l.solid_delta_e_ceiling)),
        textured_delta_e_ceiling: pick(layers.map(|l| l.textured_delta_e_ceiling)),
        edge_floor: pick(layers.map(|l| l.edge_floor)),
        background_floor: pick(layers.map(|l| l.background_floor)),
        color_floor: pick(layers.map(|l| l.color_floor)),
        semantic_floor: pick(layers.map(|l| l.semantic_floor)),
        concurrency: pick(layers.map(|l| l.concurrency)),
        image_timeout_secs: pick(layers.map(|l| l.image_timeout_secs)),
        collaborator_timeout_secs: pick(layers.map(|l| l.collaborator_timeout_secs)),
        min_parts_detected: pick(layers.map(|l| l.min_parts_detected)),
        output_dir: choose_string(layers.map(|l| l.output_dir.as_deref())),
        segmentation_endpoint: choose_string(layers.map(|l| l.segmentation_endpoint.as_deref())),
        part_analysis_endpoint: choose_string(layers.map(|l| l.part_analysis_endpoint.as_deref())),
        generation_primary_endpoint: choose_string(
            layers.map(|l| l.generation_primary_endpoint.as_deref()),
        ),
        generation_secondary_endpoint: choose_string(
            layers.map(|l| l.generation_secondary_endpoint.as_deref()),
        ),
        semantic_review_endpoint: choose_string(
            layers.map(|l| l.semantic_review_endpoint.as_deref()),
        ),
        api_key_env: choose_string(layers.map(|l| l.api_key_env.as_deref())),
        part_analysis_model: choose_string(layers.map(|l| l.part_analysis_model.as_deref())),
        semantic_model: choose_string(layers.map(|l| l.semantic_model.as_deref())),
    }
}

pub fn resolve_studio_settings(
    overlay: &StudioSettingsOverlay,
) -> Result<StudioSettings, SettingsError> {
    let feature_defaults = FeatureConfig::default();
    let features = FeatureConfig {
        max_colors: overlay.max_colors.unwrap_or(feature_defaults.max_colors),
        clustering_seed: overlay.clustering_seed.unwrap_or(feature_defaults.clustering_seed),
        kmeans_iterations: overlay
            .kmeans_iterations
            .unwrap_or(feature_defaults.kmeans_iterations),
        frequency_cutoff: overlay
            .frequency_cutoff
            .unwrap_or(feature_defaults.frequency_cutoff),
        pattern_threshold: overlay
            .pattern_threshold
            .unwrap_or(feature_defaults.pattern_threshold),
        detect_text: overlay.detect_text.unwrap_or(feature_defaults.detect_text),
        ..feature_defaults
    };
    if features.max_colors == 0 {
        return Err(invalid("features.max_colors", "must be at least 1"));
    }
    ensure_unit_f32("features.frequency_cutoff", features.frequency_cutoff)?;
    ensure_unit_f32("features.pattern_threshold", features.pattern_threshold)?;

    let fusion_defaults = FusionParams::default();
    let fusion = FusionParams {
        cutoff: overlay.fusion_cutoff.unwrap_or(fusion_defaults.cutoff),
        delta: overlay.fusion_delta.unwrap_or(fusion_defaults.delta),
        blur_sigma: overlay.blur_sigma.unwrap_or(fusion_defaults.blur_sigma),
        dilation_radius: overlay.dilation_radius.unwrap_or(fusion_defaults.dilation_radius),
        feather_sigma: overlay.feather_sigma.unwrap_or(fusion_defaults.feather_sigma),
        edge_tolerance_px: overlay
            .edge_tolerance_px
            .unwrap_or(fusion_defaults.edge_tolerance_px),
        ..fusion_defaults
    };
    ensure_unit_f32("fusion.cutoff", fusion.cutoff)?;
    ensure_unit_f32("fusion.delta", fusion.delta)?;
    let mask_weights = overlay.mask_weights.clone().unwrap_or_default();
    for (source, weight) in &mask_weights {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(invalid(
                format!("fusion.weights.{source}").as_str(),
                "must be a finite non-negative number",
            ));
        }
    }

    let planner_defaults = PlannerConfig::default();
    let planner = PlannerConfig {
        high_complexity_threshold: overlay
            .high_complexity_threshold
            .unwrap_or(planner_defaults.high_complexity_threshold),
        high_transparency_threshold: overlay
            .high_transparency_threshold
            .unwrap_or(planner_defaults.high_transparency_threshold),
    };
    ensure_unit("planner.high_complexity_threshold", planner.high_complexity_threshold)?;
    ensure_unit("planner.high_transparency_threshold", planner.high_transparency_threshold)?;

    let routing_defaults = RoutingConfig::default();
    let routing = RoutingConfig {
        risk_threshold: overlay.risk_threshold.unwrap_or(routing_defaults.risk_threshold),
        conditioning_threshold: overlay
            .conditioning_threshold
            .unwrap_or(routing_defaults.conditioning_threshold),
        conditioning_weight_min: overlay
            .conditioning_weight_min
            .unwrap_or(routing_defaults.conditioning_weight_min),
        conditioning_weight_max: overlay
            .conditioning_weight_max
            .unwrap_or(routing_defaults.conditioning_weight_max),
    };
    ensure_unit("routing.risk_threshold", routing.risk_threshold)?;
    ensure_unit("routing.conditioning_threshold", routing.conditioning_threshold)?;
    ensure_unit("routing.conditioning_weight_min", routing.conditioning_weight_min)?;
    ensure_unit("routing.conditioning_weight_max", routing.conditioning_weight_max)?;
    if routing.conditioning_weight_min > routing.conditioning_weight_max {
        return Err(invalid(
            "routing.conditioning_weight_min",
            "must not exceed conditioning_weight_max",
        ));
    }

    let qa_defaults = QaConfig::default();
    let mut qa = QaConfig {
        pass_threshold: overlay.pass_threshold.unwrap_or(qa_defaults.pass_threshold),
        max_retries: overlay.max_retries.unwrap_or(qa_defaults.max_retries),
        solid_delta_e_ceiling: overlay
            .solid_delta_e_ceiling
            .unwrap_or(qa_defaults.solid_delta_e_ceiling),
        textured_delta_e_ceiling: overlay
            .textured_delta_e_ceiling
            .unwrap_or(qa_defaults.textured_delta_e_ceiling),
        floors: qa_defaults.floors,
    };
    qa.floors.edge_gate = overlay.edge_floor.unwrap_or(qa.floors.edge_gate);
    qa.floors.background_gate = overlay.background_floor.unwrap_or(qa.floors.background_gate);
    qa.floors.color_fidelity = overlay.color_floor.unwrap_or(qa.floors.color_fidelity);
    qa.floors.semantic_alignment = overlay
        .semantic_floor
        .unwrap_or(qa.floors.semantic_alignment);
    ensure_unit("qa.pass_threshold", qa.pass_threshold)?;
    if qa.max_retries == 0 {
        return Err(invalid("qa.max_retries", "must be at least 1"));
    }
    for (field, ceiling) in [
        ("qa.solid_delta_e_ceiling", qa.solid_delta_e_ceiling),
        ("qa.textured_delta_e_ceiling", qa.textured_delta_e_ceiling),
    ] {
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(invalid(field, "must be a positive number"));
        }
    }
    for (field, floor) in [
        ("qa.floors.edge", qa.floors.edge_gate),
        ("qa.floors.background", qa.floors.background_gate),
        ("qa.floors.color", qa.floors.color_fidelity),
        ("qa.floors.semantic", qa.floors.semantic_alignment),
    ] {
        ensure_unit(field, floor)?;
    }

    let orchestrator_defaults = OrchestratorConfig::default();
    let orchestrator = OrchestratorConfig {
        concurrency: overlay.concurrency.unwrap_or(orchestrator_defaults.concurrency),
        image_timeout_secs: overlay
            .image_timeout_secs
            .unwrap_or(orchestrator_defaults.image_timeout_secs),
        collaborator_timeout_secs: overlay
            .collaborator_timeout_secs
            .unwrap_or(orchestrator_defaults.collaborator_timeout_secs),
        min_parts_detected: overlay
            .min_parts_detected
            .unwrap_or(orchestrator_defaults.min_parts_detected),
        output_dir: overlay
            .output_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or(orchestrator_defaults.output_dir),
    };
    if orchestrator.concurrency == 0 {
        return Err(invalid("orchestrator.concurrency", "must be at least 1"));
    }
    if orchestrator.image_timeout_secs == 0 || orchestrator.collaborator_timeout_secs == 0 {
        return Err(invalid("orchestrator.timeouts", "must be at least 1 second"));
    }

    let endpoints = HttpEndpoints {
        segmentation: overlay.segmentation_endpoint.clone(),
        part_analysis: overlay.part_analysis_endpoint.clone(),
        generation_primary: overlay.generation_primary_endpoint.clone(),
        generation_secondary: overlay.generation_secondary_endpoint.clone(),
        semantic_review: overlay.semantic_review_endpoint.clone(),
        api_key_env: overlay.api_key_env.clone(),
        part_analysis_model: overlay.part_analysis_model.clone(),
        semantic_model: overlay.semantic_model.clone(),
    };

    Ok(StudioSettings {
        features,
        fusion,
        mask_weights,
        planner,
        routing,
        qa,
        orchestrator,
        endpoints,
    })
}

pub fn parse_studio_settings_overlay_json(
    value: &Value,
) -> Result<StudioSettingsOverlay, SettingsError> {
    let root = value.as_object().ok_or(SettingsError::RootMustBeObject)?;
    let mut out = StudioSettingsOverlay::default();

    if let Some(features) = section(root, "features")? {
        out.max_colors = opt(features, "features", "max_colors", parse_usize)?;
        out.clustering_seed = opt(features, "features", "clustering_seed", parse_u64)?;
        out.kmeans_iterations = opt(features, "features", "kmeans_iterations", parse_usize)?;
        out.frequency_cutoff = opt(features, "features", "frequency_cutoff", parse_f32)?;
        out.pattern_threshold = opt(features, "features", "pattern_threshold", parse_f32)?;
        out.detect_text = opt(features, "features", "detect_text", parse_bool)?;
    }

    if let Some(fusion) = section(root, "fusion")? {
        out.fusion_cutoff = opt(fusion, "fusion", "cutoff", parse_f32)?;
        out.fusion_delta = opt(fusion, "fusion", "delta", parse_f32)?;
        out.blur_sigma = opt(fusion, "fusion", "blur_sigma", parse_f32)?;
        out.dilation_radius = opt(fusion, "fusion", "dilation_radius", parse_u8)?;
        out.feather_sigma = opt(fusion, "fusion", "feather_sigma", parse_f32)?;
        out.edge_tolerance_px = opt(fusion, "fusion", "edge_tolerance_px", parse_u8)?;
        if let Some(weights) = fusion.get("weights") {
            let weights = weights
                .as_object()
                .ok_or_else(|| invalid_type("fusion.weights"))?;
            let mut parsed = BTreeMap::new();
            for (source, weight) in weights {
                let field = format!("fusion.weights.{source}");
                parsed.insert(source.clone(), parse_f32(weight, field.as_str())?);
            }
            out.mask_weights = Some(parsed);
        }
    }

    if let Some(planner) = section(root, "planner")? {
        out.high_complexity_threshold =
            opt(planner, "planner", "high_complexity_threshold", parse_f64)?;
        out.high_transparency_threshold =
            opt(planner, "planner", "high_transparency_threshold", parse_f64)?;
    }

    if let Some(routing) = section(root, "routing")? {
        out.risk_threshold = opt(routing, "routing", "risk_threshold", parse_f64)?;
        out.conditioning_threshold = opt(routing, "routing", "conditioning_threshold", parse_f64)?;
        out.conditioning_weight_min =
            opt(routing, "routing", "conditioning_weight_min", parse_f64)?;
        out.conditioning_weight_max =
            opt(routing, "routing", "conditioning_weight_max", parse_f64)?;
    }

    if let Some(qa) = section(root, "qa")? {
        out.pass_threshold = opt(qa, "qa", "pass_threshold", parse_f64)?;
        out.max_retries = opt(qa, "qa", "max_retries", parse_u32)?;
        out.solid_delta_e_ceiling = opt(qa, "qa", "solid_delta_e_ceiling", parse_f64)?;
        out.textured_delta_e_ceiling = opt(qa, "qa", "textured_delta_e_ceiling", parse_f64)?;
        if let Some(floors) = section(qa, "floors")? {
            out.edge_floor = opt(floors, "qa.floors", "edge", parse_f64)?;
            out.background_floor = opt(floors, "qa.floors", "background", parse_f64)?;
            out.color_floor = opt(floors, "qa.floors", "color", parse_f64)?;
            out.semantic_floor = opt(floors, "qa.floors", "semantic", parse_f64)?;
        }
    }

    if let Some(orchestrator) = section(root, "orchestrator")? {
        out.concurrency = opt(orchestrator, "orchestrator", "concurrency", parse_usize)?;
        out.image_timeout_secs = opt(orchestrator, "orchestrator", "image_timeout_secs", parse_u64)?;
        out.collaborator_timeout_secs =
            opt(orchestrator, "orchestrator", "collaborator_timeout_secs", parse_u64)?;
        out.min_parts_detected =
            opt(orchestrator, "orchestrator", "min_parts_detected", parse_usize)?;
        out.output_dir = opt(orchestrator, "orchestrator", "output_dir", parse_string)?;
    }

    if let Some(collaborators) = section(root, "collaborators")? {
        let scope = "collaborators";
        out.segmentation_endpoint = opt(collaborators, scope, "segmentation_endpoint", parse_url)?;
        out.part_analysis_endpoint = opt(collaborators, scope, "part_analysis_endpoint", parse_url)?;
        out.generation_primary_endpoint =
            opt(collaborators, scope, "generation_primary_endpoint", parse_url)?;
        out.generation_secondary_endpoint =
            opt(collaborators, scope, "generation_secondary_endpoint", parse_url)?;
        out.semantic_review_endpoint =
            opt(collaborators, scope, "semantic_review_endpoint", parse_url)?;
        out.api_key_env = opt(collaborators, scope, "api_key_env", parse_string)?;
        out.part_analysis_model = opt(collaborators, scope, "part_analysis_model", parse_string)?;
        out.semantic_model = opt(collaborators, scope, "semantic_model", parse_string)?;
    }

    Ok(out)
}

fn load_optional_overlay_by_extension(path: &Path) -> Result<StudioSettingsOverlay, SettingsError> {
    match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "toml" => load_optional_overlay_from_toml_path(path),
        _ => load_optional_overlay_from_json_path(path),
    }
}

fn load_optional_overlay_from_json_path(
    path: &Path,
) -> Result<StudioSettingsOverlay, SettingsError> {
    if !path.exists() {
        return Ok(StudioSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed =
        serde_json::from_str::<Value>(raw.as_str()).map_err(|error| SettingsError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_studio_settings_overlay_json(&parsed)
}

fn load_optional_overlay_from_toml_path(
    path: &Path,
) -> Result<StudioSettingsOverlay, SettingsError> {
    if !path.exists() {
        return Ok(StudioSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed =
        toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| SettingsError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    let json_value = serde_json::to_value(parsed).map_err(|error| SettingsError::ParseToml {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    parse_studio_settings_overlay_json(&json_value)
}

fn pick<T>(layers: [Option<T>; 3]) -> Option<T> {
    layers.into_iter().flatten().next()
}

fn choose_string(layers: [Option<&str>; 3]) -> Option<String> {
    let [a, b, c] = layers;
    a.or(b).or(c).map(str::to_string)
}

fn section<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, SettingsError> {
    match root.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_object()
            .map(Some)
            .ok_or_else(|| invalid_type(key)),
    }
}

fn opt<T>(
    object: &Map<String, Value>,
    scope: &str,
    key: &str,
    parse: fn(&Value, &str) -> Result<T, SettingsError>,
) -> Result<Option<T>, SettingsError> {
    object
        .get(key)
        .map(|value| parse(value, format!("{scope}.{key}").as_str()))
        .transpose()
}

fn invalid_type(field: &str) -> SettingsError {
    SettingsError::InvalidFieldType {
        field: field.to_string(),
    }
}

fn invalid(field: &str, message: &str) -> SettingsError {
    SettingsError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| invalid_type(field))?;
    if parsed.is_empty() {
        return Err(invalid_type(field));
    }
    Ok(parsed.to_string())
}

fn parse_url(value: &Value, field: &str) -> Result<String, SettingsError> {
    let parsed = parse_string(value, field)?;
    url::Url::parse(parsed.as_str()).map_err(|error| SettingsError::InvalidValue {
        field: field.to_string(),
        message: error.to_string(),
    })?;
    Ok(parsed)
}

fn parse_bool(value: &Value, field: &str) -> Result<bool, SettingsError> {
    value.as_bool().ok_or_else(|| invalid_type(field))
}

fn parse_f64(value: &Value, field: &str) -> Result<f64, SettingsError> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid_type(field))
}

fn parse_f32(value: &Value, field: &str) -> Result<f32, SettingsError> {
    parse_f64(value, field).map(|v| v as f32)
}

fn parse_u64(value: &Value, field: &str) -> Result<u64, SettingsError> {
    value.as_u64().ok_or_else(|| invalid_type(field))
}

fn parse_u32(value: &Value, field: &str) -> Result<u32, SettingsError> {
    u32::try_from(parse_u64(value, field)?).map_err(|_| invalid_type(field))
}

fn parse_u8(value: &Value, field: &str) -> Result<u8, SettingsError> {
    u8::try_from(parse_u64(value, field)?).map_err(|_| invalid_type(field))
}

fn parse_usize(value: &Value, field: &str) -> Result<usize, SettingsError> {
    usize::try_from(parse_u64(value, field)?).map_err(|_| invalid_type(field))
}

fn ensure_unit(field: &str, value: f64) -> Result<(), SettingsError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        return Ok(());
    }
    Err(invalid(field, "must lie in [0, 1]"))
}

fn ensure_unit_f32(field: &str, value: f32) -> Result<(), SettingsError> {
    ensure_unit(field, f64::from(value))
}
