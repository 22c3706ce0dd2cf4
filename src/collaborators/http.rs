//! JSON-over-HTTP collaborator clients. Images travel as base64 PNG.

use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::keys::KeySource;
use super::{
    CollaboratorError, DetectedPart, GenerationBackend, GenerationRequest,
    PartAnalysisCollaborator, PartAnalysisRequest, SegmentationCollaborator, SemanticReviewer,
};
use crate::fusion::SoftMask;
use crate::imaging::GrayField;
use crate::routing::Backend;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpEndpoints {
    pub segmentation: Option<String>,
    pub part_analysis: Option<String>,
    pub generation_primary: Option<String>,
    pub generation_secondary: Option<String>,
    pub semantic_review: Option<String>,
    pub api_key_env: Option<String>,
    pub part_analysis_model: Option<String>,
    pub semantic_model: Option<String>,
}

/// Shared plumbing for every endpoint: one blocking client, one bearer key.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpClient {
    pub fn new(
        endpoints: &HttpEndpoints,
        keys: &KeySource,
        timeout_secs: u64,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| CollaboratorError::failed("http", format!("http client init failed: {e}")))?;
        let api_key = endpoints
            .api_key_env
            .as_deref()
            .and_then(|name| keys.resolve(name));
        Ok(Self {
            client,
            api_key,
            timeout_secs,
        })
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        collaborator: &str,
        endpoint: &Url,
        body: &serde_json::Value,
    ) -> Result<T, CollaboratorError> {
        let resp = self.send(collaborator, endpoint, body)?;
        resp.json::<T>()
            .map_err(|e| CollaboratorError::malformed(collaborator, format!("JSON decode failed: {e}")))
    }

    fn post_text(
        &self,
        collaborator: &str,
        endpoint: &Url,
        body: &serde_json::Value,
    ) -> Result<String, CollaboratorError> {
        let resp = self.send(collaborator, endpoint, body)?;
        resp.text()
            .map_err(|e| CollaboratorError::malformed(collaborator, format!("body read failed: {e}")))
    }

    fn send(
        &self,
        collaborator: &str,
        endpoint: &Url,
        body: &serde_json::Value,
    ) -> Result<Response, CollaboratorError> {
        let mut request = self.client.post(endpoint.clone()).json(body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let resp = request.send().map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Timeout {
                    collaborator: collaborator.to_string(),
                    seconds: self.timeout_secs,
                }
            } else if e.is_connect() {
                CollaboratorError::unavailable(collaborator, format!("connection failed: {e}"))
            } else {
                CollaboratorError::failed(collaborator, format!("request failed: {e}"))
            }
        })?;
        let status = resp.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(CollaboratorError::unavailable(collaborator, "HTTP 503"));
        }
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(CollaboratorError::failed(
                collaborator,
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
        }
        Ok(resp)
    }
}

pub fn parse_endpoint(collaborator: &str, raw: Option<&str>) -> Result<Url, CollaboratorError> {
    let raw = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CollaboratorError::unavailable(collaborator, "no endpoint configured"))?;
    let url = Url::parse(raw)
        .map_err(|e| CollaboratorError::failed(collaborator, format!("invalid endpoint '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CollaboratorError::failed(
            collaborator,
            format!("unsupported endpoint scheme '{}'", url.scheme()),
        ));
    }
    Ok(url)
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String, CollaboratorError> {
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .map_err(|e| CollaboratorError::failed("http", format!("png encode failed: {e}")))?;
    Ok(BASE64_STANDARD.encode(bytes.into_inner()))
}

fn decode_base64_image(
    collaborator: &str,
    b64: &str,
) -> Result<image::DynamicImage, CollaboratorError> {
    let bytes = BASE64_STANDARD
        .decode(b64.as_bytes())
        .map_err(|e| CollaboratorError::malformed(collaborator, format!("image base64 decode failed: {e}")))?;
    image::load_from_memory(bytes.as_slice())
        .map_err(|e| CollaboratorError::malformed(collaborator, format!("image decode failed: {e}")))
}

#[derive(Debug, Deserialize)]
struct ImagePayload {
    image_b64: String,
}

#[derive(Debug, Deserialize)]
struct MaskPayloadItem {
    source: String,
    mask_b64: String,
}

#[derive(Debug, Deserialize)]
struct MasksPayload {
    masks: Vec<MaskPayloadItem>,
}

#[derive(Debug, Deserialize)]
struct PartsPayload {
    parts: Vec<DetectedPart>,
}

pub struct HttpSegmentation {
    http: HttpClient,
    endpoint: Url,
}

impl HttpSegmentation {
    pub fn new(http: HttpClient, endpoints: &HttpEndpoints) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http,
            endpoint: parse_endpoint("segmentation", endpoints.segmentation.as_deref())?,
        })
    }

    fn request_masks(
        &self,
        image: &RgbImage,
        prompts: &[&str],
    ) -> Result<Vec<SoftMask>, CollaboratorError> {
        let body = json!({ "image_b64": encode_png_base64(image)?, "prompts": prompts });
        let payload: MasksPayload = self.http.post_json("segmentation", &self.endpoint, &body)?;
        payload
            .masks
            .into_iter()
            .map(|item| {
                let luma = decode_base64_image("segmentation", item.mask_b64.as_str())?.to_luma8();
                if luma.dimensions() != image.dimensions() {
                    return Err(CollaboratorError::malformed(
                        "segmentation",
                        format!(
                            "mask '{}' is {}x{}, expected {}x{}",
                            item.source,
                            luma.width(),
                            luma.height(),
                            image.width(),
                            image.height()
                        ),
                    ));
                }
                Ok(SoftMask::new(item.source, GrayField::from_luma8(&luma)))
            })
            .collect()
    }
}

impl SegmentationCollaborator for HttpSegmentation {
    fn garment_masks(&self, image: &RgbImage) -> Result<Vec<SoftMask>, CollaboratorError> {
        let masks = self.request_masks(image, &["garment"])?;
        if masks.is_empty() {
            return Err(CollaboratorError::malformed("segmentation", "no masks returned"));
        }
        Ok(masks)
    }

    fn human_mask(&self, image: &RgbImage) -> Result<SoftMask, CollaboratorError> {
        self.request_masks(image, &["person", "skin"])?
            .into_iter()
            .next()
            .ok_or_else(|| CollaboratorError::malformed("segmentation", "no human mask returned"))
    }

    fn detect_parts(
        &self,
        image: &RgbImage,
        part_names: &[String],
    ) -> Result<Vec<DetectedPart>, CollaboratorError> {
        let body = json!({ "image_b64": encode_png_base64(image)?, "prompts": part_names });
        let payload: PartsPayload = self.http.post_json("part-detection", &self.endpoint, &body)?;
        Ok(payload.parts)
    }
}

pub struct HttpPartAnalysis {
    http: HttpClient,
    endpoint: Url,
    model: Option<String>,
}

impl HttpPartAnalysis {
    pub fn new(http: HttpClient, endpoints: &HttpEndpoints) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http,
            endpoint: parse_endpoint("part-analysis", endpoints.part_analysis.as_deref())?,
            model: endpoints.part_analysis_model.clone(),
        })
    }
}

impl PartAnalysisCollaborator for HttpPartAnalysis {
    fn analyze_part(&self, request: &PartAnalysisRequest) -> Result<String, CollaboratorError> {
        let body = json!({
            "part_name": request.part_name,
            "context": request.context,
            "model": self.model,
            "image_b64": encode_png_base64(&request.crop)?,
        });
        self.http.post_text("part-analysis", &self.endpoint, &body)
    }
}

pub struct HttpGeneration {
    http: HttpClient,
    primary: Option<Url>,
    secondary: Option<Url>,
}

impl HttpGeneration {
    pub fn new(http: HttpClient, endpoints: &HttpEndpoints) -> Result<Self, CollaboratorError> {
        let optional = |name: &str, raw: Option<&str>| match raw {
            Some(value) if !value.trim().is_empty() => parse_endpoint(name, Some(value)).map(Some),
            _ => Ok(None),
        };
        Ok(Self {
            http,
            primary: optional("generation-primary", endpoints.generation_primary.as_deref())?,
            secondary: optional("generation-secondary", endpoints.generation_secondary.as_deref())?,
        })
    }
}

impl GenerationBackend for HttpGeneration {
    fn generate(&self, request: &GenerationRequest) -> Result<RgbImage, CollaboratorError> {
        let collaborator = format!("generation-{}", request.backend.as_str());
        let endpoint = match request.backend {
            Backend::Primary => self.primary.as_ref(),
            Backend::Secondary => self.secondary.as_ref(),
        }
        .ok_or_else(|| CollaboratorError::unavailable(collaborator.as_str(), "no endpoint configured"))?;
        let body = json!({
            "prompt": request.prompt,
            "backend": request.backend,
            "use_auxiliary_conditioning": request.use_auxiliary_conditioning,
            "conditioning_weight": request.conditioning_weight,
            "image_b64": encode_png_base64(&request.source)?,
        });
        let payload: ImagePayload = self.http.post_json(collaborator.as_str(), endpoint, &body)?;
        Ok(decode_base64_image(collaborator.as_str(), payload.image_b64.as_str())?.to_rgb8())
    }
}

pub struct HttpSemanticReviewer {
    http: HttpClient,
    endpoint: Url,
    model: Option<String>,
}

impl HttpSemanticReviewer {
    pub fn new(http: HttpClient, endpoints: &HttpEndpoints) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http,
            endpoint: parse_endpoint("semantic-review", endpoints.semantic_review.as_deref())?,
            model: endpoints.semantic_model.clone(),
        })
    }
}

impl SemanticReviewer for HttpSemanticReviewer {
    fn review(&self, rendered: &RgbImage) -> Result<String, CollaboratorError> {
        let body = json!({
            "model": self.model,
            "image_b64": encode_png_base64(rendered)?,
        });
        self.http.post_text("semantic-review", &self.endpoint, &body)
    }
}
