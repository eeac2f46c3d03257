use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use derive_more::{Display, Error};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::settings::{Credentials, SimulationSettings};

pub type AlphaId = String;
pub type SimulationId = String;

/// Most children the service accepts in one multi-simulation.
pub const MAX_MULTI_SIMULATION: usize = 10;
/// Largest page the data-field endpoint will return.
pub const MAX_FIELDS_PAGE: usize = 50;

pub const STEP_UP_CHALLENGE: &str = "persona";
const STEP_UP_LOCATION: &str = "/authentication/persona?inquiry=brainrun";

#[derive(Debug, Display, Error)]
pub enum BrainError {
    #[display("credentials missing from WQ_EMAIL/WQ_PASSWORD")]
    MissingCredentials,
    #[display("unauthorized")]
    Unauthorized,
    #[display("unknown simulation {id}")]
    UnknownSimulation { id: String },
    #[display("unknown alpha {id}")]
    UnknownAlpha { id: String },
    #[display("simulation at {location} is no longer available")]
    JobEvicted { location: String },
    #[display("simulation response carried no Location header")]
    MissingLocation,
    #[display("too many simulations in flight")]
    RateLimited,
    #[display("unexpected status {status}")]
    UnexpectedStatus { status: u16 },
    #[display("page size {limit} outside of [1, 50]")]
    InvalidPageSize { limit: usize },
    #[display("delimiter {delimiter:?} must be a single ASCII character")]
    InvalidDelimiter { delimiter: char },
    #[display("template variable {name} is not defined")]
    UndefinedVariable { name: String },
    #[display("template variable {name} has no values")]
    EmptyVariable { name: String },
    #[display("malformed request: {reason}")]
    MalformedRequest { reason: String },
}

impl actix_web::ResponseError for BrainError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            BrainError::Unauthorized => actix_web::http::StatusCode::UNAUTHORIZED,
            BrainError::UnknownSimulation { .. }
            | BrainError::UnknownAlpha { .. }
            | BrainError::JobEvicted { .. } => actix_web::http::StatusCode::NOT_FOUND,
            BrainError::RateLimited => actix_web::http::StatusCode::TOO_MANY_REQUESTS,
            _ => actix_web::http::StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimulationRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub settings: SimulationSettings,
    pub regular: String,
}

impl SimulationRequest {
    pub fn regular(expression: impl Into<String>, settings: &SimulationSettings) -> Self {
        Self {
            kind: "REGULAR".to_string(),
            settings: settings.clone(),
            regular: expression.into(),
        }
    }
}

/// `POST /simulations` takes either one request or an array of them.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SimulationBody {
    Batch(Vec<SimulationRequest>),
    Single(SimulationRequest),
}

impl SimulationBody {
    pub fn batch(expressions: &[String], settings: &SimulationSettings) -> Self {
        SimulationBody::Batch(
            expressions
                .iter()
                .map(|expression| SimulationRequest::regular(expression.as_str(), settings))
                .collect(),
        )
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProgressResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<AlphaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<SimulationId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SimulationProgress {
    Pending,
    Alpha(AlphaId),
    Children(Vec<SimulationId>),
}

impl From<ProgressResponse> for SimulationProgress {
    fn from(value: ProgressResponse) -> Self {
        if let Some(children) = value.children {
            SimulationProgress::Children(children)
        } else if let Some(alpha) = value.alpha {
            SimulationProgress::Alpha(alpha)
        } else {
            SimulationProgress::Pending
        }
    }
}

impl From<&SimulationProgress> for ProgressResponse {
    fn from(value: &SimulationProgress) -> Self {
        match value {
            SimulationProgress::Pending => ProgressResponse {
                progress: Some(0.5),
                ..Default::default()
            },
            SimulationProgress::Alpha(alpha) => ProgressResponse {
                alpha: Some(alpha.clone()),
                status: Some("COMPLETE".to_string()),
                ..Default::default()
            },
            SimulationProgress::Children(children) => ProgressResponse {
                children: Some(children.clone()),
                status: Some("COMPLETE".to_string()),
                ..Default::default()
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DataField {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FieldsPage {
    pub count: usize,
    pub results: Vec<DataField>,
}

/// Filters for `GET /data-fields`. Optional bounds left as `None` are sent as empty strings.
#[derive(Clone, Debug)]
pub struct FieldQuery {
    pub dataset_id: String,
    pub region: String,
    pub data_type: String,
    pub universe: String,
    pub delay: u8,
    pub instrument_type: String,
    pub limit: usize,
    pub theme: bool,
    pub alpha_count: (Option<u64>, Option<u64>),
    pub coverage: (Option<f64>, Option<f64>),
    pub user_count: (Option<u64>, Option<u64>),
    pub search: Option<String>,
}

fn bound<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

impl FieldQuery {
    pub fn new(
        dataset_id: impl Into<String>,
        region: impl Into<String>,
        data_type: impl Into<String>,
        universe: impl Into<String>,
        delay: u8,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            region: region.into(),
            data_type: data_type.into(),
            universe: universe.into(),
            delay,
            instrument_type: "EQUITY".to_string(),
            limit: MAX_FIELDS_PAGE,
            theme: false,
            alpha_count: (None, None),
            coverage: (None, None),
            user_count: (None, None),
            search: None,
        }
    }

    pub fn params(&self, offset: usize) -> Vec<(&'static str, String)> {
        vec![
            ("dataset.id", self.dataset_id.clone()),
            ("region", self.region.clone()),
            ("type", self.data_type.clone()),
            ("universe", self.universe.clone()),
            ("delay", self.delay.to_string()),
            ("instrumentType", self.instrument_type.clone()),
            ("limit", self.limit.to_string()),
            ("theme", self.theme.to_string()),
            ("alpha>", bound(&self.alpha_count.0)),
            ("alpha<", bound(&self.alpha_count.1)),
            ("coverage>", bound(&self.coverage.0)),
            ("coverage<", bound(&self.coverage.1)),
            ("userCount>", bound(&self.user_count.0)),
            ("userCount<", bound(&self.user_count.1)),
            ("search", self.search.clone().unwrap_or_default()),
            ("offset", offset.to_string()),
        ]
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Operator {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InSample {
    pub pnl: f64,
    pub long_count: f64,
    pub short_count: f64,
    pub turnover: f64,
    pub returns: f64,
    pub drawdown: f64,
    pub margin: f64,
    pub sharpe: f64,
    pub fitness: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegularCode {
    pub code: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlphaDetail {
    pub id: AlphaId,
    #[serde(rename = "is")]
    pub in_sample: InSample,
    pub regular: RegularCode,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum CorrelationKind {
    /// Against the user's own submitted alphas.
    #[serde(rename = "self")]
    Own,
    #[serde(rename = "prod")]
    Prod,
    #[serde(rename = "power-pool")]
    PowerPool,
}

impl CorrelationKind {
    pub fn as_path(&self) -> &'static str {
        match self {
            CorrelationKind::Own => "self",
            CorrelationKind::Prod => "prod",
            CorrelationKind::PowerPool => "power-pool",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct CorrelationResponse {
    pub max: f64,
    pub min: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AlphaDescription {
    pub description: String,
}

/// Body of `PATCH /alphas/{id}`. Only populated fields are sent.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AlphaProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regular: Option<AlphaDescription>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoginOutcome {
    Authorized,
    /// Credentials were accepted but a human has to confirm at `location` before the session is
    /// live.
    StepUp { location: String },
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepUpStatus {
    Authorized,
    Failed,
    Unknown(u16),
}

/// Single-attempt operations against the service. Nothing here retries, see
/// [crate::session::Session] for that.
pub trait Client {
    fn login(&self, credentials: &Credentials) -> Result<LoginOutcome>;
    fn complete_step_up(&self, location: &str) -> Result<StepUpStatus>;
    fn fetch_fields_page(&self, query: &FieldQuery, offset: usize) -> Result<FieldsPage>;
    fn fetch_operators(&self) -> Result<Vec<Operator>>;
    /// Returns the location to poll.
    fn create_simulation(&self, body: &SimulationBody) -> Result<String>;
    fn simulation_progress(&self, location: &str) -> Result<SimulationProgress>;
    fn child_progress(&self, child: &SimulationId) -> Result<SimulationProgress>;
    /// `None` when the service answered with an empty body.
    fn fetch_alpha(&self, alpha_id: &str) -> Result<Option<AlphaDetail>>;
    fn fetch_correlation(
        &self,
        alpha_id: &str,
        kind: CorrelationKind,
    ) -> Result<Option<CorrelationResponse>>;
    fn update_alpha(&self, alpha_id: &str, properties: &AlphaProperties) -> Result<u16>;
    fn submit_alpha(&self, alpha_id: &str) -> Result<u16>;
}

enum JobOutcome {
    Alpha(AlphaId),
    Children(Vec<SimulationId>),
}

struct SimulationJob {
    remaining_polls: u32,
    outcome: JobOutcome,
}

pub struct AlphaState {
    pub detail: AlphaDetail,
    pub properties: AlphaProperties,
    pub submitted: bool,
    metrics_lag: u32,
    correlations: HashMap<CorrelationKind, (CorrelationResponse, u32)>,
}

/// In-memory model of the service. Simulations resolve after `resolve_after` polls, metrics and
/// correlations answer empty for their configured lag before returning a body.
pub struct AppState {
    pub accounts: HashMap<String, String>,
    pub step_up_required: bool,
    /// Confirmations that fail before one succeeds.
    pub step_up_failures: u32,
    step_up_confirmed: bool,
    pub datasets: HashMap<String, Vec<DataField>>,
    /// Page offset to the number of times that page comes back without rows.
    pub empty_pages: HashMap<usize, u32>,
    pub operators: Vec<Operator>,
    pub resolve_after: u32,
    /// Upcoming progress polls that find their simulation evicted.
    pub evict_next: u32,
    /// Upcoming submissions refused as rate limited.
    pub reject_submissions: u32,
    pub metrics_lag: u32,
    pub correlation_lag: u32,
    /// Expressions whose metrics never become available.
    pub stale_expressions: HashSet<String>,
    pub alphas: HashMap<AlphaId, AlphaState>,
    simulations: HashMap<SimulationId, SimulationJob>,
    last: u64,
    rng: StdRng,
}

pub type BrainState = Mutex<AppState>;

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            step_up_required: false,
            step_up_failures: 0,
            step_up_confirmed: false,
            datasets: HashMap::new(),
            empty_pages: HashMap::new(),
            operators: Vec::new(),
            resolve_after: 0,
            evict_next: 0,
            reject_submissions: 0,
            metrics_lag: 0,
            correlation_lag: 0,
            stale_expressions: HashSet::new(),
            alphas: HashMap::new(),
            simulations: HashMap::new(),
            last: 0,
            rng: StdRng::seed_from_u64(57),
        }
    }

    /// Seeded with one account, one dataset and a handful of operators.
    pub fn demo() -> Self {
        let mut state = Self::new();
        state.add_account("demo@brain.local", "demo");
        state.add_dataset(
            "fundamental6",
            (0..120)
                .map(|i| DataField {
                    id: format!("fnd6_field_{i:03}"),
                    description: format!("Fundamental field {i}"),
                })
                .collect(),
        );
        for (name, category) in [
            ("rank", "Cross Sectional"),
            ("zscore", "Cross Sectional"),
            ("ts_mean", "Time Series"),
            ("ts_delta", "Time Series"),
            ("ts_rank", "Time Series"),
            ("group_neutralize", "Group"),
        ] {
            state.operators.push(Operator {
                name: name.to_string(),
                category: category.to_string(),
                definition: format!("{name}(x)"),
                description: String::new(),
            });
        }
        state.resolve_after = 2;
        state
    }

    pub fn add_account(&mut self, email: &str, password: &str) {
        self.accounts.insert(email.to_string(), password.to_string());
    }

    pub fn add_dataset(&mut self, dataset_id: &str, fields: Vec<DataField>) {
        self.datasets.insert(dataset_id.to_string(), fields);
    }

    pub fn login(&self, email: &str, password: &str) -> LoginOutcome {
        match self.accounts.get(email) {
            Some(expected) if expected == password => {
                if self.step_up_required && !self.step_up_confirmed {
                    LoginOutcome::StepUp {
                        location: STEP_UP_LOCATION.to_string(),
                    }
                } else {
                    LoginOutcome::Authorized
                }
            }
            _ => LoginOutcome::Rejected,
        }
    }

    pub fn confirm_step_up(&mut self) {
        if self.step_up_failures > 0 {
            self.step_up_failures -= 1;
        } else {
            self.step_up_confirmed = true;
        }
    }

    pub fn auth_status(&self) -> StepUpStatus {
        if !self.step_up_required || self.step_up_confirmed {
            StepUpStatus::Authorized
        } else {
            StepUpStatus::Failed
        }
    }

    pub fn fields_page(
        &mut self,
        dataset_id: &str,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> FieldsPage {
        let matching: Vec<&DataField> = self
            .datasets
            .get(dataset_id)
            .map(|fields| {
                fields
                    .iter()
                    .filter(|field| search.map_or(true, |s| field.id.contains(s)))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(remaining) = self.empty_pages.get_mut(&offset).filter(|n| **n > 0) {
            *remaining -= 1;
            return FieldsPage {
                count: matching.len(),
                results: Vec::new(),
            };
        }

        FieldsPage {
            count: matching.len(),
            results: matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.last += 1;
        format!("{prefix}{:06}", self.last)
    }

    fn create_alpha(&mut self, request: &SimulationRequest) -> AlphaId {
        let id = self.next_id("a");
        let unit = Uniform::new(0.0_f64, 1.0);
        let sharpe = -1.0 + 4.0 * unit.sample(&mut self.rng);
        let turnover = 0.01 + 0.5 * unit.sample(&mut self.rng);
        let returns = 0.3 * unit.sample(&mut self.rng) - 0.05;
        let drawdown = 0.3 * unit.sample(&mut self.rng);
        let in_sample = InSample {
            pnl: 1_000_000.0 * returns,
            long_count: (500.0 + 1000.0 * unit.sample(&mut self.rng)).floor(),
            short_count: (500.0 + 1000.0 * unit.sample(&mut self.rng)).floor(),
            turnover,
            returns,
            drawdown,
            margin: returns / (turnover * 252.0),
            sharpe,
            fitness: sharpe * (returns.abs() / turnover.max(0.125)).sqrt(),
        };

        let mut correlations = HashMap::new();
        for kind in [
            CorrelationKind::Own,
            CorrelationKind::Prod,
            CorrelationKind::PowerPool,
        ] {
            let max = unit.sample(&mut self.rng);
            let min = -unit.sample(&mut self.rng) * max;
            correlations.insert(kind, (CorrelationResponse { max, min }, self.correlation_lag));
        }

        let alpha = AlphaState {
            detail: AlphaDetail {
                id: id.clone(),
                in_sample,
                regular: RegularCode {
                    code: request.regular.clone(),
                },
            },
            properties: AlphaProperties::default(),
            submitted: false,
            metrics_lag: self.metrics_lag,
            correlations,
        };
        self.alphas.insert(id.clone(), alpha);
        id
    }

    pub fn create_simulation(&mut self, body: &SimulationBody) -> Result<SimulationId, BrainError> {
        if self.reject_submissions > 0 {
            self.reject_submissions -= 1;
            return Err(BrainError::RateLimited);
        }
        let outcome = match body {
            SimulationBody::Single(request) => JobOutcome::Alpha(self.create_alpha(request)),
            SimulationBody::Batch(requests) => {
                if requests.is_empty() || requests.len() > MAX_MULTI_SIMULATION {
                    return Err(BrainError::MalformedRequest {
                        reason: format!(
                            "multi-simulation takes 1 to {MAX_MULTI_SIMULATION} alphas, got {}",
                            requests.len()
                        ),
                    });
                }
                let mut children = Vec::with_capacity(requests.len());
                for request in requests {
                    let alpha_id = self.create_alpha(request);
                    let child_id = self.next_id("c");
                    self.simulations.insert(
                        child_id.clone(),
                        SimulationJob {
                            remaining_polls: 0,
                            outcome: JobOutcome::Alpha(alpha_id),
                        },
                    );
                    children.push(child_id);
                }
                JobOutcome::Children(children)
            }
        };

        let id = self.next_id("s");
        self.simulations.insert(
            id.clone(),
            SimulationJob {
                remaining_polls: self.resolve_after,
                outcome,
            },
        );
        Ok(id)
    }

    pub fn progress(&mut self, simulation_id: &str) -> Result<SimulationProgress, BrainError> {
        if self.evict_next > 0 {
            self.evict_next -= 1;
            self.simulations.remove(simulation_id);
            return Err(BrainError::JobEvicted {
                location: simulation_id.to_string(),
            });
        }

        let job = self
            .simulations
            .get_mut(simulation_id)
            .ok_or_else(|| BrainError::UnknownSimulation {
                id: simulation_id.to_string(),
            })?;
        if job.remaining_polls > 0 {
            job.remaining_polls -= 1;
            return Ok(SimulationProgress::Pending);
        }
        Ok(match &job.outcome {
            JobOutcome::Alpha(alpha) => SimulationProgress::Alpha(alpha.clone()),
            JobOutcome::Children(children) => SimulationProgress::Children(children.clone()),
        })
    }

    pub fn alpha(&mut self, alpha_id: &str) -> Result<Option<AlphaDetail>, BrainError> {
        let alpha = self
            .alphas
            .get_mut(alpha_id)
            .ok_or_else(|| BrainError::UnknownAlpha {
                id: alpha_id.to_string(),
            })?;
        if self.stale_expressions.contains(&alpha.detail.regular.code) {
            return Ok(None);
        }
        if alpha.metrics_lag > 0 {
            alpha.metrics_lag -= 1;
            return Ok(None);
        }
        Ok(Some(alpha.detail.clone()))
    }

    pub fn set_correlation(
        &mut self,
        alpha_id: &str,
        kind: CorrelationKind,
        value: CorrelationResponse,
        lag: u32,
    ) -> Result<(), BrainError> {
        let alpha = self
            .alphas
            .get_mut(alpha_id)
            .ok_or_else(|| BrainError::UnknownAlpha {
                id: alpha_id.to_string(),
            })?;
        alpha.correlations.insert(kind, (value, lag));
        Ok(())
    }

    pub fn correlation(
        &mut self,
        alpha_id: &str,
        kind: CorrelationKind,
    ) -> Result<Option<CorrelationResponse>, BrainError> {
        let alpha = self
            .alphas
            .get_mut(alpha_id)
            .ok_or_else(|| BrainError::UnknownAlpha {
                id: alpha_id.to_string(),
            })?;
        match alpha.correlations.get_mut(&kind) {
            Some((_, lag)) if *lag > 0 => {
                *lag -= 1;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(*value)),
            None => Ok(None),
        }
    }

    pub fn update_alpha(
        &mut self,
        alpha_id: &str,
        properties: &AlphaProperties,
    ) -> Result<(), BrainError> {
        let alpha = self
            .alphas
            .get_mut(alpha_id)
            .ok_or_else(|| BrainError::UnknownAlpha {
                id: alpha_id.to_string(),
            })?;
        let current = &mut alpha.properties;
        if properties.name.is_some() {
            current.name.clone_from(&properties.name);
        }
        if properties.color.is_some() {
            current.color.clone_from(&properties.color);
        }
        if properties.tags.is_some() {
            current.tags.clone_from(&properties.tags);
        }
        if properties.category.is_some() {
            current.category.clone_from(&properties.category);
        }
        if properties.regular.is_some() {
            current.regular.clone_from(&properties.regular);
        }
        Ok(())
    }

    /// Status code the service answers a submission with: 201 on acceptance, 403 when the alpha
    /// fails the submission checks or was already submitted, 404 when it does not exist.
    pub fn submit_alpha(&mut self, alpha_id: &str) -> u16 {
        match self.alphas.get_mut(alpha_id) {
            None => 404,
            Some(alpha) if alpha.submitted => 403,
            Some(alpha) => {
                let is = &alpha.detail.in_sample;
                if is.sharpe >= 1.25 && is.fitness >= 1.0 {
                    alpha.submitted = true;
                    201
                } else {
                    403
                }
            }
        }
    }
}

pub mod server {
    use actix_web::http::header;
    use actix_web::{get, patch, post, web, HttpRequest, HttpResponse};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::Deserialize;

    use super::{
        AlphaProperties, BrainError, BrainState, CorrelationKind, LoginOutcome, ProgressResponse,
        SimulationBody, StepUpStatus, STEP_UP_CHALLENGE,
    };

    fn basic_credentials(req: &HttpRequest) -> Option<(String, String)> {
        let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
        let (email, password) = decoded.split_once(':')?;
        Some((email.to_string(), password.to_string()))
    }

    #[post("/authentication")]
    pub async fn login(app: web::Data<BrainState>, req: HttpRequest) -> HttpResponse {
        let Some((email, password)) = basic_credentials(&req) else {
            return HttpResponse::Unauthorized()
                .insert_header((header::WWW_AUTHENTICATE, "Basic"))
                .finish();
        };
        let outcome = app.lock().unwrap().login(&email, &password);
        match outcome {
            LoginOutcome::Authorized => HttpResponse::Created().json(serde_json::json!({
                "user": { "id": email }
            })),
            LoginOutcome::StepUp { location } => HttpResponse::Unauthorized()
                .insert_header((header::WWW_AUTHENTICATE, STEP_UP_CHALLENGE))
                .insert_header((header::LOCATION, location))
                .finish(),
            LoginOutcome::Rejected => HttpResponse::Unauthorized()
                .insert_header((header::WWW_AUTHENTICATE, "Basic"))
                .finish(),
        }
    }

    #[get("/authentication")]
    pub async fn auth_status(app: web::Data<BrainState>) -> HttpResponse {
        match app.lock().unwrap().auth_status() {
            StepUpStatus::Authorized => HttpResponse::Ok().json(serde_json::json!({})),
            _ => HttpResponse::NoContent().finish(),
        }
    }

    #[post("/authentication/persona")]
    pub async fn confirm_step_up(app: web::Data<BrainState>) -> HttpResponse {
        app.lock().unwrap().confirm_step_up();
        HttpResponse::Ok().finish()
    }

    #[derive(Debug, Deserialize)]
    pub struct FieldsParams {
        #[serde(rename = "dataset.id")]
        pub dataset_id: String,
        pub limit: usize,
        #[serde(default)]
        pub offset: usize,
        #[serde(default)]
        pub search: Option<String>,
    }

    #[get("/data-fields")]
    pub async fn data_fields(
        app: web::Data<BrainState>,
        params: web::Query<FieldsParams>,
    ) -> HttpResponse {
        let search = params.search.as_deref().filter(|s| !s.is_empty());
        let page =
            app.lock()
                .unwrap()
                .fields_page(&params.dataset_id, search, params.limit, params.offset);
        HttpResponse::Ok().json(page)
    }

    #[get("/operators")]
    pub async fn operators(app: web::Data<BrainState>) -> HttpResponse {
        HttpResponse::Ok().json(&app.lock().unwrap().operators)
    }

    #[post("/simulations")]
    pub async fn create_simulation(
        app: web::Data<BrainState>,
        body: web::Json<SimulationBody>,
    ) -> Result<HttpResponse, BrainError> {
        let id = app.lock().unwrap().create_simulation(&body)?;
        Ok(HttpResponse::Created()
            .insert_header((header::LOCATION, format!("/simulations/{id}")))
            .finish())
    }

    #[get("/simulations/{simulation_id}")]
    pub async fn simulation_progress(
        app: web::Data<BrainState>,
        path: web::Path<(String,)>,
    ) -> Result<HttpResponse, BrainError> {
        let (simulation_id,) = path.into_inner();
        let progress = app.lock().unwrap().progress(&simulation_id)?;
        let body = ProgressResponse::from(&progress);
        if body.progress.is_some() {
            return Ok(HttpResponse::Ok()
                .insert_header((header::RETRY_AFTER, "1"))
                .json(body));
        }
        Ok(HttpResponse::Ok().json(body))
    }

    #[get("/alphas/{alpha_id}")]
    pub async fn alpha(
        app: web::Data<BrainState>,
        path: web::Path<(String,)>,
    ) -> Result<HttpResponse, BrainError> {
        let (alpha_id,) = path.into_inner();
        match app.lock().unwrap().alpha(&alpha_id)? {
            Some(detail) => Ok(HttpResponse::Ok().json(detail)),
            None => Ok(HttpResponse::Ok().json(serde_json::json!({}))),
        }
    }

    #[get("/alphas/{alpha_id}/correlations/{kind}")]
    pub async fn correlation(
        app: web::Data<BrainState>,
        path: web::Path<(String, CorrelationKind)>,
    ) -> Result<HttpResponse, BrainError> {
        let (alpha_id, kind) = path.into_inner();
        match app.lock().unwrap().correlation(&alpha_id, kind)? {
            Some(value) => Ok(HttpResponse::Ok().json(value)),
            None => Ok(HttpResponse::Ok()
                .insert_header((header::RETRY_AFTER, "1"))
                .finish()),
        }
    }

    #[patch("/alphas/{alpha_id}/")]
    pub async fn update_alpha(
        app: web::Data<BrainState>,
        path: web::Path<(String,)>,
        properties: web::Json<AlphaProperties>,
    ) -> Result<HttpResponse, BrainError> {
        let (alpha_id,) = path.into_inner();
        app.lock().unwrap().update_alpha(&alpha_id, &properties)?;
        Ok(HttpResponse::Ok().finish())
    }

    #[post("/alphas/{alpha_id}/submit")]
    pub async fn submit_alpha(
        app: web::Data<BrainState>,
        path: web::Path<(String,)>,
    ) -> HttpResponse {
        let (alpha_id,) = path.into_inner();
        let status = app.lock().unwrap().submit_alpha(&alpha_id);
        HttpResponse::build(
            actix_web::http::StatusCode::from_u16(status)
                .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR),
        )
        .finish()
    }

    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.service(login)
            .service(auth_status)
            .service(confirm_step_up)
            .service(data_fields)
            .service(operators)
            .service(create_simulation)
            .service(simulation_progress)
            .service(alpha)
            .service(correlation)
            .service(update_alpha)
            .service(submit_alpha);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AppState, BrainError, CorrelationKind, CorrelationResponse, LoginOutcome, SimulationBody,
        SimulationProgress, StepUpStatus,
    };
    use crate::settings::SimulationSettings;

    fn batch(n: usize) -> SimulationBody {
        let expressions: Vec<String> = (0..n).map(|i| format!("rank(close * {i})")).collect();
        SimulationBody::batch(&expressions, &SimulationSettings::default())
    }

    #[test]
    fn test_that_simulation_resolves_after_configured_polls() {
        let mut state = AppState::new();
        state.resolve_after = 2;
        let id = state.create_simulation(&batch(3)).unwrap();

        assert_eq!(state.progress(&id).unwrap(), SimulationProgress::Pending);
        assert_eq!(state.progress(&id).unwrap(), SimulationProgress::Pending);
        match state.progress(&id).unwrap() {
            SimulationProgress::Children(children) => {
                assert_eq!(children.len(), 3);
                for child in children {
                    assert!(matches!(
                        state.progress(&child).unwrap(),
                        SimulationProgress::Alpha(_)
                    ));
                }
            }
            other => panic!("expected children, got {other:?}"),
        }
    }

    #[test]
    fn test_that_oversized_batch_is_rejected() {
        let mut state = AppState::new();
        assert!(matches!(
            state.create_simulation(&batch(11)),
            Err(BrainError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_that_evicted_simulation_cannot_be_polled_again() {
        let mut state = AppState::new();
        let id = state.create_simulation(&batch(1)).unwrap();
        state.evict_next = 1;

        assert!(matches!(
            state.progress(&id),
            Err(BrainError::JobEvicted { .. })
        ));
        assert!(matches!(
            state.progress(&id),
            Err(BrainError::UnknownSimulation { .. })
        ));
    }

    #[test]
    fn test_that_step_up_is_required_until_confirmed() {
        let mut state = AppState::new();
        state.add_account("a@b.c", "pw");
        state.step_up_required = true;
        state.step_up_failures = 1;

        assert!(matches!(
            state.login("a@b.c", "pw"),
            LoginOutcome::StepUp { .. }
        ));
        state.confirm_step_up();
        assert_eq!(state.auth_status(), StepUpStatus::Failed);
        state.confirm_step_up();
        assert_eq!(state.auth_status(), StepUpStatus::Authorized);
        assert_eq!(state.login("a@b.c", "pw"), LoginOutcome::Authorized);
        assert_eq!(state.login("a@b.c", "wrong"), LoginOutcome::Rejected);
    }

    #[test]
    fn test_that_correlation_is_empty_for_its_lag() {
        let mut state = AppState::new();
        let id = state.create_simulation(&batch(1)).unwrap();
        let SimulationProgress::Children(children) = state.progress(&id).unwrap() else {
            panic!("expected children");
        };
        let SimulationProgress::Alpha(alpha) = state.progress(&children[0]).unwrap() else {
            panic!("expected alpha");
        };

        let value = CorrelationResponse { max: 0.8, min: -0.1 };
        state
            .set_correlation(&alpha, CorrelationKind::Prod, value, 2)
            .unwrap();
        assert_eq!(state.correlation(&alpha, CorrelationKind::Prod).unwrap(), None);
        assert_eq!(state.correlation(&alpha, CorrelationKind::Prod).unwrap(), None);
        assert_eq!(
            state.correlation(&alpha, CorrelationKind::Prod).unwrap(),
            Some(value)
        );
    }

    #[test]
    fn test_that_fields_are_paged_by_offset() {
        let mut state = AppState::demo();
        let first = state.fields_page("fundamental6", None, 50, 0);
        let last = state.fields_page("fundamental6", None, 50, 100);

        assert_eq!(first.count, 120);
        assert_eq!(first.results.len(), 50);
        assert_eq!(last.results.len(), 20);
        assert_eq!(last.results[0].id, "fnd6_field_100");
    }
}
