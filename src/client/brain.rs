use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use log::debug;
use reqwest::blocking;
use reqwest::header::{LOCATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::http::brain::{
    AlphaDetail, AlphaProperties, AppState, BrainError, Client, CorrelationKind,
    CorrelationResponse, FieldQuery, FieldsPage, LoginOutcome, Operator, ProgressResponse,
    SimulationBody, SimulationId, SimulationProgress, StepUpStatus, STEP_UP_CHALLENGE,
};
use crate::settings::Credentials;

/// Parses a body that the service leaves empty, or sends as `{}`, while a result is not ready.
fn empty_or<T: DeserializeOwned>(text: &str) -> Result<Option<T>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.as_object().is_some_and(|fields| fields.is_empty()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Client for the remote service. The cookie store keeps the authenticated session, and
/// `reqwest::blocking::Client` is safe to share between worker threads.
#[derive(Debug)]
pub struct HttpClient {
    pub path: String,
    pub client: blocking::Client,
}

impl HttpClient {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let client = blocking::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            path: path.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// The service hands out absolute locations, the local server relative ones.
    fn url(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            self.path.clone() + location
        }
    }

    fn progress_at(&self, location: &str) -> Result<SimulationProgress> {
        let resp = self.client.get(location).send()?;
        if !resp.status().is_success() {
            return Err(BrainError::JobEvicted {
                location: location.to_string(),
            }
            .into());
        }
        let progress: Option<ProgressResponse> = empty_or(&resp.text()?)?;
        Ok(progress
            .map(SimulationProgress::from)
            .unwrap_or(SimulationProgress::Pending))
    }
}

impl Client for HttpClient {
    fn login(&self, credentials: &Credentials) -> Result<LoginOutcome> {
        let resp = self
            .client
            .post(self.path.clone() + "/authentication")
            .basic_auth(&credentials.email, Some(&credentials.password))
            .send()?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok());
            if challenge == Some(STEP_UP_CHALLENGE) {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(BrainError::MissingLocation)?;
                return Ok(LoginOutcome::StepUp {
                    location: self.url(location),
                });
            }
            return Ok(LoginOutcome::Rejected);
        }

        if resp.status().is_success() {
            Ok(LoginOutcome::Authorized)
        } else {
            Err(BrainError::UnexpectedStatus {
                status: resp.status().as_u16(),
            }
            .into())
        }
    }

    fn complete_step_up(&self, location: &str) -> Result<StepUpStatus> {
        self.client.post(self.url(location)).send()?;
        let resp = self
            .client
            .get(self.path.clone() + "/authentication")
            .send()?;
        Ok(match resp.status() {
            StatusCode::NO_CONTENT => StepUpStatus::Failed,
            StatusCode::OK => StepUpStatus::Authorized,
            other => StepUpStatus::Unknown(other.as_u16()),
        })
    }

    fn fetch_fields_page(&self, query: &FieldQuery, offset: usize) -> Result<FieldsPage> {
        Ok(self
            .client
            .get(self.path.clone() + "/data-fields")
            .query(&query.params(offset))
            .send()?
            .error_for_status()?
            .json::<FieldsPage>()?)
    }

    fn fetch_operators(&self) -> Result<Vec<Operator>> {
        Ok(self
            .client
            .get(self.path.clone() + "/operators")
            .send()?
            .error_for_status()?
            .json::<Vec<Operator>>()?)
    }

    fn create_simulation(&self, body: &SimulationBody) -> Result<String> {
        let resp = self
            .client
            .post(self.path.clone() + "/simulations")
            .json(body)
            .send()?
            .error_for_status()?;
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(BrainError::MissingLocation)?;
        debug!("Simulation created at {location}");
        Ok(self.url(location))
    }

    fn simulation_progress(&self, location: &str) -> Result<SimulationProgress> {
        self.progress_at(&self.url(location))
    }

    fn child_progress(&self, child: &SimulationId) -> Result<SimulationProgress> {
        self.progress_at(&(self.path.clone() + format!("/simulations/{child}").as_str()))
    }

    fn fetch_alpha(&self, alpha_id: &str) -> Result<Option<AlphaDetail>> {
        let text = self
            .client
            .get(self.path.clone() + format!("/alphas/{alpha_id}").as_str())
            .send()?
            .error_for_status()?
            .text()?;
        empty_or(&text)
    }

    fn fetch_correlation(
        &self,
        alpha_id: &str,
        kind: CorrelationKind,
    ) -> Result<Option<CorrelationResponse>> {
        let text = self
            .client
            .get(
                self.path.clone()
                    + format!("/alphas/{alpha_id}/correlations/{}", kind.as_path()).as_str(),
            )
            .send()?
            .error_for_status()?
            .text()?;
        empty_or(&text)
    }

    fn update_alpha(&self, alpha_id: &str, properties: &AlphaProperties) -> Result<u16> {
        Ok(self
            .client
            .patch(self.path.clone() + format!("/alphas/{alpha_id}/").as_str())
            .json(properties)
            .send()?
            .status()
            .as_u16())
    }

    fn submit_alpha(&self, alpha_id: &str) -> Result<u16> {
        Ok(self
            .client
            .post(self.path.clone() + format!("/alphas/{alpha_id}/submit").as_str())
            .send()?
            .status()
            .as_u16())
    }
}

/// Shared count of calls per operation, readable after the client has been moved.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<Mutex<HashMap<&'static str, usize>>>);

impl CallCounter {
    pub fn get(&self, operation: &str) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, operation: &'static str) {
        *self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(operation)
            .or_insert(0) += 1;
    }
}

/// Runs against an in-process [AppState]. Counts every call so tests can assert on how often an
/// operation was attempted.
pub struct LocalClient {
    state: Mutex<AppState>,
    calls: CallCounter,
}

impl LocalClient {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: CallCounter::default(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> CallCounter {
        self.calls.clone()
    }

    fn record(&self, operation: &'static str) {
        self.calls.record(operation);
    }
}

fn simulation_id(location: &str) -> &str {
    location.rsplit('/').next().unwrap_or(location)
}

impl Client for LocalClient {
    fn login(&self, credentials: &Credentials) -> Result<LoginOutcome> {
        self.record("login");
        Ok(self.state().login(&credentials.email, &credentials.password))
    }

    fn complete_step_up(&self, _location: &str) -> Result<StepUpStatus> {
        self.record("complete_step_up");
        let mut state = self.state();
        state.confirm_step_up();
        Ok(state.auth_status())
    }

    fn fetch_fields_page(&self, query: &FieldQuery, offset: usize) -> Result<FieldsPage> {
        self.record("fetch_fields_page");
        Ok(self.state().fields_page(
            &query.dataset_id,
            query.search.as_deref(),
            query.limit,
            offset,
        ))
    }

    fn fetch_operators(&self) -> Result<Vec<Operator>> {
        self.record("fetch_operators");
        Ok(self.state().operators.clone())
    }

    fn create_simulation(&self, body: &SimulationBody) -> Result<String> {
        self.record("create_simulation");
        let id = self.state().create_simulation(body)?;
        Ok(format!("/simulations/{id}"))
    }

    fn simulation_progress(&self, location: &str) -> Result<SimulationProgress> {
        self.record("simulation_progress");
        Ok(self.state().progress(simulation_id(location))?)
    }

    fn child_progress(&self, child: &SimulationId) -> Result<SimulationProgress> {
        self.record("child_progress");
        Ok(self.state().progress(child)?)
    }

    fn fetch_alpha(&self, alpha_id: &str) -> Result<Option<AlphaDetail>> {
        self.record("fetch_alpha");
        Ok(self.state().alpha(alpha_id)?)
    }

    fn fetch_correlation(
        &self,
        alpha_id: &str,
        kind: CorrelationKind,
    ) -> Result<Option<CorrelationResponse>> {
        self.record("fetch_correlation");
        Ok(self.state().correlation(alpha_id, kind)?)
    }

    fn update_alpha(&self, alpha_id: &str, properties: &AlphaProperties) -> Result<u16> {
        self.record("update_alpha");
        match self.state().update_alpha(alpha_id, properties) {
            Ok(()) => Ok(200),
            Err(_) => Ok(404),
        }
    }

    fn submit_alpha(&self, alpha_id: &str) -> Result<u16> {
        self.record("submit_alpha");
        Ok(self.state().submit_alpha(alpha_id))
    }
}
