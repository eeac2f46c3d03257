//! Retrying operations on top of a [Client].
//!
//! Every operation has a bounded attempt budget. A budget of `r` means at most `r` attempts; a
//! budget of zero or less makes no attempt at all. Running out is logged as a warning and comes
//! back as `None`, so callers skip that unit of work instead of failing.
//!
//! Polling a running simulation is not an attempt: while the service says the job is still
//! running the poll sleeps for a random interval and asks again, for as long as it takes. Losing
//! the job while polling, or having the submission refused, costs one attempt and resubmits the
//! whole request after one poll interval.
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rand::thread_rng;
use rand_distr::{Distribution, Uniform};

use crate::http::brain::{
    AlphaId, AlphaProperties, BrainError, Client, CorrelationKind, FieldQuery, LoginOutcome,
    Operator, SimulationBody, SimulationProgress, SimulationRequest, StepUpStatus,
    MAX_FIELDS_PAGE,
};
use crate::settings::{Credentials, RetryBudget, RunnerConfig, SimulationSettings};
use crate::sink::ResultRecord;

/// Field id to description.
pub type FieldCatalog = BTreeMap<String, String>;

/// Outcome of one attempt inside [with_retries].
pub enum Attempt<T> {
    Done(T),
    Retry(String),
    /// Give up without spending the rest of the budget.
    Abort,
}

/// Calls `attempt` until it is done, aborts, or `budget` attempts have been made.
pub fn with_retries<T>(
    budget: i32,
    operation: &str,
    mut attempt: impl FnMut() -> Attempt<T>,
) -> Option<T> {
    let mut remaining = budget;
    while remaining > 0 {
        match attempt() {
            Attempt::Done(value) => return Some(value),
            Attempt::Abort => return None,
            Attempt::Retry(reason) => {
                remaining -= 1;
                info!("{operation} failed: {reason}. {remaining} attempts remaining.");
            }
        }
    }
    warn!("{budget} attempts exceeded. Stop retrying {operation}.");
    None
}

/// Authenticated handle to the service, shared read-only by every worker.
pub struct Session<C: Client> {
    client: C,
    retries: RetryBudget,
    poll_interval: (Duration, Duration),
}

impl<C: Client> Session<C> {
    /// Wraps a client that is already authenticated, for example one carrying a provisioned
    /// session cookie.
    pub fn new(client: C, config: &RunnerConfig) -> Self {
        Self {
            client,
            retries: config.retries,
            poll_interval: config.poll_interval,
        }
    }

    /// Logs in. When the service asks for step-up authentication `confirm` is called with the
    /// location to visit and is expected to block until a human has done so. Wrong credentials
    /// return `None` immediately.
    pub fn authenticate(
        client: C,
        credentials: &Credentials,
        config: &RunnerConfig,
        mut confirm: impl FnMut(&str),
    ) -> Option<Self> {
        let authorized = with_retries(config.retries.login, "logging in", || {
            match client.login(credentials) {
                Ok(LoginOutcome::Authorized) => Attempt::Done(()),
                Ok(LoginOutcome::Rejected) => {
                    warn!("Wrong username or password.");
                    Attempt::Abort
                }
                Ok(LoginOutcome::StepUp { location }) => {
                    confirm(&location);
                    match client.complete_step_up(&location) {
                        Ok(StepUpStatus::Authorized) => Attempt::Done(()),
                        Ok(StepUpStatus::Failed) => {
                            Attempt::Retry("step-up authentication failed".to_string())
                        }
                        Ok(StepUpStatus::Unknown(status)) => {
                            Attempt::Retry(format!("step-up answered with status {status}"))
                        }
                        Err(e) => Attempt::Retry(e.to_string()),
                    }
                }
                Err(e) => Attempt::Retry(e.to_string()),
            }
        });
        authorized.map(|_| Self::new(client, config))
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn wait(&self) {
        let (low, high) = self.poll_interval;
        let pause = if high > low {
            Duration::from_secs_f64(
                Uniform::new(low.as_secs_f64(), high.as_secs_f64()).sample(&mut thread_rng()),
            )
        } else {
            low
        };
        thread::sleep(pause);
    }

    /// Pages through the catalog until the reported count is covered. The page size must be in
    /// `[1, 50]`, anything else is rejected before a request is made. A page that comes back
    /// without rows while the count says there should be some costs one attempt.
    pub fn fetch_field_catalog(&self, query: &FieldQuery) -> Option<FieldCatalog> {
        if query.limit == 0 || query.limit > MAX_FIELDS_PAGE {
            warn!("{}", BrainError::InvalidPageSize { limit: query.limit });
            return None;
        }

        let fetch_page = |offset: usize| {
            with_retries(self.retries.fetch, "fetching data fields", || {
                match self.client.fetch_fields_page(query, offset) {
                    Ok(page) if page.results.is_empty() && offset < page.count => {
                        Attempt::Retry(format!("empty page at offset {offset}"))
                    }
                    Ok(page) => Attempt::Done(page),
                    Err(e) => Attempt::Retry(e.to_string()),
                }
            })
        };

        let first = fetch_page(0)?;
        let count = first.count;
        let mut catalog = FieldCatalog::new();
        let mut fetched = first.results.len();
        catalog.extend(first.results.into_iter().map(|f| (f.id, f.description)));

        let mut offset = query.limit;
        while offset < count {
            let page = fetch_page(offset)?;
            if page.results.is_empty() {
                break;
            }
            fetched += page.results.len();
            catalog.extend(page.results.into_iter().map(|f| (f.id, f.description)));
            offset += query.limit;
        }

        if catalog.len() != count {
            warn!(
                "Dataset {} reported {count} fields, collected {} from {fetched} rows",
                query.dataset_id,
                catalog.len()
            );
        }
        Some(catalog)
    }

    pub fn fetch_operators(&self) -> Option<Vec<Operator>> {
        with_retries(self.retries.fetch, "fetching operators", || {
            match self.client.fetch_operators() {
                Ok(operators) => Attempt::Done(operators),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
    }

    /// Every submission after the first waits one poll interval, so a rate-limited or lost
    /// request is not resent straight away.
    fn pause_before(&self, resubmit: &mut bool) {
        if *resubmit {
            self.wait();
        }
        *resubmit = true;
    }

    /// Polls `location` until the simulation resolves. `Err` means the job was lost and the
    /// request has to be resubmitted.
    fn poll(&self, location: &str) -> anyhow::Result<SimulationProgress> {
        loop {
            match self.client.simulation_progress(location)? {
                SimulationProgress::Pending => {
                    debug!("Simulation at {location} still running");
                    self.wait();
                }
                resolved => return Ok(resolved),
            }
        }
    }

    /// Simulates one expression and returns the resulting alpha id.
    pub fn simulate(&self, expression: &str, settings: &SimulationSettings) -> Option<AlphaId> {
        let body = SimulationBody::Single(SimulationRequest::regular(expression, settings));
        let mut resubmit = false;
        with_retries(self.retries.simulation, "simulating alpha", || {
            self.pause_before(&mut resubmit);
            let location = match self.client.create_simulation(&body) {
                Ok(location) => location,
                Err(e) => return Attempt::Retry(e.to_string()),
            };
            match self.poll(&location) {
                Ok(SimulationProgress::Alpha(alpha)) => Attempt::Done(alpha),
                Ok(other) => Attempt::Retry(format!("unexpected progress {other:?}")),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
    }

    /// Simulates a batch as one multi-simulation and returns the alpha id of each child in the
    /// order the service lists them.
    pub fn multi_simulate(
        &self,
        expressions: &[String],
        settings: &SimulationSettings,
    ) -> Option<Vec<AlphaId>> {
        if expressions.is_empty() {
            warn!("Refusing to submit an empty multi-simulation");
            return None;
        }
        let body = SimulationBody::batch(expressions, settings);
        let mut resubmit = false;
        with_retries(self.retries.simulation, "multi-simulating alphas", || {
            self.pause_before(&mut resubmit);
            let location = match self.client.create_simulation(&body) {
                Ok(location) => location,
                Err(e) => return Attempt::Retry(e.to_string()),
            };
            match self.resolve_children(&location) {
                Ok(alphas) => Attempt::Done(alphas),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
    }

    fn resolve_children(&self, location: &str) -> anyhow::Result<Vec<AlphaId>> {
        'poll: loop {
            let children = match self.poll(location)? {
                SimulationProgress::Children(children) => children,
                SimulationProgress::Alpha(alpha) => return Ok(vec![alpha]),
                SimulationProgress::Pending => continue,
            };

            let mut alphas = Vec::with_capacity(children.len());
            for child in &children {
                match self.client.child_progress(child)? {
                    SimulationProgress::Alpha(alpha) => alphas.push(alpha),
                    _ => {
                        debug!("Child simulation {child} not resolved yet");
                        self.wait();
                        continue 'poll;
                    }
                }
            }
            return Ok(alphas);
        }
    }

    /// In-sample metrics of an alpha as a result row. An empty answer means the metrics are not
    /// ready and costs one attempt.
    pub fn alpha_result(&self, alpha_id: &str) -> Option<ResultRecord> {
        let operation = format!("getting IS result of alpha {alpha_id}");
        with_retries(self.retries.fetch, &operation, || {
            match self.client.fetch_alpha(alpha_id) {
                Ok(Some(detail)) => Attempt::Done(ResultRecord::from(&detail)),
                Ok(None) => Attempt::Retry("empty response".to_string()),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
    }

    /// `[max, min]` correlation of an alpha against the given pool.
    pub fn correlation(&self, alpha_id: &str, kind: CorrelationKind) -> Option<[f64; 2]> {
        let operation = format!("getting {} correlation of alpha {alpha_id}", kind.as_path());
        with_retries(self.retries.correlation, &operation, || {
            match self.client.fetch_correlation(alpha_id, kind) {
                Ok(Some(value)) => Attempt::Done([value.max, value.min]),
                Ok(None) => Attempt::Retry("empty response".to_string()),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
    }

    /// Single best-effort update, the status code is returned as is.
    pub fn update_properties(&self, alpha_id: &str, properties: &AlphaProperties) -> Option<u16> {
        match self.client.update_alpha(alpha_id, properties) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Updating alpha {alpha_id} failed: {e}");
                None
            }
        }
    }

    /// Submits an alpha for promotion. The service answers 201 when the submission is accepted;
    /// any other status is a refusal.
    pub fn submit(&self, alpha_id: &str) -> Option<u16> {
        match self.client.submit_alpha(alpha_id) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Submitting alpha {alpha_id} failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{with_retries, Attempt, Session};
    use crate::client::brain::LocalClient;
    use crate::http::brain::{
        AppState, CorrelationKind, CorrelationResponse, DataField, FieldQuery,
    };
    use crate::settings::{Credentials, RunnerConfig, SimulationSettings};

    fn config() -> RunnerConfig {
        RunnerConfig {
            poll_interval: (Duration::from_millis(1), Duration::from_millis(2)),
            ..RunnerConfig::default()
        }
    }

    fn session(state: AppState) -> Session<LocalClient> {
        Session::new(LocalClient::new(state), &config())
    }

    fn simulated_alpha(session: &Session<LocalClient>) -> String {
        session
            .simulate("rank(-close)", &SimulationSettings::default())
            .unwrap()
    }

    #[test]
    fn test_that_failing_attempts_spend_the_whole_budget() {
        for budget in 1..6 {
            let mut attempts = 0;
            let result: Option<()> = with_retries(budget, "testing", || {
                attempts += 1;
                Attempt::Retry("always".to_string())
            });
            assert!(result.is_none());
            assert_eq!(attempts, budget);
        }
    }

    #[test]
    fn test_that_non_positive_budget_makes_no_attempt() {
        for budget in [0, -1, -10] {
            let mut attempts = 0;
            let result = with_retries(budget, "testing", || {
                attempts += 1;
                Attempt::Done(())
            });
            assert!(result.is_none());
            assert_eq!(attempts, 0);
        }
    }

    #[test]
    fn test_that_wrong_credentials_are_not_retried() {
        let mut state = AppState::new();
        state.add_account("a@b.c", "pw");
        let client = LocalClient::new(state);
        let calls = client.calls();

        let credentials = Credentials::new("a@b.c", "wrong");
        let session = Session::authenticate(client, &credentials, &config(), |_| {});

        assert!(session.is_none());
        assert_eq!(calls.get("login"), 1);
        assert_eq!(calls.get("complete_step_up"), 0);
    }

    #[test]
    fn test_that_step_up_is_confirmed_and_retried() {
        let mut state = AppState::new();
        state.add_account("a@b.c", "pw");
        state.step_up_required = true;
        state.step_up_failures = 1;

        let mut prompts = Vec::new();
        let session = Session::authenticate(
            LocalClient::new(state),
            &Credentials::new("a@b.c", "pw"),
            &config(),
            |location| prompts.push(location.to_string()),
        );

        assert!(session.is_some());
        assert_eq!(prompts.len(), 2);
    }

    #[test]
    fn test_that_step_up_gives_up_after_budget() {
        let mut state = AppState::new();
        state.add_account("a@b.c", "pw");
        state.step_up_required = true;
        state.step_up_failures = 10;
        let client = LocalClient::new(state);
        let calls = client.calls();

        let session =
            Session::authenticate(client, &Credentials::new("a@b.c", "pw"), &config(), |_| {});
        assert!(session.is_none());
        assert_eq!(calls.get("complete_step_up"), 3);
    }

    #[test]
    fn test_that_catalog_covers_reported_count_for_every_page_size() {
        let mut state = AppState::new();
        state.add_dataset(
            "pv1",
            (0..137)
                .map(|i| DataField {
                    id: format!("pv1_{i}"),
                    description: format!("field {i}"),
                })
                .collect(),
        );
        let session = session(state);

        for limit in 1..=50 {
            let mut query = FieldQuery::new("pv1", "USA", "MATRIX", "TOP3000", 1);
            query.limit = limit;
            let catalog = session.fetch_field_catalog(&query).unwrap();
            assert_eq!(catalog.len(), 137, "page size {limit}");
        }
    }

    #[test]
    fn test_that_invalid_page_size_makes_no_request() {
        let session = session(AppState::demo());
        for limit in [0, 51, 100] {
            let mut query = FieldQuery::new("fundamental6", "USA", "MATRIX", "TOP3000", 1);
            query.limit = limit;
            assert!(session.fetch_field_catalog(&query).is_none());
        }
        assert_eq!(session.client().calls().get("fetch_fields_page"), 0);
    }

    #[test]
    fn test_that_empty_page_is_requested_again() {
        let mut state = AppState::demo();
        state.empty_pages.insert(50, 1);
        let session = session(state);

        let query = FieldQuery::new("fundamental6", "USA", "MATRIX", "TOP3000", 1);
        let catalog = session.fetch_field_catalog(&query).unwrap();
        assert_eq!(catalog.len(), 120);
        assert_eq!(session.client().calls().get("fetch_fields_page"), 4);
    }

    #[test]
    fn test_that_persistently_empty_page_gives_up() {
        let mut state = AppState::demo();
        state.empty_pages.insert(100, 3);
        let session = session(state);

        let query = FieldQuery::new("fundamental6", "USA", "MATRIX", "TOP3000", 1);
        assert!(session.fetch_field_catalog(&query).is_none());
        assert_eq!(session.client().calls().get("fetch_fields_page"), 2 + 3);
    }

    #[test]
    fn test_that_rejected_submission_waits_before_resubmitting() {
        let mut state = AppState::new();
        state.reject_submissions = 2;
        let config = RunnerConfig {
            poll_interval: (Duration::from_millis(20), Duration::from_millis(25)),
            ..RunnerConfig::default()
        };
        let session = Session::new(LocalClient::new(state), &config);

        let start = Instant::now();
        assert!(session
            .simulate("rank(close)", &SimulationSettings::default())
            .is_some());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(session.client().calls().get("create_simulation"), 3);
    }

    #[test]
    fn test_that_rate_limited_batch_is_dropped_after_budget() {
        let mut state = AppState::new();
        state.reject_submissions = 10;
        let session = session(state);

        let expressions = vec!["rank(close)".to_string()];
        let start = Instant::now();
        assert!(session
            .multi_simulate(&expressions, &SimulationSettings::default())
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(2));
        assert_eq!(session.client().calls().get("create_simulation"), 3);
    }

    #[test]
    fn test_that_pending_polls_do_not_spend_the_budget() {
        let mut state = AppState::new();
        state.resolve_after = 5;
        let mut config = config();
        config.retries.simulation = 1;
        let session = Session::new(LocalClient::new(state), &config);

        let alpha = simulated_alpha(&session);
        assert!(session.client().state().alphas.contains_key(&alpha));
        assert_eq!(session.client().calls().get("simulation_progress"), 6);
        assert_eq!(session.client().calls().get("create_simulation"), 1);
    }

    #[test]
    fn test_that_evicted_simulation_is_resubmitted() {
        let mut state = AppState::new();
        state.evict_next = 2;
        let session = session(state);

        let expressions = vec!["rank(close)".to_string(), "rank(open)".to_string()];
        let alphas = session
            .multi_simulate(&expressions, &SimulationSettings::default())
            .unwrap();
        assert_eq!(alphas.len(), 2);
        assert_eq!(session.client().calls().get("create_simulation"), 3);
    }

    #[test]
    fn test_that_eviction_beyond_budget_returns_none() {
        let mut state = AppState::new();
        state.evict_next = 3;
        let session = session(state);

        let expressions = vec!["rank(close)".to_string()];
        assert!(session
            .multi_simulate(&expressions, &SimulationSettings::default())
            .is_none());
        assert_eq!(session.client().calls().get("create_simulation"), 3);
    }

    #[test]
    fn test_that_children_resolve_in_service_order() {
        let mut state = AppState::new();
        state.resolve_after = 1;
        let session = session(state);

        let expressions: Vec<String> = (0..4).map(|i| format!("ts_rank(close, {i})")).collect();
        let alphas = session
            .multi_simulate(&expressions, &SimulationSettings::default())
            .unwrap();

        let state = session.client().state();
        let codes: Vec<String> = alphas
            .iter()
            .map(|a| state.alphas[a].detail.regular.code.clone())
            .collect();
        assert_eq!(codes, expressions);
    }

    #[test]
    fn test_that_metrics_are_retried_while_empty() {
        let mut state = AppState::new();
        state.metrics_lag = 2;
        let session = session(state);

        let alpha = simulated_alpha(&session);
        assert!(session.alpha_result(&alpha).is_some());
        assert_eq!(session.client().calls().get("fetch_alpha"), 3);
    }

    #[test]
    fn test_that_correlation_arrives_on_last_attempt() {
        let session = session(AppState::new());
        let alpha = simulated_alpha(&session);
        session
            .client()
            .state()
            .set_correlation(
                &alpha,
                CorrelationKind::Prod,
                CorrelationResponse { max: 0.8, min: -0.1 },
                19,
            )
            .unwrap();

        assert_eq!(
            session.correlation(&alpha, CorrelationKind::Prod),
            Some([0.8, -0.1])
        );
        assert_eq!(session.client().calls().get("fetch_correlation"), 20);
    }

    #[test]
    fn test_that_correlation_one_past_budget_is_none() {
        let session = session(AppState::new());
        let alpha = simulated_alpha(&session);
        session
            .client()
            .state()
            .set_correlation(
                &alpha,
                CorrelationKind::Own,
                CorrelationResponse { max: 0.8, min: -0.1 },
                20,
            )
            .unwrap();

        assert_eq!(session.correlation(&alpha, CorrelationKind::Own), None);
        assert_eq!(session.client().calls().get("fetch_correlation"), 20);
    }

    #[test]
    fn test_that_submission_status_is_passed_through() {
        let session = session(AppState::new());
        let alpha = simulated_alpha(&session);
        {
            let mut state = session.client().state();
            let is = &mut state.alphas.get_mut(&alpha).unwrap().detail.in_sample;
            is.sharpe = 2.0;
            is.fitness = 1.5;
        }

        assert_eq!(session.submit(&alpha), Some(201));
        assert_eq!(session.submit(&alpha), Some(403));
        assert_eq!(session.submit("missing"), Some(404));
    }
}
