use std::env;
use std::io::{self, BufRead, Write};

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use time::macros::format_description;
use time::OffsetDateTime;

use brainrun::client::brain::HttpClient;
use brainrun::http::brain::BrainError;
use brainrun::input::replay::ExpressionReader;
use brainrun::input::template::TemplateDefinition;
use brainrun::pipeline::Pipeline;
use brainrun::session::Session;
use brainrun::settings::{Credentials, RunnerConfig, SimulationSettings};
use brainrun::sink::ResultSink;

const USAGE: &str = "usage:
  brain_runner generate <definition.json> <alphas file>
  brain_runner simulate <alphas file> [results file]";

fn confirm_step_up(location: &str) {
    println!("Complete biometric authentication at {location} and press enter");
    if let Err(e) = io::stdout().flush() {
        warn!("Could not show step-up prompt: {e}");
    }
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        warn!("Could not read confirmation: {e}");
    }
}

fn results_file() -> Result<String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    Ok(format!("results_{stamp}.csv"))
}

fn login(config: &RunnerConfig) -> Result<Session<HttpClient>> {
    let credentials = Credentials::from_env()?;
    let client = HttpClient::new(config.base_url.as_str())?;
    Session::authenticate(client, &credentials, config, confirm_step_up)
        .ok_or_else(|| anyhow!(BrainError::Unauthorized))
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config = RunnerConfig::from_env();

    match args.get(1).map(String::as_str) {
        Some("generate") if args.len() == 4 => {
            let definition = TemplateDefinition::from_file(&args[2])?;
            let session = login(&config)?;
            let template = definition.resolve(&session)?;
            template.generate_to_file(&args[3], definition.amount, config.delimiter)?;
        }
        Some("simulate") if args.len() == 3 || args.len() == 4 => {
            let output = match args.get(3) {
                Some(path) => path.clone(),
                None => results_file()?,
            };
            let source = ExpressionReader::open(&args[2], config.delimiter)?;
            let sink = ResultSink::new(&output, config.delimiter)?;

            let session = login(&config)?;
            let pipeline = Pipeline::new(&session, SimulationSettings::default(), &config);
            let report = pipeline.run(source, &sink);
            info!("Results saved to {output}: {report:?}");
        }
        _ => bail!(USAGE),
    }
    Ok(())
}
