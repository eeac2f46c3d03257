use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::Result;
use log::info;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::Deserialize;

use crate::http::brain::{BrainError, Client, FieldQuery, Operator};
use crate::input::replay::write_expressions;
use crate::session::{FieldCatalog, Session};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VariableKind {
    Operators,
    DataFields,
    Number,
}

/// Values one placeholder can take.
#[derive(Clone, Debug)]
pub struct Variable {
    pub kind: VariableKind,
    pub values: Vec<String>,
}

/// Integral numbers are written without a fractional part, `5.0` becomes `5`.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

impl Variable {
    pub fn operators<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            kind: VariableKind::Operators,
            values: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Operators whose name contains `filter` and, if given, belong to `category`.
    pub fn from_operators(operators: &[Operator], filter: &str, category: Option<&str>) -> Self {
        let filter = filter.to_lowercase();
        let mut names: Vec<&str> = operators
            .iter()
            .filter(|op| op.name.to_lowercase().contains(&filter))
            .filter(|op| category.map_or(true, |c| op.category == c))
            .map(|op| op.name.as_str())
            .collect();
        names.sort_unstable();
        Self::operators(names)
    }

    pub fn data_fields(catalog: &FieldCatalog) -> Self {
        Self {
            kind: VariableKind::DataFields,
            values: catalog.keys().cloned().collect(),
        }
    }

    pub fn numbers(values: &[f64]) -> Self {
        Self {
            kind: VariableKind::Number,
            values: values.iter().map(|v| format_number(*v)).collect(),
        }
    }

    /// Parses a comma separated list such as `5, 10, 20`.
    pub fn parse_numbers(name: &str, text: &str) -> Result<Self, BrainError> {
        let values = text
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| BrainError::MalformedRequest {
                reason: format!("invalid numbers for {name}: {text}"),
            })?;
        if values.is_empty() {
            return Err(BrainError::EmptyVariable {
                name: name.to_string(),
            });
        }
        Ok(Self::numbers(&values))
    }
}

/// A string with `<name/>` placeholders, each bound to a [Variable].
#[derive(Clone, Debug)]
pub struct Template {
    template: String,
    placeholders: Vec<String>,
    variables: HashMap<String, Variable>,
}

impl Template {
    /// Fails if a placeholder has no variable or a variable has no values.
    pub fn new(
        template: impl Into<String>,
        variables: HashMap<String, Variable>,
    ) -> Result<Self, BrainError> {
        let template = template.into();
        let pattern = Regex::new(r"<(\w+)/>").map_err(|e| BrainError::MalformedRequest {
            reason: e.to_string(),
        })?;

        let mut placeholders: Vec<String> = Vec::new();
        for capture in pattern.captures_iter(&template) {
            let name = capture[1].to_string();
            if !placeholders.contains(&name) {
                placeholders.push(name);
            }
        }

        for name in &placeholders {
            match variables.get(name) {
                None => return Err(BrainError::UndefinedVariable { name: name.clone() }),
                Some(variable) if variable.values.is_empty() => {
                    return Err(BrainError::EmptyVariable { name: name.clone() })
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            template,
            placeholders,
            variables,
        })
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Draws one value per placeholder name, so repeated placeholders share a value. Double
    /// quotes are stripped from the result.
    pub fn instantiate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut expression = self.template.clone();
        for name in &self.placeholders {
            if let Some(value) = self
                .variables
                .get(name)
                .and_then(|variable| variable.values.choose(rng))
            {
                expression = expression.replace(&format!("<{name}/>"), value);
            }
        }
        expression.replace('"', "")
    }

    pub fn generate<R: Rng + ?Sized>(&self, amount: usize, rng: &mut R) -> Vec<String> {
        (0..amount).map(|_| self.instantiate(rng)).collect()
    }

    /// Generates `amount` expressions and appends them to `path`.
    pub fn generate_to_file(
        &self,
        path: impl AsRef<Path>,
        amount: usize,
        delimiter: char,
    ) -> Result<usize> {
        let expressions = self.generate(amount, &mut thread_rng());
        let written = write_expressions(path.as_ref(), &expressions, delimiter)?;
        info!(
            "Generated {written} alphas and saved to {}",
            path.as_ref().display()
        );
        Ok(written)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogQuery {
    pub dataset_id: String,
    #[serde(default = "CatalogQuery::default_region")]
    pub region: String,
    #[serde(rename = "type", default = "CatalogQuery::default_type")]
    pub data_type: String,
    #[serde(default = "CatalogQuery::default_universe")]
    pub universe: String,
    #[serde(default = "CatalogQuery::default_delay")]
    pub delay: u8,
    #[serde(default)]
    pub search: Option<String>,
}

impl CatalogQuery {
    fn default_region() -> String {
        "USA".to_string()
    }

    fn default_type() -> String {
        "VECTOR".to_string()
    }

    fn default_universe() -> String {
        "TOP3000".to_string()
    }

    fn default_delay() -> u8 {
        1
    }
}

impl From<&CatalogQuery> for FieldQuery {
    fn from(value: &CatalogQuery) -> Self {
        let mut query = FieldQuery::new(
            value.dataset_id.as_str(),
            value.region.as_str(),
            value.data_type.as_str(),
            value.universe.as_str(),
            value.delay,
        );
        query.search.clone_from(&value.search);
        query
    }
}

/// How a variable gets its values in a definition file. Explicit `values` win over anything that
/// would be fetched from the service.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VariableSpec {
    Operators {
        #[serde(default)]
        values: Option<Vec<String>>,
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        category: Option<String>,
    },
    Datafields {
        #[serde(default)]
        values: Option<Vec<String>>,
        #[serde(default)]
        query: Option<CatalogQuery>,
    },
    Number {
        values: Vec<f64>,
    },
}

/// JSON description of a template run:
///
/// ```json
/// {
///   "template": "<op/>(<field/>, <window/>)",
///   "amount": 2500,
///   "variables": {
///     "op": { "kind": "operators", "category": "Time Series" },
///     "field": { "kind": "datafields", "query": { "datasetId": "fundamental6" } },
///     "window": { "kind": "number", "values": [5, 10, 20] }
///   }
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct TemplateDefinition {
    pub template: String,
    #[serde(default = "TemplateDefinition::default_amount")]
    pub amount: usize,
    pub variables: BTreeMap<String, VariableSpec>,
}

impl TemplateDefinition {
    fn default_amount() -> usize {
        2_500
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Builds the template, fetching operators and data-field catalogs only for the variables
    /// that need them. The operator list is fetched at most once.
    pub fn resolve<C: Client>(&self, session: &Session<C>) -> Result<Template> {
        let mut operators: Option<Vec<Operator>> = None;
        let mut variables = HashMap::new();

        for (name, spec) in &self.variables {
            let variable = match spec {
                VariableSpec::Operators {
                    values: Some(values),
                    ..
                } => Variable::operators(values.iter().cloned()),
                VariableSpec::Operators {
                    values: None,
                    filter,
                    category,
                } => {
                    if operators.is_none() {
                        operators = session.fetch_operators();
                    }
                    let Some(available) = operators.as_deref() else {
                        return Err(BrainError::EmptyVariable { name: name.clone() }.into());
                    };
                    Variable::from_operators(
                        available,
                        filter.as_deref().unwrap_or(""),
                        category.as_deref(),
                    )
                }
                VariableSpec::Datafields {
                    values: Some(values),
                    ..
                } => Variable {
                    kind: VariableKind::DataFields,
                    values: values.clone(),
                },
                VariableSpec::Datafields {
                    values: None,
                    query: Some(query),
                } => match session.fetch_field_catalog(&FieldQuery::from(query)) {
                    Some(catalog) if !catalog.is_empty() => Variable::data_fields(&catalog),
                    _ => return Err(BrainError::EmptyVariable { name: name.clone() }.into()),
                },
                VariableSpec::Datafields {
                    values: None,
                    query: None,
                } => return Err(BrainError::EmptyVariable { name: name.clone() }.into()),
                VariableSpec::Number { values } => Variable::numbers(values),
            };
            variables.insert(name.clone(), variable);
        }

        Ok(Template::new(self.template.as_str(), variables)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{CatalogQuery, Template, TemplateDefinition, Variable};
    use crate::client::brain::LocalClient;
    use crate::http::brain::{AppState, BrainError, FieldQuery};
    use crate::input::replay::read_expressions;
    use crate::session::Session;
    use crate::settings::RunnerConfig;

    fn variables() -> HashMap<String, Variable> {
        let mut variables = HashMap::new();
        variables.insert("op".to_string(), Variable::operators(["rank", "zscore"]));
        variables.insert(
            "n".to_string(),
            Variable::parse_numbers("n", "5, 10.0, 2.5").unwrap(),
        );
        variables
    }

    #[test]
    fn test_that_numbers_are_formatted() {
        let numbers = Variable::parse_numbers("n", "5, 10.0, 2.5").unwrap();
        assert_eq!(numbers.values, vec!["5", "10", "2.5"]);
        assert!(Variable::parse_numbers("n", "5, x").is_err());
        assert!(matches!(
            Variable::parse_numbers("n", " , "),
            Err(BrainError::EmptyVariable { .. })
        ));
    }

    #[test]
    fn test_that_undefined_placeholder_is_rejected() {
        let result = Template::new("<op/>(<field/>)", variables());
        assert!(matches!(
            result,
            Err(BrainError::UndefinedVariable { name }) if name == "field"
        ));
    }

    #[test]
    fn test_that_repeated_placeholder_shares_a_value() {
        let template = Template::new("<op/>(close) - <op/>(open) * <n/>", variables()).unwrap();
        assert_eq!(template.placeholders(), ["op", "n"]);

        let mut rng = StdRng::seed_from_u64(7);
        for expression in template.generate(50, &mut rng) {
            let uses_rank = expression.starts_with("rank(close) - rank(open)");
            let uses_zscore = expression.starts_with("zscore(close) - zscore(open)");
            assert!(uses_rank || uses_zscore, "{expression}");
            assert!(!expression.contains('<'));
        }
    }

    #[test]
    fn test_that_quotes_are_stripped() {
        let template = Template::new("<op/>(\"close\")", variables()).unwrap();
        let expression = template.instantiate(&mut StdRng::seed_from_u64(1));
        assert!(!expression.contains('"'));
    }

    #[test]
    fn test_that_generated_file_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alphas.csv");
        let template = Template::new("ts_mean(close, <n/>)", variables()).unwrap();

        assert_eq!(template.generate_to_file(&path, 25, '|').unwrap(), 25);
        let read = read_expressions(&path, '|').unwrap();
        assert_eq!(read.len(), 25);
        assert!(read.iter().all(|e| e.starts_with("ts_mean(close, ")));
    }

    #[test]
    fn test_that_definition_resolves_against_service() {
        let definition: TemplateDefinition = serde_json::from_str(
            r#"{
                "template": "<op/>(<field/>, <window/>)",
                "amount": 10,
                "variables": {
                    "op": { "kind": "operators", "category": "Time Series" },
                    "field": { "kind": "datafields", "query": { "datasetId": "fundamental6" } },
                    "window": { "kind": "number", "values": [5, 10] }
                }
            }"#,
        )
        .unwrap();

        let config = RunnerConfig {
            poll_interval: (Duration::from_millis(1), Duration::from_millis(2)),
            ..RunnerConfig::default()
        };
        let session = Session::new(LocalClient::new(AppState::demo()), &config);
        let template = definition.resolve(&session).unwrap();

        let expression = template.instantiate(&mut StdRng::seed_from_u64(3));
        assert!(expression.starts_with("ts_"));
        assert!(expression.contains("fnd6_field_"));
        assert_eq!(session.client().calls().get("fetch_operators"), 1);
        assert_eq!(session.client().calls().get("fetch_fields_page"), 3);
    }

    #[test]
    fn test_that_datafields_without_source_are_rejected() {
        let definition: TemplateDefinition = serde_json::from_str(
            r#"{ "template": "<f/>", "variables": { "f": { "kind": "datafields" } } }"#,
        )
        .unwrap();
        assert_eq!(definition.amount, 2_500);

        let session = Session::new(LocalClient::new(AppState::new()), &RunnerConfig::default());
        assert!(definition.resolve(&session).is_err());
    }

    #[test]
    fn test_that_catalog_query_defaults_apply() {
        let query: CatalogQuery = serde_json::from_str(r#"{ "datasetId": "pv1" }"#).unwrap();
        let query = FieldQuery::from(&query);
        assert_eq!(query.data_type, "VECTOR");
        assert_eq!(query.region, "USA");
        assert_eq!(query.universe, "TOP3000");
        assert_eq!(query.delay, 1);
        assert_eq!(query.search, None);
    }
}
