//! Declarative YAML feature files and the step vocabulary

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{AccordError, AccordResult};
use crate::http::Method;
use crate::phrase;
use crate::table::DataTable;

/// A feature file: shared background steps plus scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering, inherited by every scenario
    #[serde(default)]
    pub tags: Vec<String>,

    /// Steps run before each scenario
    #[serde(default)]
    pub background: Vec<StepEntry>,

    pub scenarios: Vec<Scenario>,

    /// File the feature was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub tags: Vec<String>,

    pub steps: Vec<StepEntry>,
}

/// A step as written in a feature file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    /// `action: <name>` plus fields
    Typed(Step),
    /// A bare phrase
    Phrase(String),
    /// A phrase with a doc string or a table argument
    PhraseWithArgs {
        phrase: String,
        #[serde(default)]
        doc: Option<String>,
        #[serde(default)]
        table: Option<TableArg>,
    },
}

/// Table argument of a phrase: YAML rows or a pipe-delimited block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableArg {
    Rows(DataTable),
    Pipe(String),
}

impl TableArg {
    pub fn to_table(&self) -> AccordResult<DataTable> {
        match self {
            TableArg::Rows(table) => Ok(table.clone()),
            TableArg::Pipe(text) => DataTable::parse_pipe(text),
        }
    }
}

impl StepEntry {
    /// Resolves phrases to typed steps
    pub fn to_step(&self) -> AccordResult<Step> {
        match self {
            StepEntry::Typed(step) => Ok(step.clone()),
            StepEntry::Phrase(phrase) => phrase::parse(phrase, None, None),
            StepEntry::PhraseWithArgs { phrase, doc, table } => {
                let table = table.as_ref().map(TableArg::to_table).transpose()?;
                phrase::parse(phrase, doc.as_deref(), table)
            }
        }
    }

    /// Text used in logs and reports
    pub fn describe(&self) -> String {
        match self {
            StepEntry::Typed(step) => step.describe(),
            StepEntry::Phrase(phrase) | StepEntry::PhraseWithArgs { phrase, .. } => phrase.clone(),
        }
    }
}

/// A single executable step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Header sent with every request for the rest of the scenario
    PermanentHeader { name: String, value: String },

    /// Header sent with the next request only
    Header { name: String, value: String },

    /// Store a literal; strings are parameterized first
    StoreValue { name: String, value: Value },

    /// Store a JSON document
    StoreJson { name: String, json: Value },

    /// Store the value at `path` of the last response
    StoreField { name: String, path: String },

    /// Store the number at `path` rounded to `scale` decimal places, as text
    StoreRoundedField {
        name: String,
        path: String,
        rounding: Rounding,
        scale: u32,
    },

    /// Store a resource file with every parameter key replaced by its value
    StoreTemplate {
        name: String,
        file: PathBuf,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },

    /// Store path and query of a URL
    StoreRelativeUrl { name: String, url: String },

    /// Store a response header
    StoreHeader { name: String, header: String },

    /// Store the current time shifted by `hours`, formatted with a strftime pattern
    StoreDateTime {
        name: String,
        #[serde(default)]
        hours: i64,
        #[serde(default = "default_datetime_format")]
        format: String,
    },

    /// Store an attribute or the text of an element in the first message's HTML
    StoreHtmlElement {
        name: String,
        address: String,
        selector: String,
        #[serde(default)]
        attribute: Option<String>,
    },

    /// Reset an application's base or demo data through its admin port
    RecreateData {
        app: String,
        #[serde(default)]
        kind: DataKind,
    },

    /// Log users in; rows hold `name`, `password` and `jwtTokenName`
    Login { app: String, users: DataTable },

    Request(RequestStep),

    /// One request per table row, rows running concurrently
    RequestTable(TableRequestStep),

    /// Repeat a GET until a condition holds
    RequestUntil(PollRequestStep),

    /// PUT a resource file to a pre-signed storage URL
    PutSignedUrl {
        url: String,
        file: PathBuf,
        #[serde(default)]
        media_type: Option<String>,
    },

    ExpectStatus { status: u16 },

    ExpectJson(JsonAssertion),

    ExpectBody(BodyAssertion),

    ExpectHeader {
        name: String,
        #[serde(default)]
        contains: Option<String>,
        #[serde(default)]
        equals: Option<String>,
    },

    /// Re-order the array at `path` of the last response
    SortJson {
        path: String,
        by: String,
        #[serde(default)]
        descending: bool,
    },

    /// Attribute added to every message sent for the rest of the scenario
    QueueHeader { name: String, value: String },

    SendMessage {
        queue: String,
        #[serde(default)]
        group_id: Option<String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        file: Option<PathBuf>,
    },

    PurgeQueue { queue: String },

    PurgeAllQueues,

    /// Wait until `queue` holds exactly `count` pending messages
    ExpectMessages {
        queue: String,
        count: u64,
        #[serde(default)]
        within_seconds: Option<u64>,
    },

    /// Received messages must match `expected` leniently, in any order
    ExpectQueueMessages { queue: String, expected: Value },

    WaitForQueuesToDrain {
        #[serde(default)]
        within_seconds: Option<u64>,
    },

    CreateBucket { bucket: String },

    PutObject {
        bucket: String,
        key: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        file: Option<PathBuf>,
    },

    ExpectObject {
        bucket: String,
        key: String,
        #[serde(default = "default_true")]
        exists: bool,
    },

    ClearMailbox { addresses: Vec<String> },

    /// Inbox messages must match `expected` leniently
    ExpectMail {
        address: String,
        expected: Value,
        #[serde(default)]
        within_seconds: Option<u64>,
    },

    /// One inbox check per row, rows running concurrently; rows hold
    /// `email` and `content`
    ExpectMailTable { rows: DataTable },

    /// The first message's HTML must contain `text`
    ExpectFirstMailContains {
        address: String,
        text: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },

    Sql { database: String, statement: String },

    SqlInsert {
        database: String,
        table: String,
        rows: DataTable,
    },

    /// Query rows become the last response as a JSON array
    SqlQuery { database: String, query: String },

    TruncateTables { database: String },

    Log { message: String },

    Sleep { ms: u64 },
}

fn default_true() -> bool {
    true
}

fn default_datetime_format() -> String {
    "%Y-%m-%d %H:%M".to_string()
}

/// Decimal rounding applied by [`Step::StoreRoundedField`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    Floor,
    Ceiling,
    HalfUp,
    HalfDown,
}

impl std::str::FromStr for Rounding {
    type Err = AccordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "floor" => Ok(Rounding::Floor),
            "ceiling" => Ok(Rounding::Ceiling),
            "halfup" => Ok(Rounding::HalfUp),
            "halfdown" => Ok(Rounding::HalfDown),
            other => Err(AccordError::InvalidConfig(format!("Unknown rounding mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    #[default]
    Base,
    Demo,
}

impl DataKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            DataKind::Base => "/actuator/base-data",
            DataKind::Demo => "/actuator/demo-data",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    pub method: Method,
    pub path: String,

    /// Context variable holding the JWT to send
    #[serde(default)]
    pub user: Option<String>,

    /// JSON document, or raw text when given as a string
    #[serde(default)]
    pub body: Option<Value>,

    /// Resource file sent as the body
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub media_type: Option<String>,

    #[serde(default)]
    pub admin: bool,

    #[serde(default)]
    pub query: Vec<QueryParam>,

    /// Percent-encode substituted variables in the path and query
    #[serde(default = "default_true")]
    pub encode_url: bool,

    #[serde(default)]
    pub method_override: bool,

    #[serde(default)]
    pub expect_status: Option<u16>,
}

impl RequestStep {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            user: None,
            body: None,
            file: None,
            media_type: None,
            admin: false,
            query: Vec::new(),
            encode_url: true,
            method_override: false,
            expect_status: None,
        }
    }
}

/// Field of each row's response stored as `prefix + (row + 1)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRows {
    pub field: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRequestStep {
    pub method: Method,
    pub path: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub admin: bool,

    pub rows: DataTable,

    /// Parse cells holding JSON objects or arrays
    #[serde(default)]
    pub nested_json: bool,

    #[serde(default)]
    pub expect_status: Option<u16>,

    #[serde(default)]
    pub store: Option<StoreRows>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequestStep {
    pub path: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub admin: bool,

    #[serde(default)]
    pub within_seconds: Option<u64>,

    pub until: PollCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollCondition {
    Status(u16),
    Equals { path: String, value: String },
    EqualsNumber { path: String, value: f64 },
    HasSize { path: String, size: usize },
    Contains { path: String, value: String },
    /// Body leniently equivalent to a document
    EquivalentTo(Value),
}

/// Checks against the JSON body of the last response; every field set is checked
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonAssertion {
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub not_equals: Option<Value>,
    /// Strict structural equality
    #[serde(default)]
    pub equal_to_json: Option<Value>,
    /// Lenient structural equivalence
    #[serde(default)]
    pub equivalent_to: Option<Value>,
    #[serde(default)]
    pub contains: Option<Value>,
    #[serde(default)]
    pub not_contains: Option<Value>,
    #[serde(default)]
    pub starts_with: Option<String>,
    #[serde(default)]
    pub matches: Option<String>,
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub at_least: Option<usize>,
    #[serde(default)]
    pub is_null: Option<bool>,
    #[serde(default)]
    pub present: Option<bool>,
    #[serde(default)]
    pub not_empty: Option<bool>,
    #[serde(default)]
    pub approx: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
    /// Value is a date or timestamp falling on today's local date
    #[serde(default)]
    pub today: Option<bool>,
}

fn root_path() -> String {
    "$".to_string()
}

impl JsonAssertion {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyAssertion {
    #[serde(default)]
    pub empty: Option<bool>,
    #[serde(default)]
    pub equals: Option<String>,
    /// Equal once runs of whitespace are collapsed
    #[serde(default)]
    pub equivalent_text: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    /// Top-level field that must exist in the JSON body
    #[serde(default)]
    pub has_field: Option<String>,
}

impl Step {
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

impl Feature {
    pub fn from_yaml(yaml: &str) -> AccordResult<Self> {
        serde_yaml::from_str(yaml).map_err(AccordError::from)
    }

    pub fn from_file(path: &Path) -> AccordResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut feature = Self::from_yaml(&content)?;
        feature.source = Some(path.to_path_buf());
        Ok(feature)
    }

    /// Loads every `.yaml`/`.yml` file under `dir`, sorted by path
    pub fn load_all(dir: &Path) -> AccordResult<Vec<Self>> {
        let mut features = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            features.push(Self::from_file(entry.path())?);
        }

        Ok(features)
    }

    /// Scenario tags including those inherited from the feature
    pub fn scenario_tags<'a>(&'a self, scenario: &'a Scenario) -> impl Iterator<Item = &'a String> {
        self.tags.iter().chain(scenario.tags.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feature() {
        let yaml = r#"
name: orders
tags: [smoke]
background:
  - action: permanent_header
    name: X-Tenant
    value: acme
scenarios:
  - name: create widget
    tags: [widgets]
    steps:
      - action: request
        method: POST
        path: /orders/secure/widgets
        user: ADMIN_TOKEN
        body: {name: x}
      - I expect HTTP status 201
      - action: expect_json
        path: $.widgetId
        is_null: false
      - action: store_field
        name: widget1
        path: $.widgetId
      - phrase: I expect the JSON to be equivalent to
        doc: '{"name": "x"}'
"#;
        let feature = Feature::from_yaml(yaml).unwrap();
        assert_eq!(feature.background.len(), 1);
        let steps = &feature.scenarios[0].steps;
        assert_eq!(steps.len(), 5);

        match steps[0].to_step().unwrap() {
            Step::Request(req) => {
                assert_eq!(req.method, Method::Post);
                assert_eq!(req.user.as_deref(), Some("ADMIN_TOKEN"));
                assert!(req.encode_url);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!(matches!(
            steps[1].to_step().unwrap(),
            Step::ExpectStatus { status: 201 }
        ));
        assert!(matches!(steps[4], StepEntry::PhraseWithArgs { .. }));

        let tags: Vec<_> = feature.scenario_tags(&feature.scenarios[0]).collect();
        assert_eq!(tags, vec!["smoke", "widgets"]);
    }

    #[test]
    fn test_table_request() {
        let yaml = r#"
action: request_table
method: POST
path: /orders/secure/widgets
rows:
  - {name: a}
  - {name: b}
store:
  field: $.widgetId
  prefix: widget
"#;
        match serde_yaml::from_str::<Step>(yaml).unwrap() {
            Step::RequestTable(t) => {
                assert_eq!(t.rows.len(), 2);
                assert_eq!(t.store.unwrap().prefix, "widget");
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_poll_condition() {
        let yaml = r#"
action: request_until
path: /orders/secure/widgets/1
within_seconds: 10
until:
  equals: {path: $.state, value: DONE}
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            step,
            Step::RequestUntil(PollRequestStep { until: PollCondition::Equals { .. }, .. })
        ));
    }

    #[test]
    fn test_load_all() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "name: b\nscenarios: []\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested/a.yml"),
            "name: a\nscenarios: []\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let features = Feature::load_all(dir.path()).unwrap();
        assert_eq!(features.len(), 2);
        assert!(features.iter().all(|f| f.source.is_some()));
    }
}
