//! Natural-language step phrases
//!
//! Each rule pairs an anchored pattern with a builder producing a typed
//! [`Step`]. Rules are tried in order and the first match wins, so more
//! specific patterns come before general ones. A leading Gherkin keyword
//! (`Given`, `When`, `Then`, `And`, `But`) is ignored.

use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use crate::error::{AccordError, AccordResult};
use crate::http::Method;
use crate::json;
use crate::spec::{
    BodyAssertion, DataKind, JsonAssertion, PollCondition, PollRequestStep, QueryParam, RequestStep,
    Step, StoreRows, TableRequestStep,
};
use crate::table::DataTable;

/// Doc string and table attached to a phrase
#[derive(Debug, Default)]
pub struct PhraseArgs<'a> {
    pub doc: Option<&'a str>,
    pub table: Option<DataTable>,
}

impl PhraseArgs<'_> {
    fn doc(&self, phrase: &str) -> AccordResult<String> {
        self.doc
            .map(str::to_string)
            .ok_or_else(|| AccordError::InvalidConfig(format!("Step \"{}\" needs a doc string", phrase)))
    }

    fn table(&self, phrase: &str) -> AccordResult<DataTable> {
        self.table
            .clone()
            .ok_or_else(|| AccordError::InvalidConfig(format!("Step \"{}\" needs a table", phrase)))
    }
}

type Build = fn(&Captures<'_>, &PhraseArgs<'_>) -> AccordResult<Step>;

struct Rule {
    pattern: Regex,
    build: Build,
}

const ACTOR: &str = r#"(?:user with JWT "(?P<user>[^"]+)"|anonymous)"#;

static KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Given|When|Then|And|But)\s+").expect("keyword pattern is valid"));

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    let rules = vec![
        // headers
        rule(
            r#"^permanent HTTP header "(?P<name>[^":]+):\s*(?P<value>[^"]*)"$"#,
            |c, _| {
                Ok(Step::PermanentHeader {
                    name: cap(c, "name"),
                    value: cap(c, "value"),
                })
            },
        ),
        rule(
            r#"^HTTP header "(?P<name>[^":]+):\s*(?P<value>[^"]*)"$"#,
            |c, _| {
                Ok(Step::Header {
                    name: cap(c, "name"),
                    value: cap(c, "value"),
                })
            },
        ),
        rule(
            r#"^queue header "(?P<name>[^":]+):\s*(?P<value>[^"]*)"$"#,
            |c, _| {
                Ok(Step::QueueHeader {
                    name: cap(c, "name"),
                    value: cap(c, "value"),
                })
            },
        ),
        // application data
        rule(
            r#"^users? logged into "(?P<app>[^"]+)":?$"#,
            |c, a| {
                Ok(Step::Login {
                    app: cap(c, "app"),
                    users: a.table("users logged into")?,
                })
            },
        ),
        rule(
            r#"^"(?P<app>[^"]+)" (?P<kind>base|demo) data is created$"#,
            |c, _| {
                let kind = if cap(c, "kind") == "demo" {
                    DataKind::Demo
                } else {
                    DataKind::Base
                };
                Ok(Step::RecreateData {
                    app: cap(c, "app"),
                    kind,
                })
            },
        ),
        // requests
        rule(
            r#"^user sends PUT to the signed (?:S3 )?url "(?P<url>[^"]+)" with file "(?P<file>[^"]+)"$"#,
            |c, _| {
                Ok(Step::PutSignedUrl {
                    url: cap(c, "url"),
                    file: PathBuf::from(cap(c, "file")),
                    media_type: None,
                })
            },
        ),
        rule(
            format!(
                r#"^{ACTOR} sends (?P<method>[A-Z]+) "(?P<path>[^"]*)"(?P<admin> on the admin port)? for each row(?: storing "(?P<field>[^"]+)" as "(?P<prefix>[^"]+)")?:?$"#
            ),
            |c, a| {
                let store = match (opt(c, "field"), opt(c, "prefix")) {
                    (Some(field), Some(prefix)) => Some(StoreRows { field, prefix }),
                    _ => None,
                };
                Ok(Step::RequestTable(TableRequestStep {
                    method: method(c)?,
                    path: cap(c, "path"),
                    user: opt(c, "user"),
                    admin: c.name("admin").is_some(),
                    rows: a.table("sends for each row")?,
                    nested_json: true,
                    expect_status: None,
                    store,
                }))
            },
        ),
        rule(
            format!(
                r#"^{ACTOR} sends (?P<method>[A-Z]+)(?P<tunnel> as POST)? "(?P<path>[^"]*)"(?P<admin> on the admin port)?(?P<raw> without encoding the url)?(?: with (?P<with>JSON|text|query params|file "(?P<file>[^"]+)"))?:?$"#
            ),
            build_request,
        ),
        rule(
            format!(
                r#"^{ACTOR} polls "(?P<path>[^"]*)"(?P<admin> on the admin port)?(?: for up to (?P<secs>\d+) seconds)? until (?P<cond>.+?):?$"#
            ),
            build_poll,
        ),
        // response checks
        rule(
            r#"^I expect HTTP status (?P<status>\d{3})$"#,
            |c, _| {
                Ok(Step::ExpectStatus {
                    status: number(c, "status")?,
                })
            },
        ),
        rule(
            r#"^I expect HTTP header "(?P<name>[^"]+)" (?P<op>contains|equals) "(?P<value>[^"]*)"$"#,
            |c, _| {
                let value = Some(cap(c, "value"));
                let (contains, equals) = if cap(c, "op") == "contains" {
                    (value, None)
                } else {
                    (None, value)
                };
                Ok(Step::ExpectHeader {
                    name: cap(c, "name"),
                    contains,
                    equals,
                })
            },
        ),
        rule(
            r#"^I expect the date at "(?P<path>[^"]+)" is today's date$"#,
            |c, _| {
                Ok(Step::ExpectJson(JsonAssertion {
                    today: Some(true),
                    ..JsonAssertion::at(cap(c, "path"))
                }))
            },
        ),
        rule(
            r#"^I expect a list of (?P<size>\d+) JSON entit(?:y|ies)$"#,
            |c, _| {
                Ok(Step::ExpectJson(JsonAssertion {
                    size: Some(number(c, "size")?),
                    ..JsonAssertion::at("$")
                }))
            },
        ),
        rule(
            r#"^I expect JSON (?P<mode>equivalent|equal) to:?$"#,
            |c, a| {
                let doc = Value::String(a.doc("I expect JSON")?);
                let mut check = JsonAssertion::at("$");
                if cap(c, "mode") == "equal" {
                    check.equal_to_json = Some(doc);
                } else {
                    check.equivalent_to = Some(doc);
                }
                Ok(Step::ExpectJson(check))
            },
        ),
        rule(
            r#"^I expect the JSON(?: at "(?P<path>[^"]+)")? (?P<rest>.+?):?$"#,
            build_json_assertion,
        ),
        rule(
            r#"^I expect an empty response$"#,
            |_, _| {
                Ok(Step::ExpectBody(BodyAssertion {
                    empty: Some(true),
                    ..Default::default()
                }))
            },
        ),
        rule(
            r#"^I expect JSON containing field "(?P<field>[^"]+)"$"#,
            |c, _| {
                Ok(Step::ExpectBody(BodyAssertion {
                    has_field: Some(cap(c, "field")),
                    ..Default::default()
                }))
            },
        ),
        rule(
            r#"^I expect text equivalent to:?$"#,
            |_, a| {
                Ok(Step::ExpectBody(BodyAssertion {
                    equivalent_text: Some(a.doc("I expect text equivalent to")?),
                    ..Default::default()
                }))
            },
        ),
        rule(
            r#"^I expect the response to contain "(?P<text>[^"]*)"$"#,
            |c, _| {
                Ok(Step::ExpectBody(BodyAssertion {
                    contains: Some(cap(c, "text")),
                    ..Default::default()
                }))
            },
        ),
        rule(
            r#"^I sort the JSON at "(?P<path>[^"]+)" by "(?P<by>[^"]+)"(?P<desc> descending)?$"#,
            |c, _| {
                Ok(Step::SortJson {
                    path: cap(c, "path"),
                    by: cap(c, "by"),
                    descending: c.name("desc").is_some(),
                })
            },
        ),
        // context
        rule(
            r#"^I store the following JSON as "(?P<name>[^"]+)":?$"#,
            |c, a| {
                Ok(Step::StoreJson {
                    name: cap(c, "name"),
                    json: Value::String(a.doc("I store the following JSON")?),
                })
            },
        ),
        rule(
            r#"^I store the relative portion from the url "(?P<url>[^"]+)" as "(?P<name>[^"]+)"$"#,
            |c, _| {
                Ok(Step::StoreRelativeUrl {
                    name: cap(c, "name"),
                    url: cap(c, "url"),
                })
            },
        ),
        rule(
            r#"^I store JSON field (?:at )?"(?P<path>[^"]+)" rounded to (?P<mode>floor|ceiling|halfup|halfdown) with scale (?P<scale>\d+) as "(?P<name>[^"]+)"$"#,
            |c, _| {
                Ok(Step::StoreRoundedField {
                    name: cap(c, "name"),
                    path: cap(c, "path"),
                    rounding: cap(c, "mode").parse()?,
                    scale: number(c, "scale")?,
                })
            },
        ),
        rule(
            r#"^I store the rendered template "(?P<file>[^"]+)" as "(?P<name>[^"]+)" using params:?$"#,
            |c, a| {
                let table = a.table("I store the rendered template")?;
                let params = table
                    .rows()
                    .iter()
                    .map(|row| -> AccordResult<(String, String)> {
                        Ok((row.get_str("placeholder")?, row.get_str("value")?))
                    })
                    .collect::<AccordResult<_>>()?;
                Ok(Step::StoreTemplate {
                    name: cap(c, "name"),
                    file: PathBuf::from(cap(c, "file")),
                    params,
                })
            },
        ),
        rule(
            r#"^I store JSON field (?:at )?"(?P<path>[^"]+)" as "(?P<name>[^"]+)"$"#,
            |c, _| {
                Ok(Step::StoreField {
                    name: cap(c, "name"),
                    path: cap(c, "path"),
                })
            },
        ),
        rule(
            r#"^I store HTTP header "(?P<header>[^"]+)" as "(?P<name>[^"]+)"$"#,
            |c, _| {
                Ok(Step::StoreHeader {
                    name: cap(c, "name"),
                    header: cap(c, "header"),
                })
            },
        ),
        rule(
            r#"^I store the date (?P<hours>\d+) hours? (?P<dir>before|after) now as "(?P<name>[^"]+)"(?: in format "(?P<format>[^"]+)")?$"#,
            |c, _| {
                let hours: i64 = number(c, "hours")?;
                Ok(Step::StoreDateTime {
                    name: cap(c, "name"),
                    hours: if cap(c, "dir") == "before" { -hours } else { hours },
                    format: opt(c, "format").unwrap_or_else(|| "%Y-%m-%d %H:%M".to_string()),
                })
            },
        ),
        rule(
            r#"^I store the (?:attribute "(?P<attribute>[^"]+)" of )?element "(?P<selector>[^"]+)" from the first message of "(?P<address>[^"]+)" as "(?P<name>[^"]+)"$"#,
            |c, _| {
                Ok(Step::StoreHtmlElement {
                    name: cap(c, "name"),
                    address: cap(c, "address"),
                    selector: cap(c, "selector"),
                    attribute: opt(c, "attribute"),
                })
            },
        ),
        rule(
            r#"^I store the value (?P<value>.+) as "(?P<name>[^"]+)"$"#,
            |c, _| {
                Ok(Step::StoreValue {
                    name: cap(c, "name"),
                    value: json::literal(&cap(c, "value")),
                })
            },
        ),
        // queues
        rule(
            r#"^I wait(?: up to (?P<secs>\d+) seconds)? for all (?:of )?the queues to process$"#,
            |c, _| {
                Ok(Step::WaitForQueuesToDrain {
                    within_seconds: opt_number(c, "secs")?,
                })
            },
        ),
        rule(
            r#"^I purge all queues$"#,
            |_, _| Ok(Step::PurgeAllQueues),
        ),
        rule(
            r#"^I purge queue "(?P<queue>[^"]+)"$"#,
            |c, _| Ok(Step::PurgeQueue { queue: cap(c, "queue") }),
        ),
        rule(
            r#"^the JSON message is placed on the queue "(?P<queue>[^"]+)"(?: grouped by "(?P<group>[^"]+)")?:?$"#,
            |c, a| {
                Ok(Step::SendMessage {
                    queue: cap(c, "queue"),
                    group_id: opt(c, "group"),
                    body: Some(Value::String(a.doc("the JSON message is placed on the queue")?)),
                    file: None,
                })
            },
        ),
        rule(
            r#"^I expect (?P<count>\d+) messages? on queue "(?P<queue>[^"]+)"$"#,
            |c, _| {
                Ok(Step::ExpectMessages {
                    queue: cap(c, "queue"),
                    count: number(c, "count")?,
                    within_seconds: Some(0),
                })
            },
        ),
        rule(
            r#"^I wait (?:up to (?P<secs>\d+) seconds )?for (?P<count>\d+) messages? on queue "(?P<queue>[^"]+)"$"#,
            |c, _| {
                Ok(Step::ExpectMessages {
                    queue: cap(c, "queue"),
                    count: number(c, "count")?,
                    within_seconds: opt_number(c, "secs")?,
                })
            },
        ),
        rule(
            r#"^I expect equivalent JSON messages on queue "(?P<queue>[^"]+)":?$"#,
            |c, a| {
                Ok(Step::ExpectQueueMessages {
                    queue: cap(c, "queue"),
                    expected: Value::String(a.doc("I expect equivalent JSON messages")?),
                })
            },
        ),
        // object storage
        rule(
            r#"^the (?:s3 |S3 )?bucket "(?P<bucket>[^"]+)" exists$"#,
            |c, _| Ok(Step::CreateBucket { bucket: cap(c, "bucket") }),
        ),
        rule(
            r#"^the text is placed in the (?:s3 |S3 )?bucket "(?P<bucket>[^"]+)" with key "(?P<key>[^"]+)":?$"#,
            |c, a| {
                Ok(Step::PutObject {
                    bucket: cap(c, "bucket"),
                    key: cap(c, "key"),
                    body: Some(a.doc("the text is placed in the bucket")?),
                    file: None,
                })
            },
        ),
        rule(
            r#"^the file "(?P<file>[^"]+)" is placed in the (?:s3 |S3 )?bucket "(?P<bucket>[^"]+)" with key "(?P<key>[^"]+)"$"#,
            |c, _| {
                Ok(Step::PutObject {
                    bucket: cap(c, "bucket"),
                    key: cap(c, "key"),
                    body: None,
                    file: Some(PathBuf::from(cap(c, "file"))),
                })
            },
        ),
        rule(
            r#"^I verify the key "(?P<key>[^"]+)" (?P<op>exists|does not exist) in the (?:s3 |S3 )?bucket "(?P<bucket>[^"]+)"$"#,
            |c, _| {
                Ok(Step::ExpectObject {
                    bucket: cap(c, "bucket"),
                    key: cap(c, "key"),
                    exists: cap(c, "op") == "exists",
                })
            },
        ),
        // mailbox
        rule(
            r#"^mail ?box of user "(?P<address>[^"]+)" is cleared$"#,
            |c, _| {
                Ok(Step::ClearMailbox {
                    addresses: vec![cap(c, "address")],
                })
            },
        ),
        rule(
            r#"^mail ?box(?:es)? of users (?:is|are) cleared:?$"#,
            |_, a| {
                let table = a.table("mail box of users is cleared")?;
                let addresses = table
                    .rows()
                    .iter()
                    .map(|row| row.get_str("email"))
                    .collect::<AccordResult<Vec<_>>>()?;
                Ok(Step::ClearMailbox { addresses })
            },
        ),
        rule(
            r#"^I expect the user with email id "(?P<address>[^"]+)" has following mails:?$"#,
            |c, a| {
                Ok(Step::ExpectMail {
                    address: cap(c, "address"),
                    expected: Value::String(a.doc("has following mails")?),
                    within_seconds: None,
                })
            },
        ),
        rule(
            r#"^I expect the following users to have the mail content:?$"#,
            |_, a| {
                Ok(Step::ExpectMailTable {
                    rows: a.table("I expect the following users to have the mail content")?,
                })
            },
        ),
        rule(
            r#"^I expect the first message in the inbox of "(?P<address>[^"]+)" to contain "(?P<text>[^"]*)"$"#,
            |c, _| {
                Ok(Step::ExpectFirstMailContains {
                    address: cap(c, "address"),
                    text: cap(c, "text"),
                    within_seconds: None,
                })
            },
        ),
        // sql
        rule(
            r#"^database "(?P<db>[^"]+)" runs:?$"#,
            |c, a| {
                Ok(Step::Sql {
                    database: cap(c, "db"),
                    statement: a.doc("database runs")?,
                })
            },
        ),
        rule(
            r#"^the following rows are inserted into "(?P<table>[^"]+)" of database "(?P<db>[^"]+)":?$"#,
            |c, a| {
                Ok(Step::SqlInsert {
                    database: cap(c, "db"),
                    table: cap(c, "table"),
                    rows: a.table("the following rows are inserted")?,
                })
            },
        ),
        rule(
            r#"^I query database "(?P<db>[^"]+)":?$"#,
            |c, a| {
                Ok(Step::SqlQuery {
                    database: cap(c, "db"),
                    query: a.doc("I query database")?,
                })
            },
        ),
        rule(
            r#"^all tables of database "(?P<db>[^"]+)" are truncated$"#,
            |c, _| Ok(Step::TruncateTables { database: cap(c, "db") }),
        ),
        // misc
        rule(
            r#"^I wait (?P<n>\d+) (?P<unit>milliseconds|seconds?)$"#,
            |c, _| {
                let n: u64 = number(c, "n")?;
                let ms = if cap(c, "unit") == "milliseconds" { n } else { n * 1000 };
                Ok(Step::Sleep { ms })
            },
        ),
        rule(
            r#"^log "(?P<message>[^"]*)"$"#,
            |c, _| Ok(Step::Log { message: cap(c, "message") }),
        ),
    ];

    rules
        .into_iter()
        .map(|(pattern, build)| Rule {
            pattern: Regex::new(&pattern).expect("phrase patterns are valid"),
            build,
        })
        .collect()
});

/// Resolves a phrase to a typed step
pub fn parse(phrase: &str, doc: Option<&str>, table: Option<DataTable>) -> AccordResult<Step> {
    let text = KEYWORD.replace(phrase.trim(), "");
    let args = PhraseArgs { doc, table };

    for rule in RULES.iter() {
        if let Some(caps) = rule.pattern.captures(&text) {
            debug!("Phrase \"{}\" matched {}", text, rule.pattern.as_str());
            return (rule.build)(&caps, &args);
        }
    }
    Err(AccordError::UnknownPhrase(phrase.to_string()))
}

fn rule(pattern: impl Into<String>, build: Build) -> (String, Build) {
    (pattern.into(), build)
}

fn cap(c: &Captures<'_>, name: &str) -> String {
    c.name(name).map(|m| m.as_str().to_string()).unwrap_or_default()
}

fn opt(c: &Captures<'_>, name: &str) -> Option<String> {
    c.name(name).map(|m| m.as_str().to_string())
}

fn number<T: FromStr>(c: &Captures<'_>, name: &str) -> AccordResult<T> {
    let raw = cap(c, name);
    raw.parse()
        .map_err(|_| AccordError::InvalidConfig(format!("\"{}\" is not a valid {}", raw, name)))
}

fn opt_number<T: FromStr>(c: &Captures<'_>, name: &str) -> AccordResult<Option<T>> {
    match c.name(name) {
        Some(_) => number(c, name).map(Some),
        None => Ok(None),
    }
}

fn method(c: &Captures<'_>) -> AccordResult<Method> {
    Method::from_str(&cap(c, "method"))
}

fn unquote(text: &str) -> String {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
        .to_string()
}

fn build_request(c: &Captures<'_>, a: &PhraseArgs<'_>) -> AccordResult<Step> {
    let mut request = RequestStep::new(method(c)?, cap(c, "path"));
    request.user = opt(c, "user");
    request.admin = c.name("admin").is_some();
    request.encode_url = c.name("raw").is_none();
    request.method_override = c.name("tunnel").is_some();

    match c.name("with").map(|m| m.as_str()) {
        Some("JSON") => request.body = Some(Value::String(a.doc("sends with JSON")?)),
        Some("text") => {
            request.body = Some(Value::String(a.doc("sends with text")?));
            request.media_type = Some("text/plain".to_string());
        }
        Some("query params") => {
            request.query = a
                .table("sends with query params")?
                .rows()
                .iter()
                .map(|row| {
                    Ok(QueryParam {
                        name: row.get_str("name")?,
                        value: row.get_str("value")?,
                    })
                })
                .collect::<AccordResult<_>>()?;
        }
        Some(_) => request.file = opt(c, "file").map(PathBuf::from),
        None => {}
    }
    Ok(Step::Request(request))
}

fn build_poll(c: &Captures<'_>, a: &PhraseArgs<'_>) -> AccordResult<Step> {
    static STATUS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^status is (\d{3})$").expect("status pattern is valid"));
    static AT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"^the JSON at "([^"]+)" (equals|contains|has) (.+?)(?: elements?)?$"#)
            .expect("condition pattern is valid")
    });

    let cond = cap(c, "cond");
    let until = if let Some(m) = STATUS.captures(&cond) {
        PollCondition::Status(number_of(&m[1])?)
    } else if cond == "the JSON is equivalent to" {
        PollCondition::EquivalentTo(Value::String(a.doc("polls until the JSON is equivalent to")?))
    } else if let Some(m) = AT.captures(&cond) {
        let path = m[1].to_string();
        let value = m[3].to_string();
        match &m[2] {
            "has" => PollCondition::HasSize {
                path,
                size: number_of(&value)?,
            },
            "contains" => PollCondition::Contains {
                path,
                value: unquote(&value),
            },
            _ => match value.trim().parse::<f64>() {
                Ok(n) => PollCondition::EqualsNumber { path, value: n },
                Err(_) => PollCondition::Equals {
                    path,
                    value: unquote(&value),
                },
            },
        }
    } else {
        return Err(AccordError::UnknownPhrase(format!("poll condition: {}", cond)));
    };

    Ok(Step::RequestUntil(PollRequestStep {
        path: cap(c, "path"),
        user: opt(c, "user"),
        admin: c.name("admin").is_some(),
        within_seconds: opt_number(c, "secs")?,
        until,
    }))
}

fn number_of<T: FromStr>(raw: &str) -> AccordResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| AccordError::InvalidConfig(format!("\"{}\" is not a number", raw)))
}

fn build_json_assertion(c: &Captures<'_>, a: &PhraseArgs<'_>) -> AccordResult<Step> {
    static SIZE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^has (?P<least>at least )?(?P<n>\d+) elements?$").expect("size pattern is valid")
    });

    let rest = cap(c, "rest");
    let mut check = JsonAssertion::at(opt(c, "path").unwrap_or_else(|| "$".to_string()));

    match rest.as_str() {
        "to equal" => check.equal_to_json = Some(Value::String(a.doc("to equal")?)),
        "to be equivalent to" => check.equivalent_to = Some(Value::String(a.doc("to be equivalent to")?)),
        "is not present" => check.present = Some(false),
        "is present" => check.present = Some(true),
        "is not empty" => check.not_empty = Some(true),
        "is not null" => check.is_null = Some(false),
        "is null" => check.is_null = Some(true),
        "is today's date" => check.today = Some(true),
        _ => {
            if let Some(v) = rest.strip_prefix("to not equal ") {
                check.not_equals = Some(json::literal(v));
            } else if let Some(v) = rest.strip_prefix("to equal ") {
                check.equals = Some(json::literal(v));
            } else if let Some(v) = rest.strip_prefix("starts with ") {
                check.starts_with = Some(unquote(v));
            } else if let Some(v) = rest.strip_prefix("matches regex ") {
                check.matches = Some(unquote(v));
            } else if let Some(v) = rest.strip_prefix("does not contain ") {
                check.not_contains = Some(json::literal(v));
            } else if let Some(v) = rest.strip_prefix("contains ") {
                check.contains = Some(json::literal(v));
            } else if let Some(m) = SIZE.captures(&rest) {
                let n = number_of(&m["n"])?;
                if m.name("least").is_some() {
                    check.at_least = Some(n);
                } else {
                    check.size = Some(n);
                }
            } else {
                return Err(AccordError::UnknownPhrase(format!("I expect the JSON {}", rest)));
            }
        }
    }
    Ok(Step::ExpectJson(check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Rounding;
    use serde_json::json;
    use test_case::test_case;

    fn step(phrase: &str) -> Step {
        parse(phrase, None, None).unwrap()
    }

    #[test]
    fn test_headers() {
        assert!(matches!(
            step(r#"Given permanent HTTP header "X-Tenant: acme""#),
            Step::PermanentHeader { name, value } if name == "X-Tenant" && value == "acme"
        ));
        assert!(matches!(
            step(r#"And HTTP header "Accept-Language: de""#),
            Step::Header { name, .. } if name == "Accept-Language"
        ));
    }

    #[test]
    fn test_request_variants() {
        let Step::Request(req) = step(r#"When user with JWT "ADMIN" sends GET "/orders/widgets/${id}""#) else {
            panic!("expected a request");
        };
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.user.as_deref(), Some("ADMIN"));
        assert!(req.encode_url);

        let Step::Request(req) = step(r#"anonymous sends GET "/orders/search?q=${Q}" without encoding the url"#) else {
            panic!("expected a request");
        };
        assert!(req.user.is_none());
        assert!(!req.encode_url);

        let Step::Request(req) = parse(
            r#"user with JWT "T" sends PATCH as POST "/orders/widgets/1" with JSON:"#,
            Some(r#"{"name": "x"}"#),
            None,
        )
        .unwrap() else {
            panic!("expected a request");
        };
        assert!(req.method_override);
        assert_eq!(req.body, Some(json!(r#"{"name": "x"}"#)));
    }

    #[test]
    fn test_query_params_table() {
        let table = DataTable::parse_pipe("| name | value |\n| page | 2 |\n| size | 10 |").unwrap();
        let Step::Request(req) = parse(
            r#"anonymous sends GET "/orders/widgets" with query params:"#,
            None,
            Some(table),
        )
        .unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.query.len(), 2);
        assert_eq!(req.query[1].name, "size");
    }

    #[test]
    fn test_missing_doc_is_configuration_error() {
        let err = parse(r#"anonymous sends POST "/orders/widgets" with JSON:"#, None, None).unwrap_err();
        assert!(matches!(err, AccordError::InvalidConfig(_)));
    }

    #[test_case(r#"I expect the JSON at "$.name" to equal "x""#; "equals string")]
    #[test_case(r#"I expect the JSON at "$.n" to equal 5"#; "equals number")]
    #[test_case(r#"I expect the JSON at "$.items" has at least 2 elements"#; "at least")]
    #[test_case(r#"I expect the JSON at "$.items" has 3 elements"#; "size")]
    #[test_case(r#"I expect the JSON at "$.gone" is not present"#; "absent")]
    #[test_case(r#"I expect the JSON at "$.code" matches regex "^[A-Z]+$""#; "regex")]
    fn test_json_assertions_parse(phrase: &str) {
        assert!(matches!(step(phrase), Step::ExpectJson(_)));
    }

    #[test]
    fn test_json_assertion_fields() {
        let Step::ExpectJson(check) = step(r#"I expect the JSON at "$.n" to equal 5"#) else {
            panic!("expected a JSON check");
        };
        assert_eq!(check.path, "$.n");
        assert_eq!(check.equals, Some(json!(5)));

        let Step::ExpectJson(check) = step(r#"I expect the JSON at "$.items" has at least 2 elements"#) else {
            panic!("expected a JSON check");
        };
        assert_eq!(check.at_least, Some(2));
        assert_eq!(check.size, None);
    }

    #[test]
    fn test_queue_phrases() {
        assert!(matches!(
            step(r#"I wait up to 30 seconds for all of the queues to process"#),
            Step::WaitForQueuesToDrain { within_seconds: Some(30) }
        ));
        assert!(matches!(
            step(r#"I wait for 2 messages on queue "events""#),
            Step::ExpectMessages { count: 2, within_seconds: None, .. }
        ));
        assert!(matches!(
            step(r#"I expect 0 messages on queue "events""#),
            Step::ExpectMessages { count: 0, within_seconds: Some(0), .. }
        ));
    }

    #[test]
    fn test_poll_phrase() {
        let Step::RequestUntil(poll) = step(
            r#"user with JWT "T" polls "/orders/jobs/1" for up to 10 seconds until the JSON at "$.state" equals "DONE""#,
        ) else {
            panic!("expected a poll");
        };
        assert_eq!(poll.within_seconds, Some(10));
        assert!(matches!(poll.until, PollCondition::Equals { value, .. } if value == "DONE"));
    }

    #[test]
    fn test_store_date() {
        assert!(matches!(
            step(r#"I store the date 2 hours before now as "START""#),
            Step::StoreDateTime { hours: -2, .. }
        ));
    }

    #[test]
    fn test_store_rounded_field() {
        assert!(matches!(
            step(r#"I store JSON field at "$.total" rounded to halfdown with scale 2 as "TOTAL""#),
            Step::StoreRoundedField { rounding: Rounding::HalfDown, scale: 2, ref path, .. } if path == "$.total"
        ));
        assert!(matches!(
            step(r#"I store JSON field at "$.total" as "TOTAL""#),
            Step::StoreField { .. }
        ));
    }

    #[test]
    fn test_template_and_mail_tables() {
        let params = DataTable::parse_pipe("| placeholder | value |\n| {{name}} | ${NAME} |").unwrap();
        let Step::StoreTemplate { file, params, .. } = parse(
            r#"I store the rendered template "mails/welcome.html" as "BODY" using params"#,
            None,
            Some(params),
        )
        .unwrap() else {
            panic!("expected a template step");
        };
        assert_eq!(file, PathBuf::from("mails/welcome.html"));
        assert_eq!(params["{{name}}"], "${NAME}");

        let rows = DataTable::parse_pipe("| email | content |\n| a@shop.test | [] |").unwrap();
        assert!(matches!(
            parse("Then I expect the following users to have the mail content:", None, Some(rows)).unwrap(),
            Step::ExpectMailTable { ref rows } if rows.len() == 1
        ));
    }

    #[test]
    fn test_unknown_phrase() {
        let err = parse("the moon is made of cheese", None, None).unwrap_err();
        assert!(matches!(err, AccordError::UnknownPhrase(_)));
    }
}
