//! Step execution
//!
//! Every handler takes the shared [`Session`] plus the [`Worker`] it runs on.
//! Table rows and polling attempts get workers of their own, so one-time
//! headers and responses never leak between concurrent requests.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::context::{Context, Worker};
use crate::error::{ensure, AccordError, AccordResult};
use crate::http::{DispatchRequest, Headers, Method, Response};
use crate::json::{self, JsonPath};
use crate::poll::{self, RetryPolicy};
use crate::session::Session;
use crate::spec::{
    BodyAssertion, JsonAssertion, PollCondition, PollRequestStep, QueryParam, RequestStep, Rounding,
    Step, TableRequestStep,
};
use crate::table::{process_rows, DataTable, TableRow};

/// Column prefix marking a per-row one-time header in table requests
pub const HEADER_COLUMN_PREFIX: &str = "header:";

const OCTET_STREAM: &str = "application/octet-stream";
const DEFAULT_APPROX_DELTA: f64 = 1e-6;

pub async fn execute(session: &Session, worker: &mut Worker, step: &Step) -> AccordResult<()> {
    let ctx = session.context();
    match step {
        Step::PermanentHeader { name, value } => {
            session.set_permanent_header(name.clone(), ctx.resolve(value, false)?);
        }
        Step::Header { name, value } => {
            worker.set_one_time_header(name.clone(), ctx.resolve(value, false)?);
        }
        Step::StoreValue { name, value } => {
            ctx.put(name.clone(), resolve_value(ctx, value)?);
        }
        Step::StoreJson { name, json } => {
            ctx.put(name.clone(), resolve_document(ctx, json)?);
        }
        Step::StoreField { name, path } => {
            let doc = worker.last_response()?.json()?;
            let value = json::extract(&doc, &ctx.resolve(path, false)?)?;
            ctx.put(name.clone(), value);
        }
        Step::StoreRoundedField {
            name,
            path,
            rounding,
            scale,
        } => {
            let doc = worker.last_response()?.json()?;
            let path = ctx.resolve(path, false)?;
            let value = json::extract(&doc, &path)?;
            let number = value
                .as_f64()
                .ok_or_else(|| fail(&doc, format!("Expected {} to be a number but was {}", path, value)))?;
            ctx.put(name.clone(), round_decimal(number, *scale, *rounding)?);
        }
        Step::StoreTemplate { name, file, params } => {
            let params = params
                .iter()
                .map(|(placeholder, value)| -> AccordResult<(String, String)> {
                    Ok((placeholder.clone(), ctx.resolve(value, false)?))
                })
                .collect::<AccordResult<Vec<_>>>()?;
            ctx.put(name.clone(), render_template(session, file, params)?);
        }
        Step::StoreRelativeUrl { name, url } => {
            ctx.put(name.clone(), relative_url(&ctx.resolve(url, false)?)?);
        }
        Step::StoreHeader { name, header } => {
            let value = worker
                .last_response()?
                .header(header)
                .ok_or_else(|| AccordError::assertion(format!("No {} header in response", header)))?
                .to_string();
            ctx.put(name.clone(), value);
        }
        Step::StoreDateTime { name, hours, format } => {
            let when = Local::now() + chrono::Duration::hours(*hours);
            let mut formatted = String::new();
            write!(formatted, "{}", when.format(format))
                .map_err(|_| AccordError::InvalidConfig(format!("Invalid date format: {}", format)))?;
            ctx.put(name.clone(), formatted);
        }
        Step::StoreHtmlElement {
            name,
            address,
            selector,
            attribute,
        } => {
            let mailbox = session.mailbox()?;
            let address = ctx.resolve(address, false)?;
            let (address, selector, attribute) = (address.as_str(), selector.as_str(), attribute.as_deref());
            let value = poll::retry(RetryPolicy::default(), "Mail element", |_| async move {
                mailbox.html_element_at(address, selector, attribute).await
            })
            .await?;
            ctx.put(name.clone(), value);
        }
        Step::RecreateData { app, kind } => {
            let app = session.registry().get(app)?;
            let req = DispatchRequest::new(Method::Post, kind.endpoint()).admin().text("");
            let resp = session
                .dispatcher()
                .dispatch(app, &req, &session.permanent_headers(), &mut worker.one_time_headers)
                .await?;
            check_status(&resp, 204)?;
            worker.set_response(resp);
        }
        Step::Login { app, users } => {
            let path = format!("/{}/public/login", app);
            let path = path.as_str();
            process_rows(users, session.settings().row_concurrency, |row| login(session, path, row)).await?;
        }
        Step::Request(request) => {
            let resp = send(session, worker, request).await?;
            if let Some(status) = request.expect_status {
                check_status(&resp, status)?;
            }
        }
        Step::RequestTable(table) => request_table(session, table).await?,
        Step::RequestUntil(poll) => {
            let resp = request_until(session, worker, poll).await?;
            worker.set_response(resp);
        }
        Step::PutSignedUrl { url, file, media_type } => {
            let storage = session.storage()?;
            let url = storage.transform_signed_url(&ctx.resolve(url, false)?);
            let req = DispatchRequest::new(Method::Put, url.as_str())
                .bytes(session.read_resource(file)?)
                .media_type(media_type.as_deref().unwrap_or(OCTET_STREAM));
            let resp = session.dispatcher().send_to_url(&url, &req).await?;
            let status = resp.status;
            worker.set_response(resp);
            ensure((200..300).contains(&status), || {
                format!("Upload to signed url failed with HTTP status {}", status)
            })?;
        }
        Step::ExpectStatus { status } => check_status(worker.last_response()?, *status)?,
        Step::ExpectJson(check) => {
            let doc = worker.last_response()?.json()?;
            check_json(ctx, &doc, check)?;
        }
        Step::ExpectBody(check) => check_body(ctx, worker.last_response()?, check)?,
        Step::ExpectHeader { name, contains, equals } => {
            let resp = worker.last_response()?;
            let actual = resp
                .header(name)
                .ok_or_else(|| AccordError::assertion(format!("No {} header in response", name)))?;
            if let Some(expected) = contains {
                let expected = ctx.resolve(expected, false)?;
                ensure(actual.contains(&expected), || {
                    format!("Header {} is \"{}\", expected it to contain \"{}\"", name, actual, expected)
                })?;
            }
            if let Some(expected) = equals {
                let expected = ctx.resolve(expected, false)?;
                ensure(actual == expected, || {
                    format!("Header {} is \"{}\", expected \"{}\"", name, actual, expected)
                })?;
            }
        }
        Step::SortJson { path, by, descending } => {
            let resp = worker.last_response_mut()?;
            let mut doc = resp.json()?;
            json::sort_at_path(&mut doc, path, by, !descending)?;
            resp.body = doc.to_string();
        }
        Step::QueueHeader { name, value } => {
            session.set_queue_header(name.clone(), ctx.resolve(value, false)?);
        }
        Step::SendMessage {
            queue,
            group_id,
            body,
            file,
        } => {
            let payload = match (body, file) {
                (_, Some(file)) => ctx.resolve(&session.read_resource_text(file)?, false)?,
                (Some(Value::String(text)), None) => ctx.resolve(text, false)?,
                (Some(value), None) => resolve_value(ctx, value)?.to_string(),
                (None, None) => {
                    return Err(AccordError::InvalidConfig(
                        "send_message needs a body or a file".to_string(),
                    ))
                }
            };
            let group_id = group_id.as_deref().map(|g| ctx.resolve(g, false)).transpose()?;
            session
                .queue()?
                .send(queue, group_id.as_deref(), &payload, &session.queue_headers())
                .await?;
        }
        Step::PurgeQueue { queue } => session.queue()?.purge(queue).await?,
        Step::PurgeAllQueues => session.queue()?.purge_all().await?,
        Step::ExpectMessages {
            queue,
            count,
            within_seconds,
        } => {
            let mq = session.queue()?;
            let (queue, count) = (queue.as_str(), *count);
            poll::retry(RetryPolicy::for_seconds(*within_seconds), "Queue message count", |_| async move {
                let pending = mq.pending_count(queue).await?;
                ensure(pending == count, || {
                    format!("Expected {} message(s) on queue {} but found {}", count, queue, pending)
                })
            })
            .await?;
        }
        Step::ExpectQueueMessages { queue, expected } => {
            let expected = match resolve_document(ctx, expected)? {
                Value::Array(items) => items,
                single => vec![single],
            };
            let received = session.queue()?.receive_up_to(queue, expected.len()).await?;
            let actual = Value::Array(received.iter().map(|m| m.to_json()).collect());
            json::assert_equivalent_lenient(&Value::Array(expected), &actual)?;
        }
        Step::WaitForQueuesToDrain { within_seconds } => {
            poll::wait_for_drain(session.queue()?, *within_seconds).await?;
        }
        Step::CreateBucket { bucket } => session.storage()?.create_bucket(bucket).await?,
        Step::PutObject { bucket, key, body, file } => {
            let storage = session.storage()?;
            let key = ctx.resolve(key, false)?;
            match (body, file) {
                (_, Some(file)) => {
                    storage.put_bytes(bucket, &key, session.read_resource(file)?).await?
                }
                (Some(text), None) => storage.put_text(bucket, &key, &ctx.resolve(text, false)?).await?,
                (None, None) => {
                    return Err(AccordError::InvalidConfig(
                        "put_object needs a body or a file".to_string(),
                    ))
                }
            }
        }
        Step::ExpectObject { bucket, key, exists } => {
            let key = ctx.resolve(key, false)?;
            let found = session.storage()?.exists(bucket, &key).await?;
            ensure(found == *exists, || {
                if *exists {
                    format!("Key {} does not exist in bucket {}", key, bucket)
                } else {
                    format!("Key {} unexpectedly exists in bucket {}", key, bucket)
                }
            })?;
        }
        Step::ClearMailbox { addresses } => {
            let mailbox = session.mailbox()?;
            for address in addresses {
                mailbox.clear(&ctx.resolve(address, false)?).await?;
            }
        }
        Step::ExpectMail {
            address,
            expected,
            within_seconds,
        } => expect_mail(session, address, expected, *within_seconds).await?,
        Step::ExpectMailTable { rows } => {
            process_rows(rows, session.settings().row_concurrency, |row| async move {
                let address = row.get_str("email")?;
                let content = Value::String(row.get_str("content")?);
                expect_mail(session, &address, &content, None).await
            })
            .await?;
        }
        Step::ExpectFirstMailContains {
            address,
            text,
            within_seconds,
        } => {
            let mailbox = session.mailbox()?;
            let address = ctx.resolve(address, false)?;
            let text = ctx.resolve(text, false)?;
            let (address, text) = (address.as_str(), text.as_str());
            poll::retry(RetryPolicy::for_seconds(*within_seconds), "First mail", |_| async move {
                let message = mailbox
                    .first_message(address)
                    .await?
                    .ok_or_else(|| AccordError::assertion(format!("No message for {}", address)))?;
                let content = message.html_content.ok_or_else(|| {
                    AccordError::assertion(format!("First message for {} had no html content", address))
                })?;
                ensure(content.contains(text), || {
                    format!("First message for {} does not contain \"{}\"", address, text)
                })
            })
            .await?;
        }
        Step::Sql { database, statement } => {
            session.database(database)?.execute(&ctx.resolve(statement, false)?)?;
        }
        Step::SqlInsert { database, table, rows } => {
            let rows = rows
                .raw_rows()
                .iter()
                .map(|row| -> AccordResult<Map<String, Value>> {
                    match resolve_value(ctx, &Value::Object(row.clone()))? {
                        Value::Object(resolved) => Ok(resolved),
                        _ => Ok(row.clone()),
                    }
                })
                .collect::<AccordResult<Vec<_>>>()?;
            session.database(database)?.insert_rows(table, &DataTable::new(rows))?;
        }
        Step::SqlQuery { database, query } => {
            let rows = session.database(database)?.query_json(&ctx.resolve(query, false)?)?;
            worker.set_response(Response::new(200, rows.to_string()));
        }
        Step::TruncateTables { database } => session.database(database)?.truncate_all_tables()?,
        Step::Log { message } => info!("{}", ctx.resolve(message, false)?),
        Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
    }
    Ok(())
}

/// Strings resolved recursively through arrays and objects
pub fn resolve_value(ctx: &Context, value: &Value) -> AccordResult<Value> {
    Ok(match value {
        Value::String(s) => Value::String(ctx.resolve(s, false)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(ctx, v))
                .collect::<AccordResult<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value(ctx, v)?)))
                .collect::<AccordResult<Map<_, _>>>()?,
        ),
        other => other.clone(),
    })
}

/// A document given as text is resolved first, then parsed
pub fn resolve_document(ctx: &Context, value: &Value) -> AccordResult<Value> {
    match value {
        Value::String(text) => Ok(json::literal(&ctx.resolve(text, false)?)),
        other => resolve_value(ctx, other),
    }
}

/// Resource text with CRLF line endings and every placeholder replaced
fn render_template(
    session: &Session,
    file: &Path,
    params: impl IntoIterator<Item = (String, String)>,
) -> AccordResult<String> {
    let text = session.read_resource_text(file)?;
    let mut rendered = text.replace("\r\n", "\n").replace('\n', "\r\n");
    for (placeholder, value) in params {
        rendered = rendered.replace(&placeholder, &value);
    }
    Ok(rendered)
}

/// An expected mail whose `htmlContent` names a resource gets the rendered
/// file, filled in from its `params`
fn expand_expected_mail(session: &Session, mail: Value) -> AccordResult<Value> {
    let Value::Object(mut mail) = mail else {
        return Ok(mail);
    };
    let file = mail
        .get("htmlContent")
        .and_then(Value::as_str)
        .map(PathBuf::from);
    if let Some(file) = file {
        let params = match mail.remove("params") {
            Some(Value::Object(params)) => params
                .into_iter()
                .map(|(placeholder, value)| (placeholder, json::text(&value)))
                .collect(),
            _ => Vec::new(),
        };
        let html = render_template(session, &file, params)?;
        mail.insert("htmlContent".to_string(), Value::String(html));
    }
    Ok(Value::Object(mail))
}

async fn expect_mail(
    session: &Session,
    address: &str,
    expected: &Value,
    within_seconds: Option<u64>,
) -> AccordResult<()> {
    let ctx = session.context();
    let mailbox = session.mailbox()?;
    let expected = match resolve_document(ctx, expected)? {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|mail| expand_expected_mail(session, mail))
                .collect::<AccordResult<_>>()?,
        ),
        single => expand_expected_mail(session, single)?,
    };
    let expected = &expected;
    let address = ctx.resolve(address, false)?;
    let address = address.as_str();
    poll::retry(RetryPolicy::for_seconds(within_seconds), "Mailbox contents", |_| async move {
        let messages = serde_json::to_value(mailbox.messages(address).await?)?;
        json::assert_equivalent_lenient(expected, &messages)
    })
    .await
}

fn apply_user(ctx: &Context, worker: &mut Worker, user: Option<&str>) -> AccordResult<()> {
    if let Some(user) = user {
        let token = ctx.get_string(user)?;
        worker.set_one_time_header("Authorization", format!("Bearer {}", token));
    }
    Ok(())
}

fn build_query(ctx: &Context, params: &[QueryParam], encode: bool) -> AccordResult<String> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(params.len());
    for param in params {
        if !seen.insert(param.name.as_str()) {
            return Err(AccordError::InvalidConfig(format!(
                "Duplicate query parameter: {}",
                param.name
            )));
        }
        let value = ctx.resolve(&param.value, false)?;
        if encode {
            pairs.push(format!(
                "{}={}",
                urlencoding::encode(&param.name),
                urlencoding::encode(&value)
            ));
        } else {
            pairs.push(format!("{}={}", param.name, value));
        }
    }
    Ok(pairs.join("&"))
}

fn with_query(path: String, query: &str) -> String {
    if query.is_empty() {
        path
    } else if path.contains('?') {
        format!("{}&{}", path, query)
    } else {
        format!("{}?{}", path, query)
    }
}

async fn send(session: &Session, worker: &mut Worker, request: &RequestStep) -> AccordResult<Response> {
    let ctx = session.context();
    let path = ctx.resolve(&request.path, request.encode_url)?;
    let path = with_query(path, &build_query(ctx, &request.query, request.encode_url)?);
    let app = session.registry().get_for_path(&path)?;

    let mut req = DispatchRequest::new(request.method, path.as_str()).on_admin(request.admin);
    if let Some(file) = &request.file {
        req = req
            .bytes(session.read_resource(file)?)
            .media_type(request.media_type.as_deref().unwrap_or(OCTET_STREAM));
    } else if let Some(body) = &request.body {
        let text = match body {
            Value::String(text) => ctx.resolve(text, false)?,
            other => resolve_value(ctx, other)?.to_string(),
        };
        req = req.text(text);
        if let Some(media_type) = &request.media_type {
            req = req.media_type(media_type.as_str());
        }
    }
    if request.method_override {
        req = req.force_method_override();
    }

    apply_user(ctx, worker, request.user.as_deref())?;
    let resp = session
        .dispatcher()
        .dispatch(app, &req, &session.permanent_headers(), &mut worker.one_time_headers)
        .await?;
    debug!("Response {}: {}", resp.status, resp.body);
    worker.set_response(resp.clone());
    Ok(resp)
}

async fn login(session: &Session, path: &str, row: TableRow) -> AccordResult<()> {
    let body = json!({
        "name": row.get_str("name")?,
        "password": row.get_str("password")?,
    });
    let token_name = row.get_str("jwtTokenName")?;

    let mut worker = Worker::new();
    let mut request = RequestStep::new(Method::Post, path);
    request.body = Some(body);
    let resp = send(session, &mut worker, &request).await?;
    check_status(&resp, 200)?;
    let token = json::extract(&resp.json()?, "$.token")?;
    session.context().put(token_name, token);
    Ok(())
}

async fn request_table(session: &Session, table: &TableRequestStep) -> AccordResult<()> {
    process_rows(&table.rows, session.settings().row_concurrency, |row| {
        request_row(session, table, row)
    })
    .await
}

async fn request_row(session: &Session, table: &TableRequestStep, row: TableRow) -> AccordResult<()> {
    let mut worker = Worker::new();
    let mut data = match row.to_json(table.nested_json) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let header_columns: Vec<String> = data
        .keys()
        .filter(|k| k.starts_with(HEADER_COLUMN_PREFIX))
        .cloned()
        .collect();
    for column in header_columns {
        if let Some(value) = data.remove(&column) {
            let name = &column[HEADER_COLUMN_PREFIX.len()..];
            worker.set_one_time_header(name, session.context().resolve(&json::text(&value), false)?);
        }
    }

    let mut request = RequestStep::new(table.method, table.path.as_str());
    request.user = table.user.clone();
    request.admin = table.admin;
    if matches!(table.method, Method::Post | Method::Put | Method::Patch) {
        request.body = Some(Value::Object(data));
    }

    let resp = send(session, &mut worker, &request).await?;
    match table.expect_status {
        Some(status) => check_status(&resp, status)?,
        None => ensure((200..300).contains(&resp.status), || {
            format!("Row {} failed with HTTP status {}: {}", row.index + 1, resp.status, resp.body)
        })?,
    }

    if let Some(store) = &table.store {
        let value = json::extract(&resp.json()?, &store.field)?;
        session.context().put(row.ordinal_name(&store.prefix), value);
    }
    Ok(())
}

async fn request_until(
    session: &Session,
    worker: &mut Worker,
    poll: &PollRequestStep,
) -> AccordResult<Response> {
    let base_headers = &worker.one_time_headers;
    let label = format!("GET {}", poll.path);

    let result = poll::retry(RetryPolicy::for_seconds(poll.within_seconds), &label, |_| {
        poll_attempt(session, base_headers, poll)
    })
    .await;

    worker.one_time_headers.clear();
    result
}

/// One polling request on a fresh worker carrying a copy of the caller's headers
async fn poll_attempt(
    session: &Session,
    headers: &Headers,
    poll: &PollRequestStep,
) -> AccordResult<Response> {
    let mut attempt = Worker::new();
    attempt.one_time_headers = headers.clone();
    let mut request = RequestStep::new(Method::Get, poll.path.as_str());
    request.user = poll.user.clone();
    request.admin = poll.admin;

    let resp = send(session, &mut attempt, &request).await?;
    check_condition(session.context(), &resp, &poll.until)?;
    Ok(resp)
}

/// Checked against whatever response arrives, whatever its status
fn check_condition(ctx: &Context, resp: &Response, until: &PollCondition) -> AccordResult<()> {
    if let PollCondition::Status(status) = until {
        return check_status(resp, *status);
    }
    let doc = resp.json()?;

    match until {
        PollCondition::Status(_) => Ok(()),
        PollCondition::Equals { path, value } => {
            let actual = json::extract(&doc, path)?;
            let expected = Value::String(ctx.resolve(value, false)?);
            ensure(values_equal(&expected, &actual), || {
                format!("Expected {} to equal {} but was {}", path, json::text(&expected), actual)
            })
        }
        PollCondition::EqualsNumber { path, value } => {
            let actual = json::extract(&doc, path)?;
            ensure(actual.as_f64() == Some(*value), || {
                format!("Expected {} to equal {} but was {}", path, value, actual)
            })
        }
        PollCondition::HasSize { path, size } => json::assert_array_size(&doc, path, *size),
        PollCondition::Contains { path, value } => {
            json::assert_contains(&doc, path, &Value::String(ctx.resolve(value, false)?))
        }
        PollCondition::EquivalentTo(expected) => {
            json::assert_equivalent_lenient(&resolve_document(ctx, expected)?, &doc)
        }
    }
}

fn check_status(resp: &Response, expected: u16) -> AccordResult<()> {
    if resp.status != expected {
        info!("Unexpected response body:\n{}", resp.body);
        return Err(AccordError::assertion(format!(
            "Expected HTTP status {} but got {}",
            expected, resp.status
        )));
    }
    Ok(())
}

/// Numbers compare numerically; a string compares against the text form
fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => e.as_f64() == a.as_f64(),
        (Value::String(e), actual) if !actual.is_null() => *e == json::text(actual),
        (e, a) => e == a,
    }
}

fn fail(doc: &Value, message: String) -> AccordError {
    json::log_document(doc);
    AccordError::assertion(message)
}

/// Every populated field of `check` must hold for the value at its path
pub fn check_json(ctx: &Context, doc: &Value, check: &JsonAssertion) -> AccordResult<()> {
    let path = ctx.resolve(&check.path, false)?;
    let parsed = JsonPath::parse(&path)?;
    // a wildcard that matches nothing counts as absent
    let selected = parsed
        .select(doc)
        .filter(|v| parsed.is_definite() || !matches!(v, Value::Array(items) if items.is_empty()));

    if let Some(present) = check.present {
        if selected.is_some() != present {
            let expected = if present { "present" } else { "absent" };
            return Err(fail(doc, format!("Expected {} to be {}", path, expected)));
        }
    }
    if let Some(is_null) = check.is_null {
        let null = matches!(selected, None | Some(Value::Null));
        if null != is_null {
            return Err(fail(
                doc,
                format!("Expected {} {}to be null", path, if is_null { "" } else { "not " }),
            ));
        }
    }

    let actual = || json::extract(doc, &path);

    if let Some(expected) = &check.equals {
        let expected = resolve_value(ctx, expected)?;
        let actual = actual()?;
        if !values_equal(&expected, &actual) {
            return Err(fail(doc, format!("Expected {} to equal {} but was {}", path, expected, actual)));
        }
    }
    if let Some(unexpected) = &check.not_equals {
        let unexpected = resolve_value(ctx, unexpected)?;
        let actual = actual()?;
        if values_equal(&unexpected, &actual) {
            return Err(fail(doc, format!("Expected {} not to equal {}", path, unexpected)));
        }
    }
    if let Some(expected) = &check.equal_to_json {
        json::assert_equal_strict(&resolve_document(ctx, expected)?, &actual()?)?;
    }
    if let Some(expected) = &check.equivalent_to {
        json::assert_equivalent_lenient(&resolve_document(ctx, expected)?, &actual()?)?;
    }
    if let Some(needle) = &check.contains {
        json::assert_contains(doc, &path, &resolve_value(ctx, needle)?)?;
    }
    if let Some(needle) = &check.not_contains {
        json::assert_not_contains(doc, &path, &resolve_value(ctx, needle)?)?;
    }
    if let Some(prefix) = &check.starts_with {
        let prefix = ctx.resolve(prefix, false)?;
        let text = json::text(&actual()?);
        if !text.starts_with(&prefix) {
            return Err(fail(doc, format!("Expected {} to start with {} but was {}", path, prefix, text)));
        }
    }
    if let Some(pattern) = &check.matches {
        let pattern = regex::Regex::new(&ctx.resolve(pattern, false)?)?;
        let text = json::text(&actual()?);
        if !pattern.is_match(&text) {
            return Err(fail(doc, format!("Expected {} to match {} but was {}", path, pattern, text)));
        }
    }
    if let Some(size) = check.size {
        json::assert_array_size(doc, &path, size)?;
    }
    if let Some(minimum) = check.at_least {
        json::assert_array_size_at_least(doc, &path, minimum)?;
    }
    if check.not_empty == Some(true) {
        let value = actual()?;
        let empty = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Err(fail(doc, format!("Expected {} not to be empty", path)));
        }
    }
    if let Some(target) = check.approx {
        let delta = check.delta.unwrap_or(DEFAULT_APPROX_DELTA);
        let value = actual()?;
        let within = value.as_f64().map(|n| (n - target).abs() <= delta).unwrap_or(false);
        if !within {
            return Err(fail(doc, format!("Expected {} to be {} ± {} but was {}", path, target, delta, value)));
        }
    }
    if check.today == Some(true) {
        let value = actual()?;
        let today = Local::now().date_naive();
        if local_date(&json::text(&value)) != Some(today) {
            return Err(fail(doc, format!("Expected {} to be today's date ({}) but was {}", path, today, value)));
        }
    }
    Ok(())
}

/// Rounds the shortest decimal form of `value` to `scale` places
pub fn round_decimal(value: f64, scale: u32, rounding: Rounding) -> AccordResult<String> {
    if !value.is_finite() {
        return Err(AccordError::assertion(format!("Cannot round {}", value)));
    }
    // f64 Display never uses an exponent
    let text = format!("{}", value.abs());
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let negative = value.is_sign_negative();
    let scale = scale as usize;

    let mut digits: Vec<u8> = int_part.bytes().map(|b| b - b'0').collect();
    let mut int_len = digits.len();
    let frac: Vec<u8> = frac_part.bytes().map(|b| b - b'0').collect();
    let kept = frac.len().min(scale);
    digits.extend_from_slice(&frac[..kept]);
    digits.resize(int_len + scale, 0);

    let dropped = &frac[kept..];
    let discarded = dropped.iter().any(|&d| d != 0);
    let round_away = match rounding {
        Rounding::Floor => negative && discarded,
        Rounding::Ceiling => !negative && discarded,
        Rounding::HalfUp => dropped.first().is_some_and(|&d| d >= 5),
        Rounding::HalfDown => match dropped.split_first() {
            Some((&first, rest)) => first > 5 || (first == 5 && rest.iter().any(|&d| d != 0)),
            None => false,
        },
    };
    if round_away {
        let mut carry = true;
        for digit in digits.iter_mut().rev() {
            if *digit == 9 {
                *digit = 0;
            } else {
                *digit += 1;
                carry = false;
                break;
            }
        }
        if carry {
            digits.insert(0, 1);
            int_len += 1;
        }
    }

    let to_text = |ds: &[u8]| ds.iter().map(|d| char::from(b'0' + d)).collect::<String>();
    let mut out = String::new();
    if negative && digits.iter().any(|&d| d != 0) {
        out.push('-');
    }
    out.push_str(&to_text(&digits[..int_len]));
    if scale > 0 {
        out.push('.');
        out.push_str(&to_text(&digits[int_len..]));
    }
    Ok(out)
}

/// Local calendar date of an RFC 3339 timestamp or a `YYYY-MM-DD` prefix
fn local_date(text: &str) -> Option<NaiveDate> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Local).date_naive());
    }
    text.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

fn check_body(ctx: &Context, resp: &Response, check: &BodyAssertion) -> AccordResult<()> {
    if let Some(empty) = check.empty {
        let is_empty = resp.body.trim().is_empty();
        ensure(is_empty == empty, || {
            if empty {
                format!("Expected an empty response but got: {}", resp.body)
            } else {
                "Expected a response body".to_string()
            }
        })?;
    }
    if let Some(expected) = &check.equals {
        let expected = ctx.resolve(expected, false)?;
        ensure(resp.body == expected, || {
            format!("Expected body \"{}\" but got \"{}\"", expected, resp.body)
        })?;
    }
    if let Some(expected) = &check.equivalent_text {
        let expected = collapse_whitespace(&ctx.resolve(expected, false)?);
        let actual = collapse_whitespace(&resp.body);
        ensure(actual == expected, || {
            format!("Expected text \"{}\" but got \"{}\"", expected, actual)
        })?;
    }
    if let Some(needle) = &check.contains {
        let needle = ctx.resolve(needle, false)?;
        ensure(resp.body.contains(&needle), || {
            format!("Expected body to contain \"{}\": {}", needle, resp.body)
        })?;
    }
    if let Some(field) = &check.has_field {
        let doc = resp.json()?;
        ensure(doc.get(field).is_some(), || {
            json::log_document(&doc);
            format!("Expected JSON containing field {}", field)
        })?;
    }
    Ok(())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Path and query of an absolute URL
fn relative_url(raw: &str) -> AccordResult<String> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AccordError::InvalidConfig(format!("Invalid url {}: {}", raw, e)))?;
    Ok(match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerSettings;
    use crate::registry::AppRegistry;
    use test_case::test_case;

    fn session() -> Session {
        Session::new(AppRegistry::new(), RunnerSettings::default()).unwrap()
    }

    fn widget() -> Value {
        json!({
            "widgetId": "w-1",
            "count": 3,
            "price": 9.99,
            "state": null,
            "tags": ["red", "blue"],
            "owner": {"name": "alice", "email": "alice@example.com"},
            "created": Local::now().to_rfc3339()
        })
    }

    fn check(update: impl FnOnce(&mut JsonAssertion)) -> AccordResult<()> {
        let ctx = Context::new();
        ctx.put("OWNER", "alice");
        let mut assertion = JsonAssertion::at("$");
        update(&mut assertion);
        check_json(&ctx, &widget(), &assertion)
    }

    #[test]
    fn test_equals_resolves_and_compares_text() {
        assert!(check(|a| {
            a.path = "$.owner.name".into();
            a.equals = Some(json!("${OWNER}"));
        })
        .is_ok());
        assert!(check(|a| {
            a.path = "$.count".into();
            a.equals = Some(json!(3.0));
        })
        .is_ok());
        assert!(check(|a| {
            a.path = "$.count".into();
            a.equals = Some(json!("3"));
        })
        .is_ok());
        assert!(check(|a| {
            a.path = "$.count".into();
            a.not_equals = Some(json!(4));
        })
        .is_ok());
    }

    #[test]
    fn test_presence_and_null() {
        assert!(check(|a| {
            a.path = "$.missing".into();
            a.present = Some(false);
        })
        .is_ok());
        assert!(check(|a| {
            a.path = "$.state".into();
            a.is_null = Some(true);
        })
        .is_ok());
        let err = check(|a| {
            a.path = "$.widgetId".into();
            a.is_null = Some(true);
        })
        .unwrap_err();
        assert!(matches!(err, AccordError::AssertionFailed(_)));
    }

    #[test]
    fn test_empty_wildcard_match_is_absent() {
        assert!(check(|a| {
            a.path = "$.owner.addresses[*].city".into();
            a.present = Some(false);
        })
        .is_ok());
        assert!(check(|a| {
            a.path = "$.tags[*]".into();
            a.present = Some(false);
        })
        .is_err());
        assert!(check(|a| {
            a.path = "$.tags[*]".into();
            a.present = Some(true);
        })
        .is_ok());
    }

    #[test]
    fn test_poll_condition_ignores_status() {
        let ctx = Context::new();
        let gone = Response::new(404, r#"{"state": "GONE"}"#);
        let until = PollCondition::Equals {
            path: "$.state".into(),
            value: "GONE".into(),
        };
        assert!(check_condition(&ctx, &gone, &until).is_ok());

        let until = PollCondition::Equals {
            path: "$.state".into(),
            value: "DONE".into(),
        };
        assert!(matches!(
            check_condition(&ctx, &gone, &until),
            Err(AccordError::AssertionFailed(_))
        ));
        assert!(check_condition(&ctx, &gone, &PollCondition::Status(404)).is_ok());
    }

    #[test]
    fn test_missing_path_is_path_not_found() {
        let err = check(|a| {
            a.path = "$.nope".into();
            a.equals = Some(json!(1));
        })
        .unwrap_err();
        assert!(matches!(err, AccordError::PathNotFound { .. }));
    }

    #[test]
    fn test_passing_checks() {
        let cases: [(&str, fn(&mut JsonAssertion)); 10] = [
            ("contains", |a| {
                a.path = "$.tags".into();
                a.contains = Some(json!("red"));
            }),
            ("not contains", |a| {
                a.path = "$.tags".into();
                a.not_contains = Some(json!("green"));
            }),
            ("size", |a| {
                a.path = "$.tags".into();
                a.size = Some(2);
            }),
            ("at least", |a| {
                a.path = "$.tags".into();
                a.at_least = Some(1);
            }),
            ("regex", |a| {
                a.path = "$.owner.email".into();
                a.matches = Some("^[a-z]+@".into());
            }),
            ("prefix", |a| {
                a.path = "$.widgetId".into();
                a.starts_with = Some("w-".into());
            }),
            ("approx", |a| {
                a.path = "$.price".into();
                a.approx = Some(10.0);
                a.delta = Some(0.05);
            }),
            ("today", |a| {
                a.path = "$.created".into();
                a.today = Some(true);
            }),
            ("lenient", |a| {
                a.path = "$.owner".into();
                a.equivalent_to = Some(json!({"name": "alice"}));
            }),
            ("not empty", |a| {
                a.path = "$.tags".into();
                a.not_empty = Some(true);
            }),
        ];
        for (name, update) in cases {
            if let Err(e) = check(update) {
                panic!("{} failed: {}", name, e);
            }
        }
    }

    #[test]
    fn test_strict_equality_rejects_extra_fields() {
        let err = check(|a| {
            a.path = "$.owner".into();
            a.equal_to_json = Some(json!(r#"{"name": "${OWNER}"}"#));
        })
        .unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test_case(2.345, 2, Rounding::HalfUp, "2.35" ; "half up at five")]
    #[test_case(2.345, 2, Rounding::HalfDown, "2.34" ; "half down at five")]
    #[test_case(2.3451, 2, Rounding::HalfDown, "2.35" ; "half down above five")]
    #[test_case(1.201, 2, Rounding::Ceiling, "1.21" ; "ceiling")]
    #[test_case(-1.231, 1, Rounding::Floor, "-1.3" ; "floor of negative")]
    #[test_case(-1.231, 1, Rounding::Ceiling, "-1.2" ; "ceiling of negative")]
    #[test_case(9.999, 2, Rounding::HalfUp, "10.00" ; "carry into integer part")]
    #[test_case(5.0, 2, Rounding::Floor, "5.00" ; "pads to scale")]
    #[test_case(2.5, 0, Rounding::HalfDown, "2" ; "zero scale")]
    #[test_case(-0.001, 2, Rounding::HalfUp, "0.00" ; "no negative zero")]
    fn test_round_decimal(value: f64, scale: u32, rounding: Rounding, expected: &str) {
        assert_eq!(round_decimal(value, scale, rounding).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_store_rounded_field() {
        let session = session();
        let mut worker = Worker::new();
        worker.set_response(Response::new(200, r#"{"total": 12.3456, "name": "x"}"#));

        let step = Step::StoreRoundedField {
            name: "TOTAL".into(),
            path: "$.total".into(),
            rounding: Rounding::HalfUp,
            scale: 2,
        };
        execute(&session, &mut worker, &step).await.unwrap();
        assert_eq!(session.context().get_string("TOTAL").unwrap(), "12.35");

        let step = Step::StoreRoundedField {
            name: "NAME".into(),
            path: "$.name".into(),
            rounding: Rounding::Floor,
            scale: 0,
        };
        let err = execute(&session, &mut worker, &step).await.unwrap_err();
        assert!(matches!(err, AccordError::AssertionFailed(_)));
    }

    #[tokio::test]
    async fn test_store_rendered_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greeting.html"), "<p>Hello {{name}}</p>\n<p>{{code}}</p>\n").unwrap();
        let settings = RunnerSettings {
            resources_dir: dir.path().to_path_buf(),
            ..RunnerSettings::default()
        };
        let session = Session::new(AppRegistry::new(), settings).unwrap();
        session.context().put("NAME", "Alice");
        let mut worker = Worker::new();

        let step = Step::StoreTemplate {
            name: "BODY".into(),
            file: PathBuf::from("greeting.html"),
            params: [("{{name}}", "${NAME}"), ("{{code}}", "42")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        execute(&session, &mut worker, &step).await.unwrap();
        assert_eq!(
            session.context().get_string("BODY").unwrap(),
            "<p>Hello Alice</p>\r\n<p>42</p>\r\n"
        );
    }

    #[test]
    fn test_build_query() {
        let ctx = Context::new();
        ctx.put("Q", "a b");
        let params = vec![
            QueryParam { name: "q".into(), value: "${Q}".into() },
            QueryParam { name: "page".into(), value: "2".into() },
        ];
        assert_eq!(build_query(&ctx, &params, true).unwrap(), "q=a%20b&page=2");
        assert_eq!(build_query(&ctx, &params, false).unwrap(), "q=a b&page=2");
        assert_eq!(with_query("/a?x=1".into(), "y=2"), "/a?x=1&y=2");

        let duplicate = vec![params[1].clone(), params[1].clone()];
        assert!(matches!(
            build_query(&ctx, &duplicate, true),
            Err(AccordError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_relative_url() {
        assert_eq!(
            relative_url("http://localhost:8080/orders/widgets/1?expand=true").unwrap(),
            "/orders/widgets/1?expand=true"
        );
        assert!(relative_url("not a url").is_err());
    }

    #[test]
    fn test_body_checks() {
        let ctx = Context::new();
        let resp = Response::new(200, "  Hello\n   world ");
        check_body(
            &ctx,
            &resp,
            &BodyAssertion {
                equivalent_text: Some("Hello world".into()),
                contains: Some("world".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(check_body(
            &ctx,
            &resp,
            &BodyAssertion {
                empty: Some(true),
                ..Default::default()
            }
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_context_steps() {
        let session = session();
        let mut worker = Worker::new();
        worker.set_response(Response::new(200, r#"{"items": [{"id": 2}, {"id": 1}]}"#));

        execute(&session, &mut worker, &Step::StoreValue { name: "A".into(), value: json!("x") })
            .await
            .unwrap();
        execute(
            &session,
            &mut worker,
            &Step::StoreField { name: "FIRST".into(), path: "$.items[0].id".into() },
        )
        .await
        .unwrap();
        execute(
            &session,
            &mut worker,
            &Step::SortJson { path: "$.items".into(), by: "id".into(), descending: false },
        )
        .await
        .unwrap();

        assert_eq!(session.context().get_string("A").unwrap(), "x");
        assert_eq!(session.context().get("FIRST"), Some(json!(2)));
        assert_eq!(
            worker.last_response().unwrap().json().unwrap(),
            json!({"items": [{"id": 1}, {"id": 2}]})
        );
    }

    #[tokio::test]
    async fn test_sql_query_becomes_last_response() {
        let db = crate::fixtures::Database::open_memory("orders", vec![]).unwrap();
        let session = session().with_database(db);
        let mut worker = Worker::new();

        for step in [
            Step::Sql {
                database: "orders".into(),
                statement: "CREATE TABLE widget (id INTEGER, name TEXT)".into(),
            },
            Step::SqlInsert {
                database: "orders".into(),
                table: "widget".into(),
                rows: DataTable::parse_pipe("| id | name |\n| 1 | a |").unwrap(),
            },
            Step::SqlQuery {
                database: "orders".into(),
                query: "SELECT name FROM widget".into(),
            },
        ] {
            execute(&session, &mut worker, &step).await.unwrap();
        }
        // inserted cells are text
        assert_eq!(worker.last_response().unwrap().json().unwrap(), json!([{"name": "a"}]));
    }

    #[tokio::test]
    async fn test_sql_insert_resolves_cells() {
        let db = crate::fixtures::Database::open_memory("orders", vec![]).unwrap();
        let session = session().with_database(db);
        session.context().put("widget1", "w-42");
        let mut worker = Worker::new();

        for step in [
            Step::Sql {
                database: "orders".into(),
                statement: "CREATE TABLE widget (id TEXT, name TEXT)".into(),
            },
            Step::SqlInsert {
                database: "orders".into(),
                table: "widget".into(),
                rows: DataTable::parse_pipe("| id | name |\n| ${widget1} | spare ${widget1} |").unwrap(),
            },
            Step::SqlQuery {
                database: "orders".into(),
                query: "SELECT id, name FROM widget".into(),
            },
        ] {
            execute(&session, &mut worker, &step).await.unwrap();
        }
        assert_eq!(
            worker.last_response().unwrap().json().unwrap(),
            json!([{"id": "w-42", "name": "spare w-42"}])
        );
    }

    #[tokio::test]
    async fn test_fixture_steps_without_fixture_fail_fast() {
        let session = session();
        let mut worker = Worker::new();
        let err = execute(&session, &mut worker, &Step::PurgeAllQueues).await.unwrap_err();
        assert!(matches!(err, AccordError::FixtureDisabled { .. }));
    }
}
