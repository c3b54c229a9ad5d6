//! Administrative HTML/JSON surface. Everything here is built on the
//! store's public operations; the forwarding engine never routes through
//! this module.

use std::path::Path;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use serde_json::{Map, Value, json};
use tracing::info;
use url::form_urlencoded;

use switchboard::store::{ActiveSelection, EnvironmentRecord, EnvironmentStore, StoreError};
use switchboard::{ProxyBody, empty_body, full_body};

const STYLE: &str = "\
body{font-family:system-ui,sans-serif;margin:0;background:#f4f5f7;color:#1f2430}\
main{max-width:860px;margin:2rem auto;padding:0 1rem}\
h1{font-size:1.4rem}h2{font-size:1.05rem;margin-top:2rem}\
section{background:#fff;border:1px solid #d9dce3;border-radius:8px;padding:1rem;margin-top:1rem}\
form{display:inline-flex;gap:.5rem;margin:.25rem 0;flex-wrap:wrap}\
input{padding:.35rem .5rem;border:1px solid #c4c9d4;border-radius:4px}\
button{padding:.35rem .75rem;border:0;border-radius:4px;background:#3451b2;color:#fff;cursor:pointer}\
button.danger{background:#b23434}\
ul{list-style:none;padding:0}li{padding:.5rem 0;border-bottom:1px solid #eceef2}\
.meta{color:#6a7080;font-size:.85rem}\
.active{color:#1d7a36;font-weight:600}\
.banner{padding:.5rem .75rem;border-radius:6px;margin-top:1rem}\
.banner.notice{background:#e3f2e6;color:#1d7a36}\
.banner.error{background:#fbe4e4;color:#b23434}";

/// Route one admin request.
pub async fn handle<B>(req: Request<B>, store: &EnvironmentStore) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let prefer_html = prefers_html(req.headers());
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let payload = if matches!(method, Method::POST | Method::PUT) {
        read_body(content_type.as_deref(), req.into_body()).await
    } else {
        Map::new()
    };

    match (&method, path.as_str()) {
        (&Method::GET, "/") => page(store, query.as_deref()),
        (&Method::GET, "/status") => json_response(
            StatusCode::OK,
            &json!({ "environment": store.active_selection().url }),
        ),
        (&Method::GET, "/environments") => json_response(
            StatusCode::OK,
            &json!({ "environments": store.environments() }),
        ),
        (&Method::POST, "/switch") => switch(store, &payload, prefer_html).await,
        (&Method::POST, "/environments") => add(store, &payload, prefer_html).await,
        _ => {
            if let Some(rest) = path.strip_prefix("/environments/") {
                match &method {
                    &Method::PUT => return update(store, rest, &payload, prefer_html).await,
                    &Method::DELETE => return delete(store, rest, prefer_html).await,
                    &Method::POST => {
                        if let Some(id) = rest.strip_suffix("/update") {
                            return update(store, id, &payload, prefer_html).await;
                        }
                        if let Some(id) = rest.strip_suffix("/delete") {
                            return delete(store, id, prefer_html).await;
                        }
                    }
                    _ => {}
                }
            }
            respond_error(prefer_html, StatusCode::NOT_FOUND, "Unknown admin route.")
        }
    }
}

async fn switch(
    store: &EnvironmentStore,
    payload: &Map<String, Value>,
    prefer_html: bool,
) -> Response<ProxyBody> {
    let id = value_to_string(payload.get("environmentId").or_else(|| payload.get("id")));
    let url = value_to_string(payload.get("url").or_else(|| payload.get("environment")));

    let result = if let Some(id) = id {
        store
            .set_active_environment_by_id(&id)
            .await
            .map(|record| record.url)
    } else if let Some(url) = url {
        store.set_active_environment_url(&url).await
    } else {
        return respond_error(
            prefer_html,
            StatusCode::BAD_REQUEST,
            "Provide an environment id or URL.",
        );
    };

    match result {
        Ok(active) => {
            info!(url = %active, "active environment switched");
            respond_success(
                prefer_html,
                json!({ "environment": active }),
                "Environment switched.",
            )
        }
        Err(error) => store_error_response(prefer_html, &error),
    }
}

async fn add(
    store: &EnvironmentStore,
    payload: &Map<String, Value>,
    prefer_html: bool,
) -> Response<ProxyBody> {
    let label = value_to_string(payload.get("label"));
    let url = value_to_string(payload.get("url"));
    let (Some(label), Some(url)) = (label, url) else {
        return respond_error(
            prefer_html,
            StatusCode::BAD_REQUEST,
            "Name and URL are required.",
        );
    };
    match store.add_environment(&label, &url).await {
        Ok(record) => respond_success(
            prefer_html,
            json!({ "environment": record }),
            "Environment added.",
        ),
        Err(error) => store_error_response(prefer_html, &error),
    }
}

async fn update(
    store: &EnvironmentStore,
    id: &str,
    payload: &Map<String, Value>,
    prefer_html: bool,
) -> Response<ProxyBody> {
    let label = value_to_string(payload.get("label"));
    let url = value_to_string(payload.get("url"));
    let (Some(label), Some(url)) = (label, url) else {
        return respond_error(
            prefer_html,
            StatusCode::BAD_REQUEST,
            "Name and URL are required.",
        );
    };
    match store.update_environment(id, &label, &url).await {
        Ok(record) => respond_success(
            prefer_html,
            json!({ "environment": record }),
            "Environment updated.",
        ),
        Err(error) => store_error_response(prefer_html, &error),
    }
}

async fn delete(store: &EnvironmentStore, id: &str, prefer_html: bool) -> Response<ProxyBody> {
    match store.delete_environment(id).await {
        Ok(()) => respond_success(prefer_html, json!({ "ok": true }), "Environment deleted."),
        Err(error) => store_error_response(prefer_html, &error),
    }
}

fn page(store: &EnvironmentStore, query: Option<&str>) -> Response<ProxyBody> {
    let notice = query_param(query, "notice");
    let error = query_param(query, "error");
    let html = render_page(
        &store.active_selection(),
        &store.environments(),
        store.path(),
        notice.as_deref(),
        error.as_deref(),
    );
    let mut response = Response::new(full_body(html));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn render_page(
    selection: &ActiveSelection,
    environments: &[EnvironmentRecord],
    data_file: &Path,
    notice: Option<&str>,
    error: Option<&str>,
) -> String {
    let mut banners = String::new();
    if let Some(notice) = notice {
        banners.push_str(&format!(
            "<div class=\"banner notice\">{}</div>",
            escape_html(notice)
        ));
    }
    if let Some(error) = error {
        banners.push_str(&format!(
            "<div class=\"banner error\">{}</div>",
            escape_html(error)
        ));
    }

    let active = match &selection.url {
        Some(url) => format!("<p class=\"active\">{}</p>", escape_html(url)),
        None => "<p>No environment selected. The proxy answers 503.</p>".to_string(),
    };

    let mut rows = String::new();
    for record in environments {
        let marker = if selection.environment_id.as_deref() == Some(record.id.as_str()) {
            " <span class=\"active\">(active)</span>"
        } else {
            ""
        };
        rows.push_str(&format!(
            "<li>\
             <form method=\"post\" action=\"/switch\">\
             <input type=\"hidden\" name=\"environmentId\" value=\"{id}\">\
             <button type=\"submit\">Activate</button></form>{marker}\
             <form method=\"post\" action=\"/environments/{id}/update\">\
             <input name=\"label\" value=\"{label}\">\
             <input name=\"url\" value=\"{url}\" size=\"40\">\
             <button type=\"submit\">Update</button></form>\
             <form method=\"post\" action=\"/environments/{id}/delete\">\
             <button type=\"submit\" class=\"danger\">Delete</button></form>\
             </li>",
            id = escape_html(&record.id),
            label = escape_html(&record.label),
            url = escape_html(&record.url),
        ));
    }
    if rows.is_empty() {
        rows.push_str("<li>No environments saved yet.</li>");
    }

    format!(
        "<!doctype html>\
         <html lang=\"en\"><head><meta charset=\"utf-8\">\
         <title>switchboard</title><style>{STYLE}</style></head><body><main>\
         <h1>switchboard</h1>\
         <p class=\"meta\">State file: {data_file}</p>\
         {banners}\
         <section><h2>Active environment</h2>{active}\
         <form method=\"post\" action=\"/switch\">\
         <input name=\"url\" placeholder=\"http://localhost:4000\" size=\"40\">\
         <button type=\"submit\">Switch to URL</button></form></section>\
         <section><h2>Environments</h2><ul>{rows}</ul></section>\
         <section><h2>Add environment</h2>\
         <form method=\"post\" action=\"/environments\">\
         <input name=\"label\" placeholder=\"staging\">\
         <input name=\"url\" placeholder=\"https://staging.example.com\" size=\"40\">\
         <button type=\"submit\">Add</button></form></section>\
         </main></body></html>",
        data_file = escape_html(&data_file.display().to_string()),
    )
}

/// Read and decode a request body as JSON or an urlencoded form.
async fn read_body<B>(content_type: Option<&str>, body: B) -> Map<String, Value>
where
    B: Body<Data = Bytes>,
{
    let Ok(collected) = body.collect().await else {
        return Map::new();
    };
    parse_body(content_type, &collected.to_bytes())
}

fn parse_body(content_type: Option<&str>, bytes: &[u8]) -> Map<String, Value> {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    if content_type.contains(mime::APPLICATION_JSON.as_ref()) {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    } else {
        form_urlencoded::parse(bytes)
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect()
    }
}

/// Trimmed string form of a body field: strings directly, arrays through
/// their first element, everything else is treated as absent.
fn value_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Array(items) => value_to_string(items.first()),
        _ => None,
    }
}

fn prefers_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(mime::TEXT_HTML.as_ref()))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn respond_success(prefer_html: bool, payload: Value, notice: &str) -> Response<ProxyBody> {
    if prefer_html {
        redirect_to_admin(&[("notice", notice)])
    } else {
        json_response(StatusCode::OK, &payload)
    }
}

fn respond_error(prefer_html: bool, status: StatusCode, message: &str) -> Response<ProxyBody> {
    if prefer_html {
        redirect_to_admin(&[("error", message)])
    } else {
        json_response(status, &json!({ "error": message }))
    }
}

fn store_error_response(prefer_html: bool, error: &StoreError) -> Response<ProxyBody> {
    let status = match error {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Validation(_) => StatusCode::BAD_REQUEST,
        StoreError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond_error(prefer_html, status, &error.to_string())
}

fn redirect_to_admin(params: &[(&str, &str)]) -> Response<ProxyBody> {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        if !value.is_empty() {
            serializer.append_pair(key, value);
        }
    }
    let query = serializer.finish();
    let location = if query.is_empty() {
        "/".to_string()
    } else {
        format!("/?{query}")
    };

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

fn json_response(status: StatusCode, payload: &Value) -> Response<ProxyBody> {
    let body = serde_json::to_vec(payload).unwrap_or_default();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
