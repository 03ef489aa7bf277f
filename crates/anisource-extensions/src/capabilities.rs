//! Host operations installed into every extension's Lua state.
//!
//! This is the only way a script can reach the outside world. HTTP goes
//! through a blocking client owned by the runtime's worker thread and
//! configured from [`SandboxConfig`]; everything else is pure.

use std::io::Read;
use std::net::IpAddr;
use std::rc::Rc;

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Table, Value};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::config::SandboxConfig;
use crate::error::ExtensionError;
use crate::html::Selection;
use crate::sandbox::CallGuard;

/// Headers a script may never set.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
];

/// Hostnames blocked regardless of how they resolve.
const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "metadata.azure.com",
    "instance-data",
];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// ─── Address policy ─────────────────────────────────────────────────────

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

/// Reject URLs that point at loopback, private, link-local or cloud
/// metadata addresses. Only literal addresses and known names are checked.
pub(crate) fn check_public_host(url: &url::Url) -> Result<(), String> {
    let host = match url.host() {
        Some(host) => host,
        None => return Err(format!("URL has no host: {url}")),
    };
    let blocked = match host {
        url::Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            BLOCKED_HOSTS.contains(&name.as_str()) || name.ends_with(".localhost")
        }
        url::Host::Ipv4(v4) => is_private_ip(IpAddr::V4(v4)),
        url::Host::Ipv6(v6) => is_private_ip(IpAddr::V6(v6)),
    };
    if blocked {
        return Err(format!(
            "requests to '{host}' are blocked (private/reserved address)"
        ));
    }
    Ok(())
}

// ─── HTTP ───────────────────────────────────────────────────────────────

/// Restricted HTTP access for one extension.
pub(crate) struct HttpCapability {
    client: reqwest::blocking::Client,
    config: SandboxConfig,
    guard: CallGuard,
}

impl HttpCapability {
    /// Must be called outside of any async runtime context.
    pub(crate) fn new(config: &SandboxConfig, guard: CallGuard) -> Result<Self, ExtensionError> {
        let max_redirects = config.max_redirects;
        let allow_private = config.allow_private_hosts;
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                attempt.error("too many redirects")
            } else if !allow_private && check_public_host(attempt.url()).is_err() {
                attempt.error("redirect to a private address blocked")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.http_timeout)
            .redirect(redirect)
            .build()
            .map_err(|e| ExtensionError::Network(e.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
            guard,
        })
    }

    /// Keep only header names the policy allows.
    fn filter_headers(&self, headers: Vec<(String, String)>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if RESERVED_HEADERS.contains(&lower.as_str()) {
                tracing::debug!(header = %name, "dropping reserved header set by extension");
                continue;
            }
            if let Some(allowed) = &self.config.allowed_headers {
                if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&lower)) {
                    tracing::debug!(header = %name, "dropping header outside allow-list");
                    continue;
                }
            }
            match (
                HeaderName::from_bytes(lower.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::debug!(header = %name, "dropping malformed header"),
            }
        }
        map
    }

    /// Perform a request and return the body as text.
    ///
    /// The error string is handed to the script as the second return value.
    fn fetch(
        &self,
        url: &str,
        body: Option<String>,
        headers: Vec<(String, String)>,
    ) -> Result<String, String> {
        if let Some(reason) = self.guard.check() {
            return Err(format!("extension interrupted: {reason:?}"));
        }

        let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("unsupported URL scheme: {}", parsed.scheme()));
        }
        if !self.config.allow_private_hosts {
            check_public_host(&parsed)?;
        }

        let mut headers = self.filter_headers(headers);
        let request = match body {
            Some(body) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                }
                self.client.post(parsed).body(body)
            }
            None => self.client.get(parsed),
        };

        let resp = request
            .headers(headers)
            .send()
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }

        let limit = self.config.max_response_bytes;
        if resp.content_length().is_some_and(|len| len > limit as u64) {
            return Err(format!("response body too large (max: {limit} bytes)"));
        }

        let mut bytes = Vec::new();
        resp.take(limit as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| e.to_string())?;
        if bytes.len() > limit {
            return Err(format!("response body too large (max: {limit} bytes)"));
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn header_pairs(headers: Option<Table>) -> mlua::Result<Vec<(String, String)>> {
    let Some(headers) = headers else {
        return Ok(Vec::new());
    };
    headers.pairs::<String, String>().collect()
}

/// `(document)` on success, `(nil, message)` on failure.
fn document_or_error(lua: &Lua, result: Result<String, String>) -> mlua::Result<(Value, Value)> {
    match result {
        Ok(body) => Ok((
            Value::UserData(lua.create_userdata(Selection::parse_document(&body))?),
            Value::Nil,
        )),
        Err(message) => Ok((Value::Nil, Value::String(lua.create_string(&message)?))),
    }
}

// ─── Strings ────────────────────────────────────────────────────────────

fn compile(pattern: &str) -> mlua::Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| mlua::Error::RuntimeError(format!("invalid pattern '{pattern}': {e}")))
}

/// First capture group when the pattern has one, else the whole match.
fn match_value(re: &Regex, caps: &regex::Captures<'_>) -> String {
    let group = if re.captures_len() > 1 { 1 } else { 0 };
    caps.get(group)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

pub(crate) fn split(s: &str, sep: &str) -> Vec<String> {
    if sep.is_empty() {
        s.chars().map(String::from).collect()
    } else {
        s.split(sep).map(String::from).collect()
    }
}

pub(crate) fn find_first(s: &str, pattern: &str) -> mlua::Result<Option<String>> {
    let re = compile(pattern)?;
    Ok(re.captures(s).map(|caps| match_value(&re, &caps)))
}

pub(crate) fn find_all(s: &str, pattern: &str) -> mlua::Result<Vec<String>> {
    let re = compile(pattern)?;
    Ok(re
        .captures_iter(s)
        .map(|caps| match_value(&re, &caps))
        .collect())
}

/// Form-style query escaping: space becomes `+`.
pub(crate) fn url_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

// ─── JSON ───────────────────────────────────────────────────────────────

fn install_json(lua: &Lua) -> mlua::Result<()> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let value: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&value).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, raw: String| {
            let value: serde_json::Value =
                serde_json::from_str(&raw).map_err(mlua::Error::external)?;
            // JSON null becomes nil
            let options = SerializeOptions::new()
                .serialize_none_to_null(false)
                .serialize_unit_to_null(false);
            lua.to_value_with(&value, options)
        })?,
    )?;
    lua.globals().set("json", json)
}

// ─── Installation ───────────────────────────────────────────────────────

fn set_global(lua: &Lua, names: &[&str], f: mlua::Function) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in names {
        globals.set(*name, f.clone())?;
    }
    Ok(())
}

/// Install the pure capabilities: HTML parsing, JSON and string helpers.
pub(crate) fn install_pure(lua: &Lua) -> mlua::Result<()> {
    install_json(lua)?;
    set_global(
        lua,
        &["parse_html", "parseHtml"],
        lua.create_function(|_, html: String| Ok(Selection::parse_document(&html)))?,
    )?;
    set_global(
        lua,
        &["url_encode", "urlEncode"],
        lua.create_function(|_, s: String| Ok(url_encode(&s)))?,
    )?;
    set_global(
        lua,
        &["trim"],
        lua.create_function(|_, s: String| Ok(s.trim().to_string()))?,
    )?;
    set_global(
        lua,
        &["split"],
        lua.create_function(|_, (s, sep): (String, String)| Ok(split(&s, &sep)))?,
    )?;
    set_global(
        lua,
        &["match"],
        lua.create_function(|_, (s, pattern): (String, String)| find_first(&s, &pattern))?,
    )?;
    set_global(
        lua,
        &["match_all", "matchAll"],
        lua.create_function(|_, (s, pattern): (String, String)| find_all(&s, &pattern))?,
    )?;
    Ok(())
}

/// Install the full capability surface, HTTP included.
pub(crate) fn install(lua: &Lua, http: HttpCapability) -> mlua::Result<()> {
    install_pure(lua)?;

    let http = Rc::new(http);

    let get = Rc::clone(&http);
    set_global(
        lua,
        &["http_get", "httpGet"],
        lua.create_function(move |lua, (url, headers): (String, Option<Table>)| {
            let headers = header_pairs(headers)?;
            document_or_error(lua, get.fetch(&url, None, headers))
        })?,
    )?;

    let post = Rc::clone(&http);
    set_global(
        lua,
        &["http_post", "httpPost"],
        lua.create_function(
            move |lua, (url, body, headers): (String, Option<String>, Option<Table>)| {
                let headers = header_pairs(headers)?;
                document_or_error(lua, post.fetch(&url, Some(body.unwrap_or_default()), headers))
            },
        )?,
    )?;

    Ok(())
}
