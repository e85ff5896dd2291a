use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use url::Url;

use crate::config::Config;

const PROPFIND_DETAILS_BODY: &str = "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n\
<D:propfind xmlns:D=\"DAV:\">\n\
<D:prop xmlns:S=\"http://subversion.tigris.org/xmlns/dav/\">\n\
<S:sha1-checksum/>\n\
<D:version-name/>\n\
<S:baseline-relative-path/>\n\
</D:prop>\n\
</D:propfind>\n";

const PROPFIND_VERSION_BODY: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<propfind xmlns=\"DAV:\"><prop><version-name/></prop></propfind>";

const OPTIONS_ACTIVITY_BODY: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<D:options xmlns:D=\"DAV:\"><D:activity-collection-set></D:activity-collection-set></D:options>";

const DEPTH_INFINITY_REFUSAL: &str = "PROPFIND requests with a Depth of \"infinity\"";

/// Repository geometry discovered at bootstrap: where the sync root
/// lives inside the repository, and where the repository lives on the
/// server. Both are needed to build `!svn/rvr/` revision-view URLs.
#[derive(Debug, Clone)]
pub struct RepoGeometry {
    /// Server-reported path of the remote root within the repository.
    pub baseline_rel_path: String,
    /// URL path prefix in front of the repository (up to `!svn`).
    pub repo_parent_path: String,
}

/// Depth-0 PROPFIND result for a single path.
#[derive(Debug, Clone)]
pub struct SvnDetails {
    pub revision: i64,
    pub sha1: Option<String>,
    pub baseline_rel_path: String,
}

/// One direct child from a Depth-1 PROPFIND. `sha1` is None for
/// directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub revision: i64,
    pub sha1: Option<String>,
}

/// How a root PROPFIND (or any details query) failed.
#[derive(Debug)]
pub enum RemoteFault {
    /// Transport-level failure: DNS, refused connection, reset.
    Offline { detail: String },
    /// 401: credentials rejected.
    Unauthorized { url: String },
    /// 405: endpoint is not served by mod_dav_svn.
    NotSvnServer { url: String },
    /// Other 4xx on the root query.
    UnsuitableEndpoint { url: String, status: u16 },
    UnexpectedStatus { url: String, status: u16 },
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFault::Offline { detail } => write!(f, "ConnectionError: {detail}"),
            RemoteFault::Unauthorized { url } => {
                write!(f, "{url} is saying that the user is not authorized")
            }
            RemoteFault::NotSvnServer { url } => {
                write!(f, "{url} is not a website that maps subversion to that URL")
            }
            RemoteFault::UnsuitableEndpoint { url, status } => write!(
                f,
                "Cannot attach to remote Subversion server at {url}. Maybe not Subversion+Apache? \
                 Or wrong userId and/or password? Or wrong subdirectory within the server? \
                 Status code: {status}"
            ),
            RemoteFault::UnexpectedStatus { url, status } => {
                write!(f, "Unexpected web error {status} for {url}")
            }
        }
    }
}

impl std::error::Error for RemoteFault {}

/// The server refuses Depth:infinity PROPFINDs outright; nothing will
/// work until the Apache configuration is fixed, so the engine exits.
#[derive(Debug)]
pub struct DepthInfinityRefused;

impl std::fmt::Display for DepthInfinityRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'DavDepthInfinity on' needs to be enabled for the Apache instance on the server \
             (in httpd.conf probably). Subsyncit is refusing to run."
        )
    }
}

impl std::error::Error for DepthInfinityRefused {}

/// A PUT came back with something other than 201/204.
#[derive(Debug)]
pub struct ServerObjected {
    pub status: u16,
    pub body: String,
}

impl std::fmt::Display for ServerObjected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server objected: status {}: {}", self.status, self.body)
    }
}

impl std::error::Error for ServerObjected {}

#[derive(Default)]
struct OpCounts {
    mkcol: AtomicU64,
    put: AtomicU64,
    get: AtomicU64,
    delete: AtomicU64,
}

/// Typed wrapper over the WebDAV verbs the engine needs. Rebuilt once
/// per engine iteration so a fresh connection pool survives the user
/// moving between networks.
pub struct SvnClient {
    http: reqwest::Client,
    svn_url: String,
    user: String,
    password: Option<String>,
    geometry: Option<RepoGeometry>,
    ops: OpCounts,
}

impl SvnClient {
    pub fn connect(cfg: &Config, geometry: Option<RepoGeometry>) -> Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(1)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!cfg.verify_ssl)
            .build()
            .context("build http client")?;
        Ok(SvnClient {
            http,
            svn_url: cfg.svn_url.clone(),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            geometry,
            ops: OpCounts::default(),
        })
    }

    pub fn set_geometry(&mut self, geometry: RepoGeometry) {
        self.geometry = Some(geometry);
    }

    /// At least one body-bearing transfer or structural change happened
    /// through this client.
    pub fn anything_substantial_happened(&self) -> bool {
        self.ops.mkcol.load(Ordering::Relaxed) > 0
            || self.ops.put.load(Ordering::Relaxed) > 0
            || self.ops.get.load(Ordering::Relaxed) > 0
            || self.ops.delete.load(Ordering::Relaxed) > 0
    }

    fn url_for(&self, rel: &str) -> String {
        format!("{}{}", self.svn_url, esc(rel.trim_start_matches('/')))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(password) = &self.password {
            req = req.basic_auth(&self.user, Some(password));
        }
        req
    }

    /// Depth-0 PROPFIND of one path. The root call (`"/"`) bootstraps
    /// the baseline-relative-path and the current root revision.
    pub async fn details(&self, rel: &str) -> Result<SvnDetails, RemoteFault> {
        let mut url = self.url_for(rel);
        if url.ends_with('/') {
            url.pop();
        }
        let start = Instant::now();
        let resp = self
            .request(propfind(), &url)
            .header("Depth", "0")
            .body(PROPFIND_DETAILS_BODY)
            .send()
            .await
            .map_err(|e| RemoteFault::Offline {
                detail: e.to_string(),
            })?;
        let status = resp.status();
        log_request("PROPFIND", status.as_u16(), &url, start);

        if status.is_success() {
            let text = resp.text().await.map_err(|e| RemoteFault::Offline {
                detail: e.to_string(),
            })?;
            let responses = parse_multistatus(&text).unwrap_or_default();
            let first = responses.into_iter().next().unwrap_or_default();
            return Ok(SvnDetails {
                revision: first.version_name.unwrap_or(0),
                sha1: first.sha1,
                baseline_rel_path: first.baseline_rel_path.unwrap_or_default(),
            });
        }
        Err(match status {
            StatusCode::UNAUTHORIZED => RemoteFault::Unauthorized {
                url: self.svn_url.clone(),
            },
            StatusCode::METHOD_NOT_ALLOWED => RemoteFault::NotSvnServer {
                url: self.svn_url.clone(),
            },
            s if s.is_client_error() => RemoteFault::UnsuitableEndpoint {
                url: self.svn_url.clone(),
                status: s.as_u16(),
            },
            s => RemoteFault::UnexpectedStatus {
                url: self.svn_url.clone(),
                status: s.as_u16(),
            },
        })
    }

    /// Depth-1 PROPFIND of a directory: its direct children with their
    /// revisions and SHA-1s. The entry for the directory itself is
    /// filtered out.
    pub async fn dir_list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self.propfind_entries(prefix).await?;
        let self_path = prefix.trim_end_matches('/');
        Ok(entries
            .into_iter()
            .filter(|e| e.path.trim_end_matches('/') != self_path)
            .collect())
    }

    /// Depth-1 PROPFIND of a single file, as used to re-read revision
    /// and SHA-1 right after a PUT. Exactly one entry is expected.
    pub async fn file_entry(&self, rel: &str) -> Result<RemoteEntry> {
        let entries = self.propfind_entries(rel).await?;
        if entries.len() != 1 {
            anyhow::bail!(
                "too many or too few elements found: {} for {}",
                entries.len(),
                self.url_for(rel)
            );
        }
        Ok(entries.into_iter().next().unwrap())
    }

    async fn propfind_entries(&self, rel: &str) -> Result<Vec<RemoteEntry>> {
        let url = self.url_for(rel);
        let start = Instant::now();
        let resp = self
            .request(propfind(), &url)
            .header("Depth", "1")
            .body(PROPFIND_DETAILS_BODY)
            .send()
            .await?;
        let status = resp.status();
        log_request("PROPFIND", status.as_u16(), &url, start);
        let text = resp.text().await?;

        if text.contains(DEPTH_INFINITY_REFUSAL) {
            return Err(DepthInfinityRefused.into());
        }
        if status != StatusCode::MULTI_STATUS {
            anyhow::bail!("PROPFIND {} failed: {}", url, status);
        }

        let geometry = self
            .geometry
            .as_ref()
            .context("repository geometry not bootstrapped")?;
        let baseline = geometry.baseline_rel_path.as_str();

        let mut out = Vec::new();
        for response in parse_multistatus(&text)? {
            let Some(full) = response.baseline_rel_path else {
                continue;
            };
            let full = un_encode_path(&full);
            // Baseline match must land on a component boundary;
            // `testrepo` is not a prefix of `testrepo2/x`.
            let rel_in_repo = if baseline.is_empty() {
                full.trim_start_matches('/')
            } else if full == *baseline {
                ""
            } else if let Some(rest) = full.strip_prefix(baseline) {
                match rest.strip_prefix('/') {
                    Some(rest) => rest,
                    None => continue,
                }
            } else {
                continue;
            };
            let is_dir = response.sha1.is_none();
            let mut path = format!("/{rel_in_repo}");
            if is_dir && !path.ends_with('/') {
                path.push('/');
            }
            out.push(RemoteEntry {
                path,
                revision: response.version_name.unwrap_or(0),
                sha1: response.sha1,
            });
        }
        Ok(out)
    }

    /// The directory's own last-changed revision, read through the
    /// repository's revision-view URL. Two subtrees whose revisions
    /// match are known identical, so this is the pruning signal for the
    /// inbound walk.
    pub async fn directory_revision(&self, rel: &str) -> Result<i64> {
        let mut url = self.url_for(rel);
        if url.ends_with('/') {
            url.pop();
        }
        let start = Instant::now();
        let opts = self
            .request(Method::OPTIONS, &url)
            .body(OPTIONS_ACTIVITY_BODY)
            .send()
            .await?;
        let opts_status = opts.status();
        log_request("OPTIONS", opts_status.as_u16(), &url, start);
        if opts_status != StatusCode::OK {
            anyhow::bail!("OPTIONS {} failed: {}", url, opts_status);
        }
        let youngest: i64 = opts
            .headers()
            .get("SVN-Youngest-Rev")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .context("missing SVN-Youngest-Rev header")?
            .parse()
            .context("parse SVN-Youngest-Rev")?;

        let geometry = self
            .geometry
            .as_ref()
            .context("repository geometry not bootstrapped")?;
        let plain = format!(
            "{}{}",
            geometry.repo_parent_path, geometry.baseline_rel_path
        );
        let revision_view = format!(
            "{}!svn/rvr/{}/{}",
            geometry.repo_parent_path, youngest, geometry.baseline_rel_path
        );
        let mut url = self.svn_url.replacen(&plain, &revision_view, 1);
        url.push_str(&esc(rel.trim_matches('/')));

        let start = Instant::now();
        let resp = self
            .request(propfind(), &url)
            .header("Depth", "0")
            .body(PROPFIND_VERSION_BODY)
            .send()
            .await?;
        let status = resp.status();
        log_request("PROPFIND", status.as_u16(), &url, start);
        if status != StatusCode::MULTI_STATUS {
            anyhow::bail!("revision PROPFIND {} failed: {}", url, status);
        }
        let text = resp.text().await?;
        let responses = parse_multistatus(&text)?;
        responses
            .into_iter()
            .find_map(|r| r.version_name)
            .context("no version-name in revision PROPFIND")
    }

    /// URL path prefix in front of the repository, from the
    /// activity-collection-set href (everything before `!svn`).
    pub async fn repo_parent_path(&self) -> Result<String> {
        let mut url = self.svn_url.clone();
        if url.ends_with('/') {
            url.pop();
        }
        let start = Instant::now();
        let resp = self
            .request(Method::OPTIONS, &url)
            .body(OPTIONS_ACTIVITY_BODY)
            .send()
            .await?;
        let status = resp.status();
        log_request("OPTIONS", status.as_u16(), &url, start);
        let text = resp.text().await?;
        parse_activity_parent(&text).context("no activity-collection-set in OPTIONS response")
    }

    /// True when HEAD reports the path as a collection (redirect to a
    /// trailing-slash URL).
    pub async fn head_is_collection(&self, rel: &str) -> Result<bool> {
        let url = self.url_for(rel.trim_end_matches('/'));
        let start = Instant::now();
        let resp = self.request(Method::HEAD, &url).send().await?;
        log_request("HEAD", resp.status().as_u16(), &url, start);
        Ok(resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|loc| loc.ends_with('/'))
            .unwrap_or(false))
    }

    /// Streaming GET of a file body. The caller consumes
    /// `bytes_stream()` so multi-GB files never sit in memory.
    pub async fn get_stream(&self, rel: &str) -> Result<Response> {
        let url = self.url_for(rel);
        let start = Instant::now();
        let resp = self.request(Method::GET, &url).send().await?;
        self.ops.get.fetch_add(1, Ordering::Relaxed);
        let status = resp.status();
        log_request("GET", status.as_u16(), &url, start);
        if !status.is_success() {
            anyhow::bail!("GET {} failed: {}", url, status);
        }
        Ok(resp)
    }

    /// Small-body GET used for the remote exclusions file. None on any
    /// non-200 response or transport failure.
    pub async fn get_text(&self, rel: &str) -> Option<String> {
        let url = self.url_for(rel);
        let start = Instant::now();
        let resp = self.request(Method::GET, &url).send().await.ok()?;
        let status = resp.status();
        log_request("GET", status.as_u16(), &url, start);
        if status != StatusCode::OK {
            return None;
        }
        resp.text().await.ok()
    }

    /// Whole-body PUT. 201 means created, 204 means updated; anything
    /// else is surfaced as a `ServerObjected` error.
    pub async fn put(&self, rel: &str, body: reqwest::Body) -> Result<()> {
        let url = self.url_for(rel);
        let start = Instant::now();
        let resp = self.request(Method::PUT, &url).body(body).send().await?;
        self.ops.put.fetch_add(1, Ordering::Relaxed);
        let status = resp.status();
        log_request("PUT", status.as_u16(), &url, start);
        if status != StatusCode::CREATED && status != StatusCode::NO_CONTENT {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServerObjected {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(())
    }

    pub async fn delete(&self, rel: &str) -> Result<(u16, String)> {
        let url = self.url_for(rel);
        let start = Instant::now();
        let resp = self.request(Method::DELETE, &url).send().await?;
        self.ops.delete.fetch_add(1, Ordering::Relaxed);
        let status = resp.status();
        log_request("DELETE", status.as_u16(), &url, start);
        let body = resp.text().await.unwrap_or_default();
        Ok((status.as_u16(), body))
    }

    /// Log REPORT for the newest commit touching the repository. Handy
    /// for diagnostics; the reconciliation loop itself never needs it.
    pub async fn report_latest_commit(&self, youngest_rev: i64) -> Result<String> {
        let mut url = self.svn_url.clone();
        if url.ends_with('/') {
            url.pop();
        }
        let body = format!(
            "<S:log-report xmlns:S=\"svn:\"><S:start-revision>{youngest_rev}</S:start-revision>\
             <S:end-revision>0</S:end-revision><S:limit>1</S:limit>\
             <S:revprop>svn:author</S:revprop><S:revprop>svn:date</S:revprop>\
             <S:revprop>svn:log</S:revprop><S:path></S:path><S:encode-binary-props/></S:log-report>"
        );
        let start = Instant::now();
        let resp = self
            .request(report_method(), &url)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        log_request("REPORT", status.as_u16(), &url, start);
        if !status.is_success() {
            anyhow::bail!("REPORT {} failed: {}", url, status);
        }
        Ok(resp.text().await?)
    }

    pub async fn mkcol(&self, rel: &str) -> Result<u16> {
        let mut url = self.url_for(rel);
        if url.ends_with('/') {
            url.pop();
        }
        let start = Instant::now();
        let resp = self.request(mkcol_method(), &url).send().await?;
        self.ops.mkcol.fetch_add(1, Ordering::Relaxed);
        let status = resp.status();
        log_request("MKCOL", status.as_u16(), &url, start);
        Ok(status.as_u16())
    }
}

fn propfind() -> Method {
    Method::from_bytes(b"PROPFIND").expect("valid method")
}

fn mkcol_method() -> Method {
    Method::from_bytes(b"MKCOL").expect("valid method")
}

fn report_method() -> Method {
    Method::from_bytes(b"REPORT").expect("valid method")
}

fn log_request(verb: &str, status: u16, url: &str, start: Instant) {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    crate::logging::request_trace(verb, status, &path, start);
}

/// Percent-encode the characters Subversion URLs must not carry raw.
pub fn esc(path: &str) -> String {
    path.replace('?', "%3F").replace('&', "%26")
}

/// Reverse the encodings seen in `baseline-relative-path` values.
pub fn un_encode_path(path: &str) -> String {
    path.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("%3F", "?")
        .replace("%26", "&")
}

#[derive(Debug, Default, Clone)]
struct PropResponse {
    baseline_rel_path: Option<String>,
    version_name: Option<i64>,
    sha1: Option<String>,
}

/// Pull the three properties we ask for out of a 207 multistatus body,
/// one `PropResponse` per `<D:response>` element.
fn parse_multistatus(xml: &str) -> Result<Vec<PropResponse>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Field {
        None,
        Baseline,
        VersionName,
        Sha1,
    }

    let mut reader = Reader::from_str(xml);
    let mut responses = Vec::new();
    let mut current = PropResponse::default();
    let mut field = Field::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                field = match e.local_name().as_ref() {
                    b"baseline-relative-path" => Field::Baseline,
                    b"version-name" => Field::VersionName,
                    b"sha1-checksum" => Field::Sha1,
                    _ => Field::None,
                };
            }
            Ok(Event::Text(t)) => {
                if field == Field::None {
                    continue;
                }
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match field {
                    Field::Baseline => current.baseline_rel_path = Some(text),
                    Field::VersionName => current.version_name = text.parse().ok(),
                    Field::Sha1 => current.sha1 = Some(text),
                    Field::None => {}
                }
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"response" => {
                        responses.push(std::mem::take(&mut current));
                    }
                    b"baseline-relative-path" | b"version-name" | b"sha1-checksum" => {}
                    _ => {}
                }
                field = Field::None;
            }
            Ok(Event::Empty(_)) => {
                field = Field::None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e).context("parse multistatus"),
        }
    }
    Ok(responses)
}

/// Extract the repository-parent path from an OPTIONS response carrying
/// an activity-collection-set href such as `/svn/!svn/act/`.
fn parse_activity_parent(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut in_href = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                in_href = e.local_name().as_ref() == b"href";
            }
            Ok(Event::Text(t)) if in_href => {
                let text = t.unescape().ok()?.trim().to_string();
                if let Some(idx) = text.find("!svn") {
                    return Some(text[..idx].to_string());
                }
            }
            Ok(Event::End(_)) => {
                in_href = false;
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            Ok(_) => {}
        }
    }
}
