// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use bytes::Bytes;
use hashing::Fingerprint;
use parking_lot::Mutex;
use serde_json::{json, Value};

// The provider's wire codes, as this stub plays the provider.
const ERRNO_PARAM: i64 = 2;
const ERRNO_FILE_EXISTS: i64 = -8;
const ERRNO_TOKEN_EXPIRED: i64 = 111;
const ERRNO_NO_SUCH_FILE: i64 = 31066;
const ERRNO_RAPID_NO_MATCH: i64 = 31079;
const ERRNO_UPLOAD_ID_EXPIRED: i64 = 31363;

pub type RequestCounter = Mutex<HashMap<RequestType, usize>>;

#[derive(PartialEq, Eq, Hash, Debug, Copy, Clone)]
pub enum RequestType {
    RapidUpload,
    Precreate,
    UploadSlice,
    Create,
    Meta,
    List,
    Dlink,
    DataRead,
    Mkdir,
    Delete,
}

impl RequestType {
    pub fn record(self, request_counts: &RequestCounter) {
        *request_counts.lock().entry(self).or_insert(0) += 1;
    }
}

#[derive(Clone)]
struct StubFile {
    fsid: u64,
    bytes: Bytes,
    mtime: u64,
    is_dir: bool,
}

struct StubSession {
    path: String,
    size: u64,
    parts: Vec<Option<Bytes>>,
}

struct Inner {
    addr: SocketAddr,
    required_token: String,
    files: Mutex<BTreeMap<String, StubFile>>,
    sessions: Mutex<HashMap<String, StubSession>>,
    request_counts: Arc<RequestCounter>,
    next_fsid: AtomicU64,
    next_upload_id: AtomicU64,
    next_mtime: AtomicU64,
    next_link_serial: AtomicU64,
    expired_link_serials: Mutex<HashSet<u64>>,
    // Remaining dlink issuances that should be born expired.
    expire_dlinks_remaining: AtomicUsize,
    // Remaining control requests to reject with a token-expired code.
    reject_token_requests: AtomicUsize,
    // When set, the number of further slice uploads to accept before returning server errors.
    slice_successes_remaining: Mutex<Option<usize>>,
    // Remaining slice uploads whose echoed md5 should be garbage.
    corrupt_slice_echoes: AtomicUsize,
}

impl Inner {
    fn insert_entry(&self, path: &str, bytes: Bytes, is_dir: bool) -> StubFile {
        let file = StubFile {
            fsid: self.next_fsid.fetch_add(1, Ordering::SeqCst),
            bytes,
            mtime: self.next_mtime.fetch_add(1, Ordering::SeqCst),
            is_dir,
        };
        self.files.lock().insert(path.to_owned(), file.clone());
        file
    }

    /// A destination name with a numeric suffix, as the server's rename mode produces.
    fn renamed_destination(&self, path: &str) -> String {
        let files = self.files.lock();
        let (stem, ext) = match path.rfind('.') {
            Some(dot) if dot > path.rfind('/').map(|s| s + 1).unwrap_or(0) => {
                (&path[0..dot], &path[dot..])
            }
            _ => (path, ""),
        };
        let mut n = 1;
        loop {
            let candidate = format!("{stem}({n}){ext}");
            if !files.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn info_json(&self, path: &str, file: &StubFile) -> Value {
        let mut value = json!({
            "fs_id": file.fsid,
            "path": path,
            "size": file.bytes.len() as u64,
            "isdir": if file.is_dir { 1 } else { 0 },
            "server_mtime": file.mtime,
        });
        if !file.is_dir {
            value["md5"] = Value::String(Fingerprint::of_bytes(&file.bytes).to_hex());
        }
        value
    }
}

fn respond(errno: i64) -> Json<Value> {
    Json(json!({ "errno": errno }))
}

fn check_token(inner: &Inner, params: &HashMap<String, String>) -> Result<(), Json<Value>> {
    let rejected = inner
        .reject_token_requests
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if rejected {
        return Err(respond(ERRNO_TOKEN_EXPIRED));
    }
    match params.get("access_token") {
        Some(token) if *token == inner.required_token => Ok(()),
        _ => Err(respond(ERRNO_TOKEN_EXPIRED)),
    }
}

async fn file_get(
    State(inner): State<Arc<Inner>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    file_call(inner, params, HashMap::new())
}

async fn file_post(
    State(inner): State<Arc<Inner>>,
    Query(params): Query<HashMap<String, String>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    file_call(inner, params, form)
}

fn file_call(
    inner: Arc<Inner>,
    params: HashMap<String, String>,
    form: HashMap<String, String>,
) -> Json<Value> {
    let mut all = params;
    all.extend(form);
    let method = all.get("method").cloned().unwrap_or_default();

    let request_type = match method.as_str() {
        "rapidupload" => RequestType::RapidUpload,
        "precreate" => RequestType::Precreate,
        "create" if all.get("isdir").map(String::as_str) == Some("1") => RequestType::Mkdir,
        "create" => RequestType::Create,
        "meta" => RequestType::Meta,
        "list" | "listall" => RequestType::List,
        "dlink" => RequestType::Dlink,
        "filemanager" => RequestType::Delete,
        _ => return respond(ERRNO_PARAM),
    };
    request_type.record(&inner.request_counts);

    if let Err(response) = check_token(&inner, &all) {
        return response;
    }

    match request_type {
        RequestType::RapidUpload => rapid_upload(&inner, &all),
        RequestType::Precreate => precreate(&inner, &all),
        RequestType::Mkdir => mkdir(&inner, &all),
        RequestType::Create => create(&inner, &all),
        RequestType::Meta => meta(&inner, &all),
        RequestType::List => list(&inner, &all, method == "listall"),
        RequestType::Dlink => dlink(&inner, &all),
        RequestType::Delete => delete(&inner, &all),
        _ => respond(ERRNO_PARAM),
    }
}

fn rapid_upload(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    let (Some(path), Some(md5), Some(length)) = (
        params.get("path"),
        params.get("content-md5"),
        params.get("content-length"),
    ) else {
        return respond(ERRNO_PARAM);
    };
    let Ok(length) = length.parse::<u64>() else {
        return respond(ERRNO_PARAM);
    };
    let rtype = params.get("rtype").map(String::as_str).unwrap_or("0");

    let matched = {
        let files = inner.files.lock();
        files
            .values()
            .filter(|file| !file.is_dir && file.bytes.len() as u64 == length)
            .find(|file| Fingerprint::of_bytes(&file.bytes).to_hex() == *md5)
            .map(|file| file.bytes.clone())
    };
    let Some(bytes) = matched else {
        return respond(ERRNO_RAPID_NO_MATCH);
    };

    let destination = match resolve_destination(inner, path, rtype) {
        Ok(destination) => destination,
        Err(response) => return response,
    };
    let file = inner.insert_entry(&destination, bytes, false);
    let info = inner.info_json(&destination, &file);
    Json(json!({ "errno": 0, "info": info }))
}

fn precreate(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    let (Some(path), Some(size), Some(block_list)) = (
        params.get("path"),
        params.get("size"),
        params.get("block_list"),
    ) else {
        return respond(ERRNO_PARAM);
    };
    let Ok(size) = size.parse::<u64>() else {
        return respond(ERRNO_PARAM);
    };
    let Ok(blocks) = serde_json::from_str::<Vec<String>>(block_list) else {
        return respond(ERRNO_PARAM);
    };

    let upload_id = format!("upid-{}", inner.next_upload_id.fetch_add(1, Ordering::SeqCst));
    let needed: Vec<usize> = (0..blocks.len()).collect();
    inner.sessions.lock().insert(
        upload_id.clone(),
        StubSession {
            path: path.clone(),
            size,
            parts: vec![None; blocks.len()],
        },
    );
    Json(json!({
        "errno": 0,
        "uploadid": upload_id,
        "block_list": needed,
        "return_type": 1,
    }))
}

fn mkdir(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    let Some(path) = params.get("path") else {
        return respond(ERRNO_PARAM);
    };
    let existing = inner.files.lock().get(path).cloned();
    let file = match existing {
        Some(file) if file.is_dir => file,
        Some(_) => return respond(ERRNO_FILE_EXISTS),
        None => inner.insert_entry(path, Bytes::new(), true),
    };
    let info = inner.info_json(path, &file);
    let mut value = json!({ "errno": 0 });
    merge_info(&mut value, info);
    Json(value)
}

fn create(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    let (Some(path), Some(upload_id)) = (params.get("path"), params.get("uploadid")) else {
        return respond(ERRNO_PARAM);
    };
    let rtype = params.get("rtype").map(String::as_str).unwrap_or("0");

    let assembled = {
        let sessions = inner.sessions.lock();
        let Some(session) = sessions.get(upload_id) else {
            return respond(ERRNO_UPLOAD_ID_EXPIRED);
        };
        if session.path != *path {
            return respond(ERRNO_PARAM);
        }
        if session.parts.iter().any(Option::is_none) {
            return respond(ERRNO_PARAM);
        }
        let mut assembled = Vec::with_capacity(session.size as usize);
        for part in session.parts.iter().flatten() {
            assembled.extend_from_slice(part);
        }
        if assembled.len() as u64 != session.size {
            return respond(ERRNO_PARAM);
        }
        Bytes::from(assembled)
    };

    let destination = match resolve_destination(inner, path, rtype) {
        Ok(destination) => destination,
        Err(response) => return response,
    };
    inner.sessions.lock().remove(upload_id);
    let file = inner.insert_entry(&destination, assembled, false);
    let info = inner.info_json(&destination, &file);
    let mut value = json!({ "errno": 0 });
    merge_info(&mut value, info);
    Json(value)
}

/// Apply the overwrite mode to a requested destination path.
fn resolve_destination(
    inner: &Inner,
    path: &str,
    rtype: &str,
) -> Result<String, Json<Value>> {
    let exists = inner.files.lock().contains_key(path);
    if !exists {
        return Ok(path.to_owned());
    }
    match rtype {
        "1" => Ok(inner.renamed_destination(path)),
        "3" => Ok(path.to_owned()),
        _ => Err(respond(ERRNO_FILE_EXISTS)),
    }
}

fn merge_info(envelope: &mut Value, info: Value) {
    if let (Some(envelope), Value::Object(info)) = (envelope.as_object_mut(), info) {
        for (key, value) in info {
            envelope.insert(key, value);
        }
    }
}

fn meta(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    let Some(path) = params.get("path") else {
        return respond(ERRNO_PARAM);
    };
    let Some(file) = inner.files.lock().get(path).cloned() else {
        return respond(ERRNO_NO_SUCH_FILE);
    };
    let info = inner.info_json(path, &file);
    Json(json!({ "errno": 0, "info": info }))
}

fn list(inner: &Inner, params: &HashMap<String, String>, recursive: bool) -> Json<Value> {
    let Some(dir) = params.get("dir") else {
        return respond(ERRNO_PARAM);
    };
    let dir = dir.trim_end_matches('/').to_owned();
    let start = params
        .get("start")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1000)
        .max(1);

    let files = inner.files.lock();
    let prefix = format!("{dir}/");
    let entries: Vec<Value> = files
        .iter()
        .filter(|(path, _)| {
            if !path.starts_with(&prefix) {
                return false;
            }
            recursive || !path[prefix.len()..].contains('/')
        })
        .map(|(path, file)| inner.info_json(path, file))
        .collect();

    let total = entries.len();
    let page: Vec<Value> = entries
        .into_iter()
        .skip(start)
        .take(limit)
        .collect();
    let has_more = start + limit < total;
    Json(json!({
        "errno": 0,
        "list": page,
        "has_more": if has_more { 1 } else { 0 },
        "cursor": start + limit,
    }))
}

fn dlink(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    let Some(fsid) = params.get("fsid").and_then(|s| s.parse::<u64>().ok()) else {
        return respond(ERRNO_PARAM);
    };
    let known = inner
        .files
        .lock()
        .values()
        .any(|file| file.fsid == fsid && !file.is_dir);
    if !known {
        return respond(ERRNO_NO_SUCH_FILE);
    }

    let serial = inner.next_link_serial.fetch_add(1, Ordering::SeqCst);
    let expired = inner
        .expire_dlinks_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if expired {
        inner.expired_link_serials.lock().insert(serial);
    }
    let dlink = format!("http://{}/d/{}?sig={}", inner.addr, fsid, serial);
    Json(json!({ "errno": 0, "dlink": dlink }))
}

fn delete(inner: &Inner, params: &HashMap<String, String>) -> Json<Value> {
    if params.get("opera").map(String::as_str) != Some("delete") {
        return respond(ERRNO_PARAM);
    }
    let Some(filelist) = params.get("filelist") else {
        return respond(ERRNO_PARAM);
    };
    let Ok(paths) = serde_json::from_str::<Vec<String>>(filelist) else {
        return respond(ERRNO_PARAM);
    };

    let mut files = inner.files.lock();
    for path in paths {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        files.retain(|candidate, _| candidate != &path && !candidate.starts_with(&prefix));
    }
    respond(0)
}

async fn superfile(
    State(inner): State<Arc<Inner>>,
    Query(params): Query<HashMap<String, String>>,
    mut multipart: Multipart,
) -> Response {
    RequestType::UploadSlice.record(&inner.request_counts);

    if let Err(response) = check_token(&inner, &params) {
        return response.into_response();
    }

    {
        let mut gate = inner.slice_successes_remaining.lock();
        match *gate {
            Some(0) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "slice upload rejected")
                    .into_response();
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
    }

    let (Some(upload_id), Some(partseq)) = (params.get("uploadid"), params.get("partseq")) else {
        return respond(ERRNO_PARAM).into_response();
    };
    let Ok(index) = partseq.parse::<usize>() else {
        return respond(ERRNO_PARAM).into_response();
    };

    let mut data: Option<Bytes> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            match field.bytes().await {
                Ok(bytes) => data = Some(bytes),
                Err(_) => return respond(ERRNO_PARAM).into_response(),
            }
        }
    }
    let Some(bytes) = data else {
        return respond(ERRNO_PARAM).into_response();
    };

    let md5 = {
        let mut sessions = inner.sessions.lock();
        let Some(session) = sessions.get_mut(upload_id) else {
            return respond(ERRNO_UPLOAD_ID_EXPIRED).into_response();
        };
        if index >= session.parts.len() {
            return respond(ERRNO_PARAM).into_response();
        }
        let md5 = Fingerprint::of_bytes(&bytes).to_hex();
        session.parts[index] = Some(bytes);
        md5
    };

    let corrupted = inner
        .corrupt_slice_echoes
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let echoed = if corrupted {
        "00000000000000000000000000000000".to_owned()
    } else {
        md5
    };
    Json(json!({ "errno": 0, "md5": echoed })).into_response()
}

async fn data_read(
    State(inner): State<Arc<Inner>>,
    Path(fsid): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    RequestType::DataRead.record(&inner.request_counts);

    if params.get("access_token") != Some(&inner.required_token) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    let expired = params
        .get("sig")
        .and_then(|s| s.parse::<u64>().ok())
        .map(|serial| inner.expired_link_serials.lock().contains(&serial))
        .unwrap_or(true);
    if expired {
        return (StatusCode::FORBIDDEN, "link expired").into_response();
    }

    let Some(bytes) = inner
        .files
        .lock()
        .values()
        .find(|file| file.fsid == fsid && !file.is_dir)
        .map(|file| file.bytes.clone())
    else {
        return (StatusCode::NOT_FOUND, "no such fsid").into_response();
    };

    match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        None => (StatusCode::OK, bytes).into_response(),
        Some(raw) => match parse_range(raw, bytes.len() as u64) {
            Some((range_start, range_end)) => {
                let body = bytes.slice(range_start as usize..(range_end + 1) as usize);
                (StatusCode::PARTIAL_CONTENT, body).into_response()
            }
            None => (StatusCode::RANGE_NOT_SATISFIABLE, "bad range").into_response(),
        },
    }
}

/// Parse `bytes=a-b` (inclusive). Open-ended ranges read to the end of the file.
fn parse_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    if start > end || end >= total {
        return None;
    }
    Some((start, end))
}

pub struct StubXpanBuilder {
    required_token: String,
    files: Vec<(String, Bytes)>,
    directories: Vec<String>,
}

impl StubXpanBuilder {
    pub fn new() -> StubXpanBuilder {
        StubXpanBuilder {
            required_token: "test-token".to_owned(),
            files: Vec::new(),
            directories: Vec::new(),
        }
    }

    pub fn required_token<S: Into<String>>(mut self, token: S) -> StubXpanBuilder {
        self.required_token = token.into();
        self
    }

    pub fn file<S: Into<String>>(mut self, path: S, bytes: Bytes) -> StubXpanBuilder {
        self.files.push((path.into(), bytes));
        self
    }

    pub fn directory<S: Into<String>>(mut self, path: S) -> StubXpanBuilder {
        self.directories.push(path.into());
        self
    }

    pub async fn spawn(self) -> StubXpan {
        let listener = std::net::TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let inner = Arc::new(Inner {
            addr,
            required_token: self.required_token,
            files: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            request_counts: Arc::new(Mutex::new(HashMap::new())),
            next_fsid: AtomicU64::new(1000),
            next_upload_id: AtomicU64::new(1),
            next_mtime: AtomicU64::new(1_700_000_000),
            next_link_serial: AtomicU64::new(1),
            expired_link_serials: Mutex::new(HashSet::new()),
            expire_dlinks_remaining: AtomicUsize::new(0),
            reject_token_requests: AtomicUsize::new(0),
            slice_successes_remaining: Mutex::new(None),
            corrupt_slice_echoes: AtomicUsize::new(0),
        });
        for directory in self.directories {
            inner.insert_entry(&directory, Bytes::new(), true);
        }
        for (path, bytes) in self.files {
            inner.insert_entry(&path, bytes, false);
        }

        let router = Router::new()
            .route("/rest/2.0/xpan/file", get(file_get).post(file_post))
            .route("/rest/2.0/pcs/superfile2", post(superfile))
            .route("/d/:fsid", get(data_read))
            .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
            .with_state(inner.clone());

        let handle = axum_server::Handle::new();
        let server_handle = handle.clone();
        tokio::spawn(async move {
            axum_server::from_tcp(listener)
                .handle(server_handle)
                .serve(router.into_make_service())
                .await
                .unwrap();
        });

        StubXpan {
            request_counts: inner.request_counts.clone(),
            inner,
            handle,
        }
    }
}

///
/// An in-process stub of the provider's HTTP surface: control calls under
/// `/rest/2.0/xpan/file`, slice uploads under `/rest/2.0/pcs/superfile2`, and signed data reads
/// under `/d/{fsid}`. Tests preload content, inject faults, and assert request counts.
///
pub struct StubXpan {
    pub request_counts: Arc<RequestCounter>,
    inner: Arc<Inner>,
    handle: axum_server::Handle,
}

impl Drop for StubXpan {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

impl StubXpan {
    pub fn builder() -> StubXpanBuilder {
        StubXpanBuilder::new()
    }

    pub async fn spawn() -> StubXpan {
        StubXpanBuilder::new().spawn().await
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn base_url(&self) -> url::Url {
        url::Url::parse(&format!("http://{}", self.inner.addr)).unwrap()
    }

    pub fn request_count(&self, request_type: RequestType) -> usize {
        *self.request_counts.lock().get(&request_type).unwrap_or(&0)
    }

    /// The bytes currently stored for `path`, if any.
    pub fn file_bytes(&self, path: &str) -> Option<Bytes> {
        self.inner
            .files
            .lock()
            .get(path)
            .filter(|file| !file.is_dir)
            .map(|file| file.bytes.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.files.lock().contains_key(path)
    }

    pub fn remote_paths(&self) -> Vec<String> {
        self.inner.files.lock().keys().cloned().collect()
    }

    pub fn insert_file(&self, path: &str, bytes: Bytes) {
        self.inner.insert_entry(path, bytes, false);
    }

    pub fn insert_directory(&self, path: &str) {
        self.inner.insert_entry(path, Bytes::new(), true);
    }

    /// Accept `n` more slice uploads, then reject the rest with server errors until
    /// `clear_slice_failures` is called.
    pub fn fail_slice_uploads_after(&self, n: usize) {
        *self.inner.slice_successes_remaining.lock() = Some(n);
    }

    pub fn clear_slice_failures(&self) {
        *self.inner.slice_successes_remaining.lock() = None;
    }

    /// Echo a garbage md5 for the next `n` slice uploads. The bytes are stored regardless; a
    /// client that checks the echo will re-upload.
    pub fn corrupt_slice_echoes(&self, n: usize) {
        self.inner.corrupt_slice_echoes.store(n, Ordering::SeqCst);
    }

    /// The next `n` issued dlinks are born expired: reads through them return HTTP 403.
    pub fn expire_next_dlinks(&self, n: usize) {
        self.inner
            .expire_dlinks_remaining
            .store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` control requests with the provider's token-expired code.
    pub fn expire_token_for_requests(&self, n: usize) {
        self.inner.reject_token_requests.store(n, Ordering::SeqCst);
    }
}
