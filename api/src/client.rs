// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hashing::{ContentDigest, Fingerprint};
use reqwest::header;
use reqwest::multipart;
use reqwest::StatusCode;
use serde_derive::Deserialize;
use serde_json::Value;
use url::Url;

use crate::retry::{self, RetryOptions};
use crate::{errno, Error, OverwritePolicy, RemoteFile, TokenProvider};

const LIST_PAGE_SIZE: u32 = 1000;

#[derive(Clone, Debug)]
pub struct XpanClientOptions {
    /// Host for control calls (`/rest/2.0/xpan/file`).
    pub base_url: Url,
    /// Host for slice uploads (`/rest/2.0/pcs/superfile2`).
    pub data_url: Url,
    /// The vendor sandbox every remote path lives under, e.g. `/apps/xpan`.
    pub app_root: String,
    /// Per-request timeout for control calls. Data transfers use their own idle watchdog
    /// instead: a fixed deadline would kill any sufficiently large slice or segment.
    pub request_timeout: Duration,
    pub retry: RetryOptions,
}

impl Default for XpanClientOptions {
    fn default() -> XpanClientOptions {
        XpanClientOptions {
            base_url: Url::parse("https://pan.baidu.com").unwrap(),
            data_url: Url::parse("https://d.pcs.baidu.com").unwrap(),
            app_root: "/apps/xpan".to_owned(),
            request_timeout: Duration::from_secs(30),
            retry: RetryOptions::default(),
        }
    }
}

/// The outcome of a successful `precreate`: the provider-assigned upload id, and the chunk
/// indices the server still wants bytes for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Precreated {
    pub upload_id: String,
    pub needed: Vec<usize>,
}

///
/// A typed client for the provider's HTTP surface. Every method applies the retry harness;
/// callers therefore only ever see post-classification errors.
///
pub struct XpanClient {
    http: reqwest::Client,
    data_http: reqwest::Client,
    file_url: Url,
    superfile_url: Url,
    app_root: String,
    retry: RetryOptions,
    tokens: Arc<dyn TokenProvider>,
}

impl XpanClient {
    pub fn new(
        options: XpanClientOptions,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<XpanClient, String> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| format!("Failed to create the HTTP client: {e}"))?;
        // The dlink hosts reject requests without the provider's expected User-Agent. No
        // overall timeout: large transfers are watched for idleness by their callers.
        let data_http = reqwest::Client::builder()
            .user_agent("pan.baidu.com")
            .connect_timeout(options.request_timeout)
            .build()
            .map_err(|e| format!("Failed to create the data HTTP client: {e}"))?;

        let file_url = options
            .base_url
            .join("/rest/2.0/xpan/file")
            .map_err(|e| format!("Bad base url: {e}"))?;
        let superfile_url = options
            .data_url
            .join("/rest/2.0/pcs/superfile2")
            .map_err(|e| format!("Bad data url: {e}"))?;

        Ok(XpanClient {
            http,
            data_http,
            file_url,
            superfile_url,
            app_root: options.app_root,
            retry: options.retry,
            tokens,
        })
    }

    /// Compose an absolute remote path under the vendor sandbox.
    pub fn app_path(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            self.app_root.clone()
        } else {
            format!("{}/{}", self.app_root.trim_end_matches('/'), relative)
        }
    }

    pub fn retry_options(&self) -> RetryOptions {
        self.retry
    }

    pub fn token_provider(&self) -> &dyn TokenProvider {
        self.tokens.as_ref()
    }

    ///
    /// Probe the server for an existing copy of the digested content. `Ok(None)` means the
    /// content is unknown to the server and a physical upload is required.
    ///
    pub async fn rapid_upload(
        &self,
        remote_path: &str,
        digest: &ContentDigest,
        policy: OverwritePolicy,
    ) -> Result<Option<RemoteFile>, Error> {
        let what = format!("rapidupload of {remote_path}");
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .post(self.file_url.clone())
                .query(&[("method", "rapidupload"), ("access_token", token.as_str())])
                .form(&[
                    ("path", remote_path.to_owned()),
                    ("content-length", digest.size_bytes.to_string()),
                    ("content-md5", digest.md5.to_hex()),
                    ("slice-md5", digest.slice_md5.to_hex()),
                    ("content-crc32", digest.crc32.to_string()),
                    ("rtype", policy.rtype().to_string()),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK => file_from_value(value.get("info").unwrap_or(&value), &what).map(Some),
                errno::RAPID_NO_MATCH => Ok(None),
                errno::FILE_EXISTS => Err(Error::Conflict(format!(
                    "{remote_path} already exists on the server"
                ))),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    ///
    /// Declare an upload: its destination, size, and the ordered per-chunk MD5 list. The chunk
    /// structure is immutable for the lifetime of the returned upload id.
    ///
    pub async fn precreate(
        &self,
        remote_path: &str,
        size: u64,
        block_md5s: &[Fingerprint],
        policy: OverwritePolicy,
    ) -> Result<Precreated, Error> {
        let what = format!("precreate of {remote_path}");
        let block_list = block_list_json(block_md5s)?;
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .post(self.file_url.clone())
                .query(&[("method", "precreate"), ("access_token", token.as_str())])
                .form(&[
                    ("path", remote_path.to_owned()),
                    ("size", size.to_string()),
                    ("isdir", "0".to_owned()),
                    ("autoinit", "1".to_owned()),
                    ("block_list", block_list.clone()),
                    ("rtype", policy.rtype().to_string()),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK => {
                    let wire: PrecreateWire = from_value(&value, &what)?;
                    let upload_id = match wire.uploadid {
                        Some(id) if !id.is_empty() => id,
                        _ => {
                            return Err(Error::Protocol(format!(
                                "Response for {what} contained no upload id"
                            )));
                        }
                    };
                    // An omitted index list means the server wants every chunk.
                    let needed = wire
                        .block_list
                        .unwrap_or_else(|| (0..block_md5s.len()).collect());
                    if let Some(index) = needed.iter().find(|index| **index >= block_md5s.len()) {
                        return Err(Error::Protocol(format!(
                            "Response for {what} wants chunk {index}, but only {} were declared",
                            block_md5s.len()
                        )));
                    }
                    Ok(Precreated { upload_id, needed })
                }
                errno::FILE_EXISTS => Err(Error::Conflict(format!(
                    "{remote_path} already exists on the server"
                ))),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    ///
    /// Upload the bytes of chunk `index` under `upload_id`. Returns the MD5 the server computed
    /// for the received bytes, which callers compare against the declared block MD5.
    ///
    pub async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        index: usize,
        bytes: Bytes,
    ) -> Result<Fingerprint, Error> {
        let what = format!("upload of chunk {index} of {remote_path}");
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| {
            let bytes = bytes.clone();
            let what = what.clone();
            async move {
                let token = self.tokens.current_token().await?;
                let form = multipart::Form::new()
                    .part("file", multipart::Part::bytes(bytes.to_vec()).file_name("file"));
                let response = self
                    .data_http
                    .post(self.superfile_url.clone())
                    .query(&[
                        ("method", "upload".to_owned()),
                        ("access_token", token),
                        ("type", "tmpfile".to_owned()),
                        ("path", remote_path.to_owned()),
                        ("uploadid", upload_id.to_owned()),
                        ("partseq", index.to_string()),
                    ])
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| send_error(&what, &e))?;
                let value = decode_json(response, &what).await?;
                match common_errno(&value, &what)? {
                    errno::OK => match value.get("md5").and_then(Value::as_str) {
                        Some(hex) => Fingerprint::from_hex_string(hex).map_err(|e| {
                            Error::Protocol(format!("Bad md5 in response for {what}: {e}"))
                        }),
                        None => Err(Error::Protocol(format!(
                            "Response for {what} contained no md5"
                        ))),
                    },
                    errno::UPLOAD_ID_EXPIRED => Err(Error::Expired(format!(
                        "The server no longer recognizes upload id {upload_id}"
                    ))),
                    other => Err(provider_error(other, &what)),
                }
            }
        })
        .await
    }

    ///
    /// Commit an upload. The ordered block MD5 list must match the one declared at precreate
    /// time, and every chunk must have been received by the server.
    ///
    pub async fn create(
        &self,
        upload_id: &str,
        remote_path: &str,
        size: u64,
        block_md5s: &[Fingerprint],
        policy: OverwritePolicy,
    ) -> Result<RemoteFile, Error> {
        let what = format!("create of {remote_path}");
        let block_list = block_list_json(block_md5s)?;
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .post(self.file_url.clone())
                .query(&[("method", "create"), ("access_token", token.as_str())])
                .form(&[
                    ("path", remote_path.to_owned()),
                    ("size", size.to_string()),
                    ("isdir", "0".to_owned()),
                    ("uploadid", upload_id.to_owned()),
                    ("block_list", block_list.clone()),
                    ("rtype", policy.rtype().to_string()),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK => file_from_value(&value, &what),
                errno::UPLOAD_ID_EXPIRED => Err(Error::Expired(format!(
                    "The server no longer recognizes upload id {upload_id}"
                ))),
                errno::FILE_EXISTS => Err(Error::Conflict(format!(
                    "{remote_path} already exists on the server"
                ))),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    /// Fetch metadata for one remote path. `Ok(None)` when the path does not exist.
    pub async fn meta(&self, remote_path: &str) -> Result<Option<RemoteFile>, Error> {
        let what = format!("meta of {remote_path}");
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .get(self.file_url.clone())
                .query(&[
                    ("method", "meta"),
                    ("access_token", token.as_str()),
                    ("path", remote_path),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK => file_from_value(value.get("info").unwrap_or(&value), &what).map(Some),
                errno::NO_SUCH_FILE => Ok(None),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    ///
    /// List one page of a directory. `start` is the provider's pagination cursor; a returned
    /// `Some(next)` means more pages exist and must be fetched before the listing is complete.
    ///
    pub async fn list(
        &self,
        remote_dir: &str,
        recursive: bool,
        start: u32,
    ) -> Result<(Vec<RemoteFile>, Option<u32>), Error> {
        let what = format!("list of {remote_dir}");
        let method = if recursive { "listall" } else { "list" };
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .get(self.file_url.clone())
                .query(&[
                    ("method", method.to_owned()),
                    ("access_token", token),
                    ("dir", remote_dir.to_owned()),
                    ("start", start.to_string()),
                    ("limit", LIST_PAGE_SIZE.to_string()),
                    ("recursion", if recursive { "1" } else { "0" }.to_owned()),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK => {
                    let wire: ListWire = from_value(&value, &what)?;
                    let entries = wire
                        .list
                        .into_iter()
                        .map(|entry| entry.into_remote(&what))
                        .collect::<Result<Vec<_>, _>>()?;
                    let next = if wire.has_more != 0 {
                        Some(wire.cursor)
                    } else {
                        None
                    };
                    Ok((entries, next))
                }
                errno::NO_SUCH_FILE => Err(Error::NotFound(format!(
                    "{remote_dir} does not exist on the server"
                ))),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    /// Acquire a short-lived signed download URL for `fsid`.
    pub async fn dlink(&self, fsid: u64) -> Result<Url, Error> {
        let what = format!("dlink for fsid {fsid}");
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .get(self.file_url.clone())
                .query(&[
                    ("method", "dlink".to_owned()),
                    ("access_token", token),
                    ("fsid", fsid.to_string()),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK => match value.get("dlink").and_then(Value::as_str) {
                    Some(raw) => Url::parse(raw).map_err(|e| {
                        Error::Protocol(format!("Unparseable dlink in response for {what}: {e}"))
                    }),
                    None => Err(Error::Protocol(format!(
                        "Response for {what} contained no dlink"
                    ))),
                },
                errno::NO_SUCH_FILE => {
                    Err(Error::NotFound(format!("fsid {fsid} does not exist")))
                }
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    ///
    /// Open a (possibly ranged) read of a signed download URL. No harness here: segment-level
    /// retry and link refresh belong to the downloader, which must distinguish an expired link
    /// (HTTP 403 → `Error::Expired`) from an ordinary transient failure.
    ///
    pub async fn read_dlink(
        &self,
        dlink: &Url,
        range: Option<Range<u64>>,
    ) -> Result<reqwest::Response, Error> {
        let what = format!("read of {dlink}");
        let token = self.tokens.current_token().await?;
        let mut request = self
            .data_http
            .get(dlink.clone())
            .query(&[("access_token", token.as_str())]);
        if let Some(range) = &range {
            request = request.header(
                header::RANGE,
                format!("bytes={}-{}", range.start, range.end - 1),
            );
        }
        let response = request.send().await.map_err(|e| send_error(&what, &e))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            Err(Error::AuthExpired(format!("HTTP 401 for {what}")))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::Expired(format!(
                "The server rejected the signed link (HTTP 403) for {what}"
            )))
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(Error::Transient(format!(
                "Server error ({}) for {}",
                status.as_str(),
                what
            )))
        } else if status.is_client_error() {
            Err(Error::Protocol(format!(
                "Client error ({}) for {}",
                status.as_str(),
                what
            )))
        } else {
            Ok(response)
        }
    }

    /// Create a remote directory. Creating a directory that already exists is not an error.
    pub async fn mkdir(&self, remote_path: &str) -> Result<(), Error> {
        let what = format!("mkdir of {remote_path}");
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .post(self.file_url.clone())
                .query(&[("method", "create"), ("access_token", token.as_str())])
                .form(&[
                    ("path", remote_path.to_owned()),
                    ("isdir", "1".to_owned()),
                    ("rtype", "0".to_owned()),
                ])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK | errno::FILE_EXISTS => Ok(()),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }

    /// Delete one remote file or directory (recursively). Deleting a missing path is not an
    /// error.
    pub async fn delete(&self, remote_path: &str) -> Result<(), Error> {
        let what = format!("delete of {remote_path}");
        let filelist = serde_json::to_string(&[remote_path])
            .map_err(|e| Error::Protocol(format!("Failed to encode {what}: {e}")))?;
        retry::retry_call(self.retry, self.tokens.as_ref(), |_| async {
            let token = self.tokens.current_token().await?;
            let response = self
                .http
                .post(self.file_url.clone())
                .query(&[
                    ("method", "filemanager"),
                    ("access_token", token.as_str()),
                    ("opera", "delete"),
                ])
                .form(&[("filelist", filelist.clone()), ("async", "0".to_owned())])
                .send()
                .await
                .map_err(|e| send_error(&what, &e))?;
            let value = decode_json(response, &what).await?;
            match common_errno(&value, &what)? {
                errno::OK | errno::NO_SUCH_FILE => Ok(()),
                other => Err(provider_error(other, &what)),
            }
        })
        .await
    }
}

#[derive(Deserialize)]
struct FileInfoWire {
    fs_id: Option<u64>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    isdir: u8,
    #[serde(default)]
    server_mtime: u64,
    #[serde(default)]
    md5: Option<String>,
}

impl FileInfoWire {
    fn into_remote(self, what: &str) -> Result<RemoteFile, Error> {
        let fsid = self.fs_id.ok_or_else(|| {
            Error::Protocol(format!("Response for {what} contained no fs_id"))
        })?;
        let md5 = match self.md5 {
            None => None,
            Some(hex) => Some(Fingerprint::from_hex_string(&hex).map_err(|e| {
                Error::Protocol(format!("Bad md5 in response for {what}: {e}"))
            })?),
        };
        Ok(RemoteFile {
            fsid,
            path: self.path,
            size: self.size,
            mtime: self.server_mtime,
            is_dir: self.isdir != 0,
            md5,
        })
    }
}

#[derive(Deserialize)]
struct PrecreateWire {
    uploadid: Option<String>,
    block_list: Option<Vec<usize>>,
}

#[derive(Deserialize)]
struct ListWire {
    #[serde(default)]
    list: Vec<FileInfoWire>,
    #[serde(default)]
    has_more: u8,
    #[serde(default)]
    cursor: u32,
}

fn block_list_json(block_md5s: &[Fingerprint]) -> Result<String, Error> {
    let hexes: Vec<String> = block_md5s.iter().map(Fingerprint::to_hex).collect();
    serde_json::to_string(&hexes)
        .map_err(|e| Error::Protocol(format!("Failed to encode block list: {e}")))
}

fn send_error(what: &str, err: &reqwest::Error) -> Error {
    // Connection resets, timeouts and interrupted bodies are all worth a retry.
    Error::Transient(format!("Error requesting {what}: {err}"))
}

/// Decode a JSON response body after classifying the HTTP status.
async fn decode_json(response: reqwest::Response, what: &str) -> Result<Value, Error> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::AuthExpired(format!("HTTP 401 for {what}")));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::Transient(format!(
            "Server error ({}) for {}",
            status.as_str(),
            what
        )));
    }
    if status.is_client_error() {
        return Err(Error::Protocol(format!(
            "Client error ({}) for {}",
            status.as_str(),
            what
        )));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("Malformed response for {what}: {e}")))
}

///
/// Pull the `errno` out of a response envelope, classifying the codes that are common to every
/// endpoint (auth expiry and rate limiting). Endpoint-specific codes are returned for the call
/// site to interpret.
///
fn common_errno(value: &Value, what: &str) -> Result<i64, Error> {
    let code = value.get("errno").and_then(Value::as_i64).unwrap_or(0);
    match code {
        errno::TOKEN_INVALID | errno::TOKEN_EXPIRED | errno::NOT_AUTHORIZED => Err(
            Error::AuthExpired(format!("Provider code {code} for {what}")),
        ),
        errno::RATE_LIMITED => Err(Error::Transient(format!(
            "Provider rate limit (code {code}) for {what}"
        ))),
        other => Ok(other),
    }
}

fn provider_error(code: i64, what: &str) -> Error {
    Error::Protocol(format!("Unexpected provider code {code} for {what}"))
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T, Error> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Protocol(format!("Malformed response for {what}: {e}")))
}

fn file_from_value(value: &Value, what: &str) -> Result<RemoteFile, Error> {
    let wire: FileInfoWire = from_value(value, what)?;
    wire.into_remote(what)
}
