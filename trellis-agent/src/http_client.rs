// Copyright 2024 The Trellis Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::client::legacy::connect::HttpConnector as LegacyHttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::DeserializeOwned;
use trellis_error::{Code, Error, make_err};

/// Closest code for a bare status line from a non-trellis endpoint.
/// Trellis services never get here, their error body decodes first.
const fn code_for_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::InvalidArgument,
        404 => Code::NotFound,
        408 | 504 => Code::DeadlineExceeded,
        409 => Code::Aborted,
        429 | 502 | 503 => Code::Unavailable,
        501 => Code::Unimplemented,
        _ => Code::Internal,
    }
}

fn remote_error(status: StatusCode, body: &Bytes, uri: &str) -> Error {
    if let Ok(remote) = serde_json::from_slice::<Error>(body) {
        return remote.append(format!("while calling {uri}"));
    }
    make_err!(
        code_for_status(status),
        "Request to {uri} returned status {status}: {}",
        String::from_utf8_lossy(body),
    )
}

fn encode_json<B: Serialize>(request: &B, path: &str) -> Result<Bytes, Error> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|e| make_err!(Code::Internal, "Failed to encode request body for {path}: {e}"))
}

fn decode_json<T: DeserializeOwned>(body: &Bytes, path: &str) -> Result<T, Error> {
    serde_json::from_slice(body)
        .map_err(|e| make_err!(Code::Internal, "Failed to decode response from {path}: {e}"))
}

/// JSON-over-HTTP client shared by the authority, runtime, and overlay
/// wrappers. Small bodies both ways; remote failures arrive either as a
/// serialized [`Error`] or as a bare status line.
#[derive(Clone)]
pub(crate) struct JsonClient {
    client: LegacyClient<LegacyHttpConnector, Full<Bytes>>,
    base: String,
}

impl JsonClient {
    pub(crate) fn new(endpoint: &str) -> Self {
        Self {
            client: LegacyClient::builder(TokioExecutor::new()).build(LegacyHttpConnector::new()),
            base: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.base
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<(StatusCode, Bytes), Error> {
        let uri = format!("{}{path}", self.base);
        let mut builder = http::Request::builder().method(method).uri(&uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| make_err!(Code::Internal, "Failed to build request for {uri}: {e}"))?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "Failed request to {uri}: {e}"))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "Failed reading response from {uri}: {e}"))?
            .to_bytes();
        Ok((status, body))
    }

    async fn request_checked(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, Error> {
        let uri = format!("{}{path}", self.base);
        let (status, body) = self.request(method, path, body).await?;
        if !status.is_success() {
            return Err(remote_error(status, &body, &uri));
        }
        Ok(body)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let body = self.request_checked(Method::GET, path, None).await?;
        decode_json(&body, path)
    }

    /// Like `get_json`, but a 404 becomes `None` instead of an error.
    pub(crate) async fn get_json_opt<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, Error> {
        let uri = format!("{}{path}", self.base);
        let (status, body) = self.request(Method::GET, path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(remote_error(status, &body, &uri));
        }
        decode_json(&body, path).map(Some)
    }

    pub(crate) async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        request: &B,
    ) -> Result<T, Error> {
        let encoded = encode_json(request, path)?;
        let body = self
            .request_checked(Method::POST, path, Some(encoded))
            .await?;
        decode_json(&body, path)
    }

    /// POST where only acceptance matters; the response body is dropped.
    pub(crate) async fn post_unit<B: Serialize>(&self, path: &str, request: &B) -> Result<(), Error> {
        let encoded = encode_json(request, path)?;
        self.request_checked(Method::POST, path, Some(encoded))
            .await
            .map(|_| ())
    }

    pub(crate) async fn delete_unit(&self, path: &str) -> Result<(), Error> {
        self.request_checked(Method::DELETE, path, None)
            .await
            .map(|_| ())
    }

    /// GET where only the status line matters, used for liveness probes.
    pub(crate) async fn get_unit(&self, path: &str) -> Result<(), Error> {
        self.request_checked(Method::GET, path, None)
            .await
            .map(|_| ())
    }
}
