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

use axum::Json;
use axum::response::{IntoResponse, Response};
use hyper::StatusCode;
use trellis_error::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Renders an [`Error`] as an HTTP response. The body is the serialized
/// error itself, so a trellis client on the other side can rebuild the
/// error losslessly instead of re-deriving a code from the status line.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from(self.0.code);
        (status, Json(self.0)).into_response()
    }
}
