//! HTTP responses.

use bytes::Bytes;
use http_body_util::{Either, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;
use serde::Serialize;

use crate::commons::error::Error;


//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy)]
enum ContentType {
    Json,
    Text,
    Prometheus,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
            ContentType::Prometheus => "text/plain; version=0.0.4",
        }
    }
}


//------------ HyperResponse -------------------------------------------------

pub type HyperResponseBody = Either<Empty<Bytes>, Full<Bytes>>;
pub type HyperResponse = hyper::Response<HyperResponseBody>;


//----------- Response -------------------------------------------------------

struct Response {
    status: StatusCode,
    content_type: ContentType,
    body: Bytes,
    cause: Option<Error>,
}

impl Response {
    fn new(status: StatusCode) -> Self {
        Response {
            status,
            content_type: ContentType::Text,
            body: Bytes::default(),
            cause: None,
        }
    }

    fn finalize(self) -> HttpResponse {
        let body = if self.body.is_empty() {
            Either::Left(Empty::new())
        }
        else {
            Either::Right(Full::new(self.body))
        };
        let mut response = hyper::Response::new(body);
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            CONTENT_TYPE, HeaderValue::from_static(self.content_type.as_str())
        );
        HttpResponse { response, cause: self.cause }
    }
}


//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse {
    response: HyperResponse,
    cause: Option<Error>,
}

impl HttpResponse {
    pub fn into_hyper(self) -> HyperResponse {
        self.response
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// The error this response was made from, if any.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    fn ok_response(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Response {
            status: StatusCode::OK,
            content_type,
            body: body.into(),
            cause: None,
        }.finalize()
    }

    pub fn json<O: Serialize>(object: &O) -> Self {
        match serde_json::to_string(object) {
            Ok(json) => Self::ok_response(ContentType::Json, json),
            Err(e) => Self::response_from_error(Error::JsonError(e)),
        }
    }

    pub fn prometheus(body: impl Into<Bytes>) -> Self {
        Self::ok_response(ContentType::Prometheus, body)
    }

    pub fn response_from_error(error: Error) -> Self {
        let status = error.status();
        let body = serde_json::to_string(
            &error.to_error_response()
        ).unwrap_or_default();
        Response {
            status,
            content_type: ContentType::Json,
            body: body.into(),
            cause: Some(error),
        }.finalize()
    }

    pub fn ok() -> Self {
        Response::new(StatusCode::OK).finalize()
    }

    pub fn not_found() -> Self {
        Response::new(StatusCode::NOT_FOUND).finalize()
    }

    pub fn method_not_allowed() -> Self {
        Response::new(StatusCode::METHOD_NOT_ALLOWED).finalize()
    }
}
