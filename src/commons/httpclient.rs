//! Some helper functions for HTTP calls
use std::{fmt, time::Duration};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT},
    StatusCode,
};
use serde::Serialize;

use crate::constants::{
    CALLBACK_RESPONSE_LIMIT, DEFAULT_CALLBACK_TIMEOUT_SECS, EVENTD_VERSION,
};

const JSON_CONTENT: &str = "application/json";


//------------ CallbackResponse ----------------------------------------------

/// What a subscriber answered to a callback.
///
/// Any status is returned as a response here, judging whether it counts as
/// a confirmation is up to the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallbackResponse {
    pub status: StatusCode,
    pub body: String,
}


//------------ HttpClient ----------------------------------------------------

/// A client for subscriber callbacks.
///
/// The underlying connection pool is shared by all clones.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    #[allow(clippy::result_large_err)]
    pub fn new() -> Result<Self, Error> {
        client_with_tweaks(
            "callback", Duration::from_secs(DEFAULT_CALLBACK_TIMEOUT_SECS)
        ).map(|client| HttpClient { client })
    }

    /// Performs a POST of data that can be serialized into json, and
    /// returns the status and body of whatever the server answered.
    pub async fn post_json(
        &self,
        uri: &str,
        data: &impl Serialize,
        timeout: Duration,
    ) -> Result<CallbackResponse, Error> {
        let body = serde_json::to_vec(data)
            .map_err(|e| Error::request_build_json(uri, e))?;
        self.post_bytes(uri, Bytes::from(body), timeout).await
    }

    pub async fn post_bytes(
        &self,
        uri: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<CallbackResponse, Error> {
        let mut res = self.client
            .post(uri)
            .headers(headers(uri, Some(JSON_CONTENT))?)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::execute(uri, e))?;

        // Only a bounded prefix of the body is kept, the rest is never
        // read.
        let status = res.status();
        let mut body = Vec::new();
        while let Some(chunk) = res.chunk().await.map_err(|e| {
            Error::response(uri, format!("cannot get body: {e}"))
        })? {
            let room = CALLBACK_RESPONSE_LIMIT - body.len();
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                break
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();
        Ok(CallbackResponse { status, body })
    }
}

/// Client with tweaks. Callbacks never follow redirects, a subscriber has
/// to register the URL it actually serves.
#[allow(clippy::result_large_err)]
fn client_with_tweaks(
    uri: &str, timeout: Duration
) -> Result<reqwest::Client, Error> {
    reqwest::ClientBuilder::new()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::request_build(uri, e))
}

#[allow(clippy::result_large_err)]
fn headers(
    uri: &str, content_type: Option<&str>
) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let ua = format!("eventd/{EVENTD_VERSION}");
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&ua).map_err(|e| Error::request_build(uri, e))?,
    );
    if let Some(content_type) = content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type)
                .map_err(|e| Error::request_build(uri, e))?,
        );
    }
    Ok(headers)
}


//------------ Error ---------------------------------------------------------

type ErrorUri = String;
type ErrorMessage = String;

#[derive(Debug)]
pub enum Error {
    RequestBuild(ErrorUri, ErrorMessage),
    RequestExecute(ErrorUri, ErrorMessage),
    Response(ErrorUri, ErrorMessage),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => write!(
                f, "Issue creating request for URI: {uri}, error: {msg}"
            ),
            Error::RequestExecute(uri, msg) => write!(
                f, "Issue accessing URI: {uri}, error: {msg}"
            ),
            Error::Response(uri, msg) => write!(
                f, "Issue processing response from URI: {uri}, error: {msg}"
            ),
        }
    }
}

impl std::error::Error for Error { }

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn request_build_json(uri: &str, e: impl fmt::Display) -> Self {
        Error::RequestBuild(
            uri.to_string(),
            format!("could not serialize type to JSON: {e}")
        )
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestExecute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }
}


//------------ Tests ---------------------------------------------------------
