//! HTTP requests.

use std::str::FromStr;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::Method;
use serde::de::DeserializeOwned;

use crate::commons::error::Error;

use super::response::HttpResponse;
use super::server::HttpServer;


//------------ HyperRequest --------------------------------------------------

/// A type alias for the request we receive from Hyper.
pub type HyperRequest = hyper::Request<hyper::body::Incoming>;


//------------ Request -------------------------------------------------------

/// A request together with the server handling it.
pub struct Request<'a> {
    request: HyperRequest,
    server: &'a HttpServer,

    /// The maximum size of a request body.
    post_limit: u64,
}

impl<'a> Request<'a> {
    pub fn new(
        request: HyperRequest, server: &'a HttpServer, post_limit: u64
    ) -> Self {
        Request { request, server, post_limit }
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Returns the path of the request URI.
    pub fn path(&self) -> String {
        self.request.uri().path().to_string()
    }

    pub fn check_get(&self) -> Result<(), HttpResponse> {
        self.check_method(Method::GET)
    }

    pub fn check_post(&self) -> Result<(), HttpResponse> {
        self.check_method(Method::POST)
    }

    pub fn check_delete(&self) -> Result<(), HttpResponse> {
        self.check_method(Method::DELETE)
    }

    fn check_method(&self, method: Method) -> Result<(), HttpResponse> {
        if *self.request.method() == method {
            Ok(())
        }
        else {
            Err(HttpResponse::method_not_allowed())
        }
    }

    /// Ensures the body is empty and hands out the server.
    pub fn empty(self) -> Result<&'a HttpServer, Error> {
        if self.request.body().size_hint().lower() != 0 {
            return Err(Error::custom("unexpected request body"))
        }
        Ok(self.server)
    }

    /// Get a json object from a post body.
    pub async fn read_json<T: DeserializeOwned>(
        self
    ) -> Result<(&'a HttpServer, T), Error> {
        let (server, bytes) = self.read_body().await?;
        let json = serde_json::from_slice(&bytes).map_err(Error::JsonError)?;
        Ok((server, json))
    }

    async fn read_body(self) -> Result<(&'a HttpServer, Bytes), Error> {
        // If the Content-Length already tells us the body is too big we
        // say so. Otherwise reading stops at the limit and any failure is
        // reported as unreadable.
        if self.request.body().size_hint().lower() > self.post_limit {
            return Err(Error::PostTooBig)
        }

        Ok((
            self.server,
            Limited::new(
                self.request.into_body(),
                self.post_limit.try_into().unwrap_or(usize::MAX),
            ).collect().await.map_err(|_| {
                Error::PostCannotRead
            })?.to_bytes()
        ))
    }
}


//------------ PathIter ------------------------------------------------------

/// Iterates over the segments of a request path.
#[derive(Debug)]
pub struct PathIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> PathIter<'a> {
    /// Creates an iterator, ignoring a trailing slash.
    pub fn new(path: &'a str) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        PathIter {
            remaining: if path.is_empty() { None } else { Some(path) }
        }
    }

    /// Checks that the path has been exhausted.
    ///
    /// Returns a 404 error response if it isn’t.
    pub fn check_exhausted(&self) -> Result<(), HttpResponse> {
        if self.remaining.is_some() {
            Err(HttpResponse::not_found())
        }
        else {
            Ok(())
        }
    }

    /// Parses the next segment as the given type.
    pub fn parse_next<T: FromStr>(&mut self) -> Result<T, Error> {
        let segment = self.next().ok_or(Error::ApiUnknownResource)?;
        T::from_str(segment).map_err(|_| {
            Error::ApiInvalidId(segment.to_string())
        })
    }
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        match remaining.split_once('/') {
            Some((head, tail)) => {
                self.remaining = Some(tail);
                Some(head)
            }
            None => {
                self.remaining = None;
                Some(remaining)
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------
