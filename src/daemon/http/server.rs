//! The admin HTTP server.

use std::convert::Infallible;
use std::sync::Arc;

use log::{debug, error, log_enabled, warn};

use crate::config::Config;
use crate::constants::HTTP_POST_LIMIT_API;
use crate::server::manager::EventServer;

use super::dispatch::{dispatch_request, DispatchError};
use super::request::{HyperRequest, PathIter, Request};
use super::response::HyperResponse;


//------------ HttpServer ----------------------------------------------------

/// Answers admin requests on behalf of an [`EventServer`].
pub struct HttpServer {
    eventd: Arc<EventServer>,
    config: Arc<Config>,
}

impl HttpServer {
    pub fn new(eventd: Arc<EventServer>, config: Arc<Config>) -> Self {
        HttpServer { eventd, config }
    }

    pub fn eventd(&self) -> &EventServer {
        &self.eventd
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn process_request(
        &self, request: HyperRequest
    ) -> Result<HyperResponse, Infallible> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let request = Request::new(request, self, HTTP_POST_LIMIT_API);

        let response = match dispatch_request(
            request, PathIter::new(&path)
        ).await {
            Ok(response) => response,
            Err(DispatchError::Response(response)) => response,
        };

        let status = response.status();
        if status.is_server_error() {
            match response.cause() {
                Some(cause) => error!("{method} {path}: {status} {cause}"),
                None => error!("{method} {path}: {status}"),
            }
        }
        else if status.is_client_error() {
            match response.cause() {
                Some(cause) => warn!("{method} {path}: {status} {cause}"),
                None => debug!("{method} {path}: {status}"),
            }
        }
        else if log_enabled!(log::Level::Debug) {
            debug!("{method} {path}: {status}");
        }
        Ok(response.into_hyper())
    }
}
