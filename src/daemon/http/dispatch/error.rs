//! Dispatch error handling.

use crate::commons::error::Error;

use super::super::response::HttpResponse;


//------------ DispatchError -------------------------------------------------

/// An error occured during dispatch.
///
/// This error type exists so you can use the question mark operator for all
/// sorts of things during dispatch. Every error ends up as a response sent
/// back to the client.
#[derive(Debug)]
pub enum DispatchError {
    Response(HttpResponse),
}

impl From<HttpResponse> for DispatchError {
    fn from(src: HttpResponse) -> Self {
        Self::Response(src)
    }
}

impl From<Error> for DispatchError {
    fn from(src: Error) -> Self {
        Self::Response(HttpResponse::response_from_error(src))
    }
}
