//! Prometheus-format metrics.

use super::super::request::{PathIter, Request};
use super::super::response::HttpResponse;
use super::error::DispatchError;


pub async fn dispatch(
    request: Request<'_>,
    path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    path.check_exhausted()?;
    request.check_get()?;
    let server = request.empty()?;
    Ok(HttpResponse::prometheus(server.eventd().metrics().await?))
}
