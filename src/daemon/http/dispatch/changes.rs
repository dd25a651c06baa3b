//! Feeding the built-in change log.

use crate::server::source::Change;

use super::super::request::{PathIter, Request};
use super::super::response::HttpResponse;
use super::error::DispatchError;


//------------ /changes/{resource} -------------------------------------------

/// Appends a JSON array of changes, returns their encoded cursors.
pub async fn dispatch(
    request: Request<'_>,
    mut path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    let resource = path.next().ok_or_else(HttpResponse::not_found)?;
    path.check_exhausted()?;
    request.check_post()?;
    let (server, changes) = request.read_json::<Vec<Change>>().await?;
    let cursors: Vec<_> = server.eventd().append_changes(resource, changes)?
        .iter()
        .map(|cursor| cursor.encode())
        .collect();
    Ok(HttpResponse::json(&cursors))
}
