//! Managing subscriptions.

use hyper::Method;

use crate::api::{Subscription, SubscriptionId};

use super::super::request::{PathIter, Request};
use super::super::response::HttpResponse;
use super::error::DispatchError;


//------------ /subscriptions ------------------------------------------------

pub async fn dispatch(
    request: Request<'_>,
    mut path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    if path.check_exhausted().is_ok() {
        return match *request.method() {
            Method::GET => list(request),
            Method::POST => upsert(request).await,
            _ => Ok(HttpResponse::method_not_allowed()),
        }
    }

    let id: SubscriptionId = path.parse_next()?;
    match path.next() {
        None => match *request.method() {
            Method::GET => show(request, id),
            Method::DELETE => delete(request, id),
            _ => Ok(HttpResponse::method_not_allowed()),
        },
        Some("statistics") => statistics(request, path, id).await,
        _ => Ok(HttpResponse::not_found()),
    }
}

fn list(request: Request<'_>) -> Result<HttpResponse, DispatchError> {
    let server = request.empty()?;
    Ok(HttpResponse::json(&server.eventd().list_subscriptions()))
}

async fn upsert(request: Request<'_>) -> Result<HttpResponse, DispatchError> {
    let (server, sub) = request.read_json::<Subscription>().await?;
    Ok(HttpResponse::json(&server.eventd().upsert_subscription(sub)?))
}


//------------ /subscriptions/{id} -------------------------------------------

fn show(
    request: Request<'_>, id: SubscriptionId
) -> Result<HttpResponse, DispatchError> {
    let server = request.empty()?;
    match server.eventd().get_subscription(id) {
        Some(sub) => Ok(HttpResponse::json(&sub)),
        None => Ok(HttpResponse::not_found()),
    }
}

fn delete(
    request: Request<'_>, id: SubscriptionId
) -> Result<HttpResponse, DispatchError> {
    let server = request.empty()?;
    server.eventd().delete_subscription(id)?;
    Ok(HttpResponse::ok())
}

async fn statistics(
    request: Request<'_>, path: PathIter<'_>, id: SubscriptionId
) -> Result<HttpResponse, DispatchError> {
    path.check_exhausted()?;
    request.check_get()?;
    let server = request.empty()?;
    Ok(HttpResponse::json(
        &server.eventd().subscription_statistics(id).await?
    ))
}
