//! API endpoints for the dispatch service.
//! All endpoints use JSON for request/response bodies.

use actix_web::{get, post, web, HttpResponse, Responder, ResponseError};
use crate::models::{CompleteRide, MatchRequestBody, ReservationAction, UpdateDriverRequest};
use crate::service::DispatchService;

/// Driver heartbeat: position and availability upsert.
///
/// # Returns
/// - 200 OK with the echoed driver state
/// - 400 Bad Request for an empty id or out-of-range coordinates
#[post("/drivers")]
pub async fn update_driver(
    request: web::Json<UpdateDriverRequest>,
    service: web::Data<DispatchService>,
) -> impl Responder {
    match service.update_driver(request.into_inner()) {
        Ok(driver) => HttpResponse::Ok().json(driver),
        Err(e) => e.error_response(),
    }
}

/// Driver lookup.
///
/// # Returns
/// - 200 OK with the driver state
/// - 404 Not Found for an unknown id
#[get("/drivers/{id}")]
pub async fn get_driver(
    path: web::Path<String>,
    service: web::Data<DispatchService>,
) -> impl Responder {
    match service.get_driver(&path.into_inner()) {
        Ok(driver) => HttpResponse::Ok().json(driver),
        Err(e) => e.error_response(),
    }
}

/// Match a rider with the closest available driver.
///
/// The winning driver is reserved for the rider's session until the ride is
/// confirmed, cancelled, or the reservation times out.
///
/// # Returns
/// - 200 OK with `success: true` and the reserved driver
/// - 200 OK with `success: false` if no driver is available within the radius
/// - 400 Bad Request if request data is invalid
#[post("/match")]
pub async fn match_rider(
    request: web::Json<MatchRequestBody>,
    service: web::Data<DispatchService>,
) -> impl Responder {
    match service.match_rider(request.into_inner()) {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => e.error_response(),
    }
}

/// Confirm a reservation (RESERVED -> ASSIGNED).
#[post("/dispatch/confirm")]
pub async fn confirm(
    request: web::Json<ReservationAction>,
    service: web::Data<DispatchService>,
) -> impl Responder {
    match service.confirm(request.into_inner()) {
        Ok(driver) => HttpResponse::Ok().json(driver),
        Err(e) => e.error_response(),
    }
}

/// Cancel a reservation immediately (RESERVED -> AVAILABLE).
#[post("/dispatch/cancel")]
pub async fn cancel(
    request: web::Json<ReservationAction>,
    service: web::Data<DispatchService>,
) -> impl Responder {
    match service.cancel(request.into_inner()) {
        Ok(driver) => HttpResponse::Ok().json(driver),
        Err(e) => e.error_response(),
    }
}

/// Finish a ride (ASSIGNED -> AVAILABLE).
#[post("/dispatch/complete")]
pub async fn complete(
    request: web::Json<CompleteRide>,
    service: web::Data<DispatchService>,
) -> impl Responder {
    match service.complete(request.into_inner()) {
        Ok(driver) => HttpResponse::Ok().json(driver),
        Err(e) => e.error_response(),
    }
}

/// Liveness check.
#[get("/health")]
pub async fn health(service: web::Data<DispatchService>) -> impl Responder {
    HttpResponse::Ok().json(service.health_status())
}

/// Registers every endpoint on an actix service config.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(update_driver)
        .service(get_driver)
        .service(match_rider)
        .service(confirm)
        .service(cancel)
        .service(complete)
        .service(health);
}
