use actix_web::dev::ServiceRequest;
use actix_web::{Error, web};
use actix_web_httpauth::extractors::AuthenticationError;
use actix_web_httpauth::extractors::bearer::{self, BearerAuth};

/// The static API key configured at startup, stored as app data so the
/// bearer validator can reach it.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Bearer validator for `/api` routes. Only mounted when an API key is
/// configured; requests missing the key or carrying the wrong one get a 401.
pub async fn validate_api_key(
    req: ServiceRequest,
    credentials: BearerAuth,
) -> Result<ServiceRequest, (Error, ServiceRequest)> {
    let expected = req.app_data::<web::Data<ApiKey>>().map(|key| key.0.clone());
    match expected {
        Some(key) if credentials.token() == key => Ok(req),
        _ => {
            log::warn!("rejected request to {} with invalid API key", req.path());
            let config = req
                .app_data::<bearer::Config>()
                .cloned()
                .unwrap_or_default();
            Err((AuthenticationError::from(config).into(), req))
        }
    }
}
