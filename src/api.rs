use crate::{
    device_service_client::{Credentials, DeviceControl},
    error::ProvisioningError,
    pages,
    supervisor::PortalState,
};
use actix_web::{
    HttpRequest, HttpResponse, ResponseError,
    http::{
        StatusCode,
        header::{self, ContentType},
    },
    web,
};
use log::{debug, error, warn};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct TokenInput {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
pub struct ConnectForm {
    #[serde(default)]
    token: String,
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
pub struct IndexQuery {
    ssid: Option<String>,
}

pub struct Api<D: DeviceControl> {
    pub state: PortalState<D>,
}

impl<D: DeviceControl> Clone for Api<D> {
    fn clone(&self) -> Self {
        Api {
            state: self.state.clone(),
        }
    }
}

impl<D: DeviceControl + 'static> Api<D> {
    pub fn new(state: PortalState<D>) -> Self {
        Api { state }
    }

    /// Route table of the portal. Expects `web::Data<Self>` in app data.
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.route("/", web::get().to(Self::index))
            .route("/connect", web::post().to(Self::connect))
            .route("/stepper", web::get().to(Self::stepper))
            .route("/stepper", web::post().to(Self::stepper))
            .route("/runStepper", web::get().to(Self::stepper))
            .route("/runStepper", web::post().to(Self::stepper))
            .route("/reset", web::get().to(Self::reset))
            .route("/reset", web::post().to(Self::reset))
            .route("/scan", web::get().to(Self::scan))
            .route("/status", web::get().to(Self::status))
            .default_service(web::route().to(Self::redirect_to_portal));
    }

    pub async fn index(
        api: web::Data<Self>,
        req: HttpRequest,
        query: web::Query<IndexQuery>,
    ) -> Result<HttpResponse, ProvisioningError> {
        debug!("index() called");

        let view = api.state.run(|service, now| service.view(now)).await?;

        if view.status.mode.is_provisioning_open() && !api.addressed_to_portal(&req) {
            return Ok(api.portal_redirect());
        }

        Ok(html(pages::index(&view, query.ssid.as_deref())))
    }

    pub async fn connect(
        api: web::Data<Self>,
        form: web::Form<ConnectForm>,
    ) -> Result<HttpResponse, ProvisioningError> {
        debug!("connect() called");

        let ConnectForm {
            token,
            ssid,
            password,
        } = form.into_inner();
        let credentials = Credentials { ssid, password };

        let ticket = api
            .state
            .run(move |service, now| service.submit_credentials(&token, credentials, now))
            .await?;

        let page = pages::connecting(&ticket.credentials.ssid);
        api.state.dispatch_join(ticket);

        Ok(html(page))
    }

    /// Token may come from the query string or a form body.
    pub async fn stepper(
        api: web::Data<Self>,
        query: web::Query<TokenInput>,
        form: Option<web::Form<TokenInput>>,
    ) -> Result<HttpResponse, ProvisioningError> {
        debug!("stepper() called");

        let token = presented_token(query, form);
        let mode = api
            .state
            .run(move |service, now| {
                service.trigger_privileged_action(&token, now)?;
                Ok(service.mode())
            })
            .await?;

        Ok(html(pages::actuator_done(mode)))
    }

    pub async fn reset(
        api: web::Data<Self>,
        query: web::Query<TokenInput>,
        form: Option<web::Form<TokenInput>>,
    ) -> Result<HttpResponse, ProvisioningError> {
        debug!("reset() called");

        let token = presented_token(query, form);
        api.state
            .run(move |service, now| service.request_reset(&token, now))
            .await?;

        Ok(html(pages::reset()))
    }

    pub async fn scan(api: web::Data<Self>) -> Result<HttpResponse, ProvisioningError> {
        debug!("scan() called");

        match api.state.run(|service, now| service.scan_networks(now)).await {
            Ok(networks) => Ok(html(pages::scan(&networks))),
            Err(ProvisioningError::InvalidState(mode)) => {
                debug!("scan not available while {mode}");
                Ok(found("/"))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(api: web::Data<Self>) -> Result<HttpResponse, ProvisioningError> {
        let status = api
            .state
            .run(|service, now| Ok(service.status(now)))
            .await?;

        Ok(HttpResponse::Ok().json(status))
    }

    /// Catch-all for captive portal detection requests.
    pub async fn redirect_to_portal(api: web::Data<Self>, req: HttpRequest) -> HttpResponse {
        debug!("redirecting {} {} to portal", req.method(), req.path());
        api.portal_redirect()
    }

    fn addressed_to_portal(&self, req: &HttpRequest) -> bool {
        let Some(host) = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
        else {
            return true;
        };

        let host = host.rsplit_once(':').map_or(host, |(name, _port)| name);
        host.eq_ignore_ascii_case(self.state.portal_host())
    }

    fn portal_redirect(&self) -> HttpResponse {
        found(&format!("http://{}/", self.state.portal_host()))
    }
}

fn presented_token(query: web::Query<TokenInput>, form: Option<web::Form<TokenInput>>) -> String {
    match form {
        Some(form) if !form.token.is_empty() => form.into_inner().token,
        _ => query.into_inner().token,
    }
}

fn html(body: String) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(body)
}

fn found(location: &str) -> HttpResponse {
    HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .finish()
}

impl ResponseError for ProvisioningError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProvisioningError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProvisioningError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProvisioningError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ProvisioningError::InvalidState(_) | ProvisioningError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ProvisioningError::WindowExpired | ProvisioningError::Restarting => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProvisioningError::JoinFailed { .. } | ProvisioningError::Device(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        let (title, message) = match self {
            ProvisioningError::Unauthorized => ("Unauthorized", "Invalid or missing token".to_string()),
            ProvisioningError::RateLimited { .. } => ("Too Many Attempts", self.to_string()),
            ProvisioningError::InvalidInput(reason) => ("Error", reason.clone()),
            ProvisioningError::WindowExpired => ("Setup Timeout", self.to_string()),
            ProvisioningError::Restarting => ("Restarting", self.to_string()),
            ProvisioningError::InvalidState(_) | ProvisioningError::InvalidTransition { .. } => {
                ("Not Available", self.to_string())
            }
            ProvisioningError::JoinFailed { .. } | ProvisioningError::Device(_) => {
                error!("request failed: {self}");
                ("Device Error", "The device could not complete the request".to_string())
            }
        };

        if status.is_client_error() {
            warn!("request rejected ({status}): {self}");
        }

        let mut response = HttpResponse::build(status);
        if let ProvisioningError::RateLimited { retry_after_secs } = self {
            response.insert_header((header::RETRY_AFTER, retry_after_secs.to_string()));
        }

        response
            .content_type(ContentType::html())
            .body(pages::error(title, &message))
    }
}
