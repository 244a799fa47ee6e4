//! Telephony endpoints: outbound call creation, call markup and stream
//! status callbacks.

use crate::services::twilio::render_twiml;
use crate::{error::AppError, state::AppState};

use actix_web::{web, Either, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub to: Option<String>,
}

/// `POST /call`: dial `to` (JSON or form body) and return the call SID.
pub async fn start_call(
    state: web::Data<AppState>,
    body: Either<web::Json<CallRequest>, web::Form<CallRequest>>,
) -> Result<HttpResponse, AppError> {
    let request = match body {
        Either::Left(json) => json.into_inner(),
        Either::Right(form) => form.into_inner(),
    };

    let to = request
        .to
        .map(|to| to.trim().to_string())
        .filter(|to| !to.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing 'to'".to_string()))?;

    let call_sid = state.launcher.create_call(&to).await.map_err(|err| {
        warn!(to = %to, error = %err, "Outbound call failed");
        AppError::from(err)
    })?;

    Ok(HttpResponse::Ok().json(json!({ "ok": true, "callSid": call_sid })))
}

/// `POST /twiml`: markup that greets the callee, then connects the media
/// stream back to this server.
pub async fn twiml(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    HttpResponse::Ok()
        .content_type("text/xml")
        .body(render_twiml(&config.telephony))
}

/// `POST /stream/status`: stream lifecycle callbacks, logged only.
pub async fn stream_status(form: web::Form<HashMap<String, String>>) -> HttpResponse {
    let params = form.into_inner();
    let field = |name: &str| params.get(name).map(String::as_str).unwrap_or("-");

    info!(
        stream_sid = field("StreamSid"),
        call_sid = field("CallSid"),
        event = field("StreamEvent"),
        error = field("StreamError"),
        "Stream status callback"
    );
    HttpResponse::Ok().finish()
}
