use actix_web::{HttpResponse, http, web};

use crate::ServerResult;
use crate::config::Config;
use crate::error::IoErrorContext;

/// Serves the landing page straight from disk so it can be edited without a
/// restart.
pub(crate) async fn get(config: web::Data<Config>) -> ServerResult {
    let html = tokio::fs::read_to_string(&config.index_path)
        .await
        .io_context(format!(
            "cannot read index page {}",
            config.index_path.display()
        ))?;

    Ok(HttpResponse::Ok()
        .insert_header(http::header::ContentType(mime::TEXT_HTML_UTF_8))
        .body(html))
}
