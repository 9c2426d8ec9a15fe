#![warn(clippy::dbg_macro)]

use clap::Parser;
use error::{IoErrorContext, Result, ServiceError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::{fmt::Display, time::Duration};
use url::Url;

use actix_web::{App, HttpResponse, HttpServer, http, web};

mod archive;
mod cli;
mod config;
mod error;
mod process;
mod prometheus;
mod relay;
mod resolver;
mod root;

fn cache_control_no_store() -> http::header::CacheControl {
    http::header::CacheControl(vec![http::header::CacheDirective::NoStore])
}

#[derive(Debug)]
struct ServerError {
    err: ServiceError,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl actix_web::error::ResponseError for ServerError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match &self.err {
            ServiceError::Resolve(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match &self.err {
            ServiceError::Resolve(e) => {
                log::debug!("{e}");
                HttpResponse::NotFound()
                    .insert_header(cache_control_no_store())
                    .content_type(mime::TEXT_PLAIN_UTF_8)
                    .body(archive::NOT_FOUND_MESSAGE)
            }
            err => {
                log::error!("{err}");
                HttpResponse::build(self.status_code())
                    .insert_header(cache_control_no_store())
                    .body(err.to_string())
            }
        }
    }
}

impl From<ServiceError> for ServerError {
    fn from(err: ServiceError) -> ServerError {
        ServerError { err }
    }
}

type ServerResult = std::result::Result<HttpResponse, ServerError>;

async fn inner_main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::load(&cli)?;

    let default_filter = if config.enable_logging {
        "info,zipstream_server=debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if !config.archive_root.is_dir() {
        log::warn!(
            "archive root {} is not a directory, every archive request will fail",
            config.archive_root.display()
        );
    }

    let metrics = prometheus::initialize_metrics()?;

    let c = web::Data::new(config);
    let config_data = c.clone();
    let metrics_data = web::Data::new(metrics.clone());

    log::info!(
        "listening on {}, serving archives from {}",
        c.bind,
        c.archive_root.display()
    );
    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(prometheus::PrometheusMiddleware::new(metrics.clone()))
            .app_data(config_data.clone())
            .app_data(metrics_data.clone())
            .route("/", web::get().to(root::get))
            .route("/archive/{identifier}/", web::get().to(archive::get))
            .route("/metrics", web::get().to(prometheus::metrics_handler))
    })
    // default is 5 seconds, which is too small when doing mass requests on slow machines
    .client_request_timeout(Duration::from_secs(30))
    .workers(c.workers);

    let try_url = Url::parse(&c.bind);
    let (bind, uds) = if let Ok(url) = try_url.as_ref() {
        if url.scheme() != "unix" {
            (c.bind.as_str(), false)
        } else if url.host().is_none() {
            (url.path(), true)
        } else {
            return Err(error::ServerError::Startup {
                reason: "Can only bind to file URLs without host portion.".to_string(),
            }
            .into());
        }
    } else {
        (c.bind.as_str(), false)
    };

    if uds {
        let socket_path = Path::new(bind);
        server = server
            .bind_uds(socket_path)
            .io_context("Failed to bind to Unix domain socket")?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o777))
            .io_context("Failed to set socket permissions")?;
    } else {
        server = server
            .bind(c.bind.clone())
            .io_context("Failed to bind server")?;
    }

    server.run().await.io_context("Failed to start server")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    inner_main().await.map_err(std::io::Error::other)
}
