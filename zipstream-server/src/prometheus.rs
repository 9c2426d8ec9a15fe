use crate::error::{self, ServiceError};
use actix_web::{
    Error, HttpResponse,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    web,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::{
    future::{Future, Ready, ready},
    pin::Pin,
    sync::Arc,
    time::Instant,
};

type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

/// Final state of an archive response, used as the `outcome` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveOutcome {
    Completed,
    Interrupted,
    Failed,
}

impl ArchiveOutcome {
    fn as_label(self) -> &'static str {
        match self {
            ArchiveOutcome::Completed => "completed",
            ArchiveOutcome::Interrupted => "interrupted",
            ArchiveOutcome::Failed => "failed",
        }
    }
}

pub struct PrometheusMetrics {
    pub registry: Registry,
    http_requests_total: IntCounterVec,
    http_requests_duration: HistogramVec,
    archives_total: IntCounterVec,
    archive_bytes_sent: IntCounter,
    archive_processes_running: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "zipstream_http_requests_total",
                "Total number of HTTP requests",
            ),
            &["method", "path", "status"],
        )?;

        let http_requests_duration = HistogramVec::new(
            HistogramOpts::new(
                "zipstream_http_request_duration_seconds",
                "Time until response headers were produced, in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
            &["method", "path", "status"],
        )?;

        let archives_total = IntCounterVec::new(
            Opts::new(
                "zipstream_archives_total",
                "Archive responses by final outcome",
            ),
            &["outcome"],
        )?;

        let archive_bytes_sent = IntCounter::new(
            "zipstream_archive_bytes_sent_total",
            "Archive bytes handed to HTTP responses",
        )?;

        let archive_processes_running = IntGauge::new(
            "zipstream_archive_processes_running",
            "Compression processes currently alive",
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_requests_duration.clone()))?;
        registry.register(Box::new(archives_total.clone()))?;
        registry.register(Box::new(archive_bytes_sent.clone()))?;
        registry.register(Box::new(archive_processes_running.clone()))?;

        Ok(PrometheusMetrics {
            registry,
            http_requests_total,
            http_requests_duration,
            archives_total,
            archive_bytes_sent,
            archive_processes_running,
        })
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub(crate) fn record_archive(&self, outcome: ArchiveOutcome, bytes: u64) {
        self.archives_total
            .with_label_values(&[outcome.as_label()])
            .inc();
        self.archive_bytes_sent.inc_by(bytes);
    }

    /// Counts a compression process as alive until the guard is dropped.
    pub(crate) fn running_process(&self) -> RunningProcess {
        self.archive_processes_running.inc();
        RunningProcess {
            gauge: self.archive_processes_running.clone(),
        }
    }
}

pub(crate) struct RunningProcess {
    gauge: IntGauge,
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

pub struct PrometheusMiddleware {
    metrics: Arc<PrometheusMetrics>,
}

impl PrometheusMiddleware {
    pub fn new(metrics: Arc<PrometheusMetrics>) -> Self {
        PrometheusMiddleware { metrics }
    }
}

impl<S, B> Transform<S, ServiceRequest> for PrometheusMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = PrometheusMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(PrometheusMiddlewareService {
            service,
            metrics: self.metrics.clone(),
        }))
    }
}

pub struct PrometheusMiddlewareService<S> {
    service: S,
    metrics: Arc<PrometheusMetrics>,
}

impl<S, B> Service<ServiceRequest> for PrometheusMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start = Instant::now();
        let method = req.method().to_string();
        // Only track metrics for paths with a match pattern
        let path = req.match_pattern();
        let metrics = self.metrics.clone();

        let fut = self.service.call(req);

        Box::pin(async move {
            let res = fut.await?;

            if let Some(path) = path {
                let duration = start.elapsed().as_secs_f64();
                let status = res.status().as_str().to_owned();

                metrics
                    .http_requests_total
                    .with_label_values(&[&method, &path, &status])
                    .inc();

                metrics
                    .http_requests_duration
                    .with_label_values(&[&method, &path, &status])
                    .observe(duration);
            }

            Ok(res)
        })
    }
}

pub async fn metrics_handler(
    metrics: web::Data<Arc<PrometheusMetrics>>,
) -> actix_web::Result<HttpResponse> {
    let body = metrics
        .render()
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

pub fn initialize_metrics() -> Result<Arc<PrometheusMetrics>, ServiceError> {
    let metrics = PrometheusMetrics::new().map_err(|e| error::ServerError::Startup {
        reason: format!("Failed to create prometheus metrics: {e}"),
    })?;
    Ok(Arc::new(metrics))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_archive_metrics_are_rendered() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_archive(ArchiveOutcome::Completed, 8);
        metrics.record_archive(ArchiveOutcome::Interrupted, 102_400);

        let text = metrics.render().unwrap();
        assert!(text.contains("zipstream_archives_total{outcome=\"completed\"} 1"));
        assert!(text.contains("zipstream_archives_total{outcome=\"interrupted\"} 1"));
        assert!(text.contains("zipstream_archive_bytes_sent_total 102408"));
    }

    #[test]
    fn test_running_process_guard() {
        let metrics = PrometheusMetrics::new().unwrap();
        {
            let _first = metrics.running_process();
            let _second = metrics.running_process();
            assert_eq!(metrics.archive_processes_running.get(), 2);
        }
        assert_eq!(metrics.archive_processes_running.get(), 0);
    }
}
