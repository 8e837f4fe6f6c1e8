// SPDX-License-Identifier: Apache-2.0

//! Plugin transport: the unix-socket HTTP server the docker daemon talks to.
//! Thin request/response plumbing; all behavior lives in [`LogDriver`].

pub mod api;

use crate::driver::LogDriver;
use crate::plugin::api::*;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use futures_util::TryStreamExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::UnixListener;
use tokio::select;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service};
use tracing::{debug, error, info, warn};

const ACTIVATE_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";
const LOGGING_DRIVER_CAPABILITY: &str = "LoggingDriver";

type ResponseBody = BoxBody<Bytes, BoxError>;

pub struct PluginServer {
    socket_path: PathBuf,
    driver: Arc<LogDriver>,
}

impl PluginServer {
    pub fn new(socket_path: impl Into<PathBuf>, driver: Arc<LogDriver>) -> Self {
        Self {
            socket_path: socket_path.into(),
            driver,
        }
    }

    /// Binds the unix socket (replacing a stale socket file if present) and
    /// serves plugin requests until cancelled.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), BoxError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| format!("failed to remove existing socket file: {}", e))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("failed to create socket directory: {}", e))?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            format!(
                "failed to bind to unix socket {}: {}",
                self.socket_path.display(),
                e
            )
        })?;

        info!(
            socket_path = %self.socket_path.display(),
            "plugin server listening"
        );

        let svc = TowerToHyperService::new(PluginService {
            driver: self.driver.clone(),
        });

        let timer = TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();
        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);

        loop {
            let stream = select! {
                result = listener.accept() => match result {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "error accepting plugin connection");
                        continue;
                    }
                },
                _ = cancel.cancelled() => {
                    info!("plugin server shutting down");
                    break;
                }
            };

            let io = TokioIo::new(stream);
            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    debug!(error = %e, "error serving plugin connection");
                }
            });
        }

        // Let in-flight requests finish, then clean up the socket file.
        graceful.shutdown().await;
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove socket file");
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
struct PluginService {
    driver: Arc<LogDriver>,
}

impl<H> Service<Request<H>> for PluginService
where
    H: Body + Send + 'static,
    <H as Body>::Data: Send,
    <H as Body>::Error: Display,
{
    type Response = Response<ResponseBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        let driver = self.driver.clone();
        Box::pin(async move { Ok(handle(driver, req).await) })
    }
}

async fn handle<H>(driver: Arc<LogDriver>, req: Request<H>) -> Response<ResponseBody>
where
    H: Body,
    <H as Body>::Error: Display,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/Plugin.Activate") => json_response(
            StatusCode::OK,
            ACTIVATE_CONTENT_TYPE,
            &ActivateResponse {
                implements: vec![LOGGING_DRIVER_CAPABILITY.to_string()],
            },
        ),

        (&Method::POST, "/LogDriver.StartLogging") => {
            let request: StartLoggingRequest = match parse_body(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            debug!(file = %request.file, container_id = %request.info.container_id, "start logging request");
            driver_response(driver.start_logging(&request.file, request.info).await)
        }

        (&Method::POST, "/LogDriver.StopLogging") => {
            let request: StopLoggingRequest = match parse_body(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            debug!(file = %request.file, "stop logging request");
            driver_response(driver.stop_logging(&request.file).await)
        }

        (&Method::POST, "/LogDriver.Capabilities") => json_response(
            StatusCode::OK,
            "application/json",
            &CapabilitiesResponse {
                cap: Capability { read_logs: true },
            },
        ),

        (&Method::POST, "/LogDriver.ReadLogs") => {
            let request: ReadLogsRequest = match parse_body(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            match driver
                .read_logs(&request.info.container_id, request.config)
                .await
            {
                Ok(stream) => {
                    let body = StreamBody::new(
                        ReaderStream::new(stream)
                            .map_ok(Frame::data)
                            .map_err(BoxError::from),
                    );
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(http::header::CONTENT_TYPE, "application/x-raw-stream")
                        .body(body.boxed())
                        .unwrap()
                }
                Err(e) => json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "application/json",
                    &PluginResponse::error(e),
                ),
            }
        }

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(Bytes::from_static(b"Not Found")))
            .unwrap(),
    }
}

async fn parse_body<H, T>(req: Request<H>) -> Result<T, Response<ResponseBody>>
where
    H: Body,
    <H as Body>::Error: Display,
    T: serde::de::DeserializeOwned,
{
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(json_response(
                StatusCode::BAD_REQUEST,
                "application/json",
                &PluginResponse::error(format!("failed to read request body: {}", e)),
            ))
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| {
        json_response(
            StatusCode::BAD_REQUEST,
            "application/json",
            &PluginResponse::error(format!("failed to decode request body: {}", e)),
        )
    })
}

fn driver_response<E: Display>(result: Result<(), E>) -> Response<ResponseBody> {
    match result {
        Ok(()) => json_response(StatusCode::OK, "application/json", &PluginResponse::ok()),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "application/json",
            &PluginResponse::error(e),
        ),
    }
}

fn json_response<T: Serialize>(
    status: StatusCode,
    content_type: &str,
    value: &T,
) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, content_type)
            .body(full_body(Bytes::from(body)))
            .unwrap(),
        Err(e) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(full_body(Bytes::from(format!(
                "failed to encode response: {}",
                e
            ))))
            .unwrap(),
    }
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
