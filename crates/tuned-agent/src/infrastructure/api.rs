use core::error::Error;

use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::tuned_status::ProfileStatus;
use super::tuned_status::TunedStatus;

#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// Read-only HTTP endpoint exposing the profile the daemon currently applies.
pub struct ApiServer {
    status: TunedStatus,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(status: TunedStatus, listen_addr: String) -> Self {
        Self {
            status,
            listen_addr,
        }
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(routes(self.status)) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

fn routes(status: TunedStatus) -> impl Endpoint {
    Route::new()
        .at("/active_profile", get(active_profile))
        .data(status)
        .with(Tracing)
}

#[handler]
async fn active_profile(status: Data<&TunedStatus>) -> poem::Result<Response> {
    let profile = status.active_profile().await.map_err(|report| {
        error!("Cannot read the active profile: {report:?}");
        poem::Error::from_string(report.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    })?;

    Ok(Response::builder()
        .content_type("text/plain; charset=utf-8")
        .body(profile))
}

#[cfg(test)]
mod tests {
    use poem::test::TestClient;

    use super::*;

    #[tokio::test]
    async fn serves_the_active_profile_as_text() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let file = dir.path().join("active_profile");
        std::fs::write(&file, "openshift-node\n").expect("should write");
        let client = TestClient::new(routes(TunedStatus::new(file, "/bin/true")));

        let response = client.get("/active_profile").send().await;

        response.assert_status_is_ok();
        response.assert_content_type("text/plain; charset=utf-8");
        response.assert_text("openshift-node").await;
    }

    #[tokio::test]
    async fn no_active_profile_is_an_empty_body() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let client = TestClient::new(routes(TunedStatus::new(
            dir.path().join("active_profile"),
            "/bin/true",
        )));

        let response = client.get("/active_profile").send().await;

        response.assert_status_is_ok();
        response.assert_text("").await;
    }

    #[tokio::test]
    async fn unreadable_profile_is_a_server_error() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        // a directory cannot be read as a file
        let client = TestClient::new(routes(TunedStatus::new(dir.path(), "/bin/true")));

        let response = client.get("/active_profile").send().await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn server_stops_on_cancellation() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let server = ApiServer::new(
            TunedStatus::new(dir.path().join("active_profile"), "/bin/true"),
            "127.0.0.1:0".to_string(),
        );
        let token = CancellationToken::new();
        token.cancel();

        server.run(token).await.expect("should stop cleanly");
    }
}
