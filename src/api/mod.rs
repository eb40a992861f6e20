//! HTTP JSON surface for administration and statistics.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::policy::AdminService;
use crate::recorder::Recorder;
use crate::relay::BackfillController;
use crate::stats::Stats;

pub use routes::relay_routes;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
    pub backfill: Arc<BackfillController>,
    pub stats: Arc<Stats>,
    pub recorder: Arc<Recorder>,
}

/// Bind `addr` and serve the API in the background. Returns the bound
/// address, which differs from `addr` when port 0 was requested.
pub async fn spawn_api_server(
    addr: SocketAddr,
    state: AppState,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = relay_routes(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server stopped");
        }
    });
    info!(addr = %local, "API server started");
    Ok((local, handle))
}
