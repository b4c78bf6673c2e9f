use std::net::SocketAddr;

use crate::config::ApiConfig;
use crate::download::DownloaderHandle;

mod handlers;
mod router;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BindHost(std::net::AddrParseError),
    Bind(std::io::Error),
    Serve(std::io::Error),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BindHost(source) => write!(f, "invalid API bind host: {source}"),
            Self::Bind(source) => write!(f, "failed to bind API listener: {source}"),
            Self::Serve(source) => write!(f, "API server failed: {source}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindHost(source) => Some(source),
            Self::Bind(source) => Some(source),
            Self::Serve(source) => Some(source),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub(crate) folder_id: String,
    pub(crate) download_handle: DownloaderHandle,
}

pub async fn serve(
    cfg: &ApiConfig,
    folder_id: String,
    download_handle: DownloaderHandle,
) -> ApiResult<()> {
    let bind_ip: std::net::IpAddr = cfg.host.parse().map_err(ApiError::BindHost)?;
    let addr = SocketAddr::new(bind_ip, cfg.port);

    let state = ApiState {
        folder_id,
        download_handle,
    };
    let app = router::build_app(state);

    tracing::info!(addr = %addr, "api server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ApiError::Bind)?;
    axum::serve(listener, app).await.map_err(ApiError::Serve)?;
    Ok(())
}
