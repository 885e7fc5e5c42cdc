use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{config, handler, switcher::SwitcherHandle};

pub(crate) fn start_api_server(handle: SwitcherHandle, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = handler::switcher::switcher_router(handle);

        let addr = config::config().listen_addr().to_string();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("API server bind on {} failed: {}", addr, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on {}", addr);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API server error: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
