//! TCP listeners for the data-plane socket.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::token::TokenManager;
use crate::zfs::CommandRunner;

/// Accept loop for the token-gated socket. Each connection is served on
/// its own task; a bad handshake only drops that connection.
pub async fn run_token_gated(
    listener: TcpListener,
    tokens: TokenManager,
    runner: Arc<dyn CommandRunner>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Token-gated data socket listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let tokens = tokens.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            if let Err(e) = super::serve_token_gated(stream, &tokens, runner).await {
                error!(peer = %peer, error = %e, "Token-gated connection failed");
            }
        });
    }
}

/// Accept loop for the direct (trusted host-to-host) socket.
pub async fn run_direct(listener: TcpListener, runner: Arc<dyn CommandRunner>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Direct data socket listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let runner = runner.clone();
        tokio::spawn(async move {
            if let Err(e) = super::serve_direct(stream, runner).await {
                error!(peer = %peer, error = %e, "Direct connection failed");
            }
        });
    }
}
