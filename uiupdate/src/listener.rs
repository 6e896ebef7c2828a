//! HTTP listener acquisition
//!
//! A service manager doing socket activation passes the listening socket as
//! file descriptor 3 and announces it through `LISTEN_PID` and `LISTEN_FDS`.
//! Without such a socket the configured address is bound.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use tokio::net::TcpListener;
use tracing::info;
use uiupdate_core::{UiUpdateError, UiUpdateResult};

const LISTEN_FDS_START: RawFd = 3;

/// Number of sockets handed to this process, per the socket activation variables
pub fn activation_fds(listen_pid: Option<&str>, listen_fds: Option<&str>, pid: u32) -> usize {
    let for_us = listen_pid
        .and_then(|value| value.trim().parse::<u32>().ok())
        .map(|listen_pid| listen_pid == pid)
        .unwrap_or(false);
    if !for_us {
        return 0;
    }
    listen_fds
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Adopt an inherited socket or bind `address`
pub async fn acquire(address: SocketAddr) -> UiUpdateResult<TcpListener> {
    let fds = activation_fds(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    );
    if fds > 0 {
        // SAFETY: the service manager passed fd 3 to this process as an open listening socket
        // and nothing else in the process owns it.
        let listener = unsafe { std::net::TcpListener::from_raw_fd(LISTEN_FDS_START) };
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        info!(address = ?listener.local_addr().ok(), "using socket from service manager");
        return Ok(listener);
    }

    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| UiUpdateError::ConfigurationError {
            component: "http".to_string(),
            message: format!("failed to bind to {}: {}", address, e),
        })?;
    info!(address = %address, "listening");
    Ok(listener)
}
