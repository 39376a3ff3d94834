//! Domain error taxonomy for the connector core.
//!
//! Every public operation fails with one of these small `thiserror` enums
//! instead of the catch-all [`anyhow::Error`] used internally for plumbing.
//! This mirrors how `spotflow::cloud::dps`/`drs` expose `InitProvisioningError`,
//! `CompletionError` and `RegistrationError` at their own boundary while using
//! `anyhow` underneath.

use thiserror::Error;

/// Errors that can occur while establishing or maintaining the MQTT session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("connecting to the broker failed: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Raised whenever an operation requires an active session but none exists.
#[derive(Debug, Error)]
#[error("not connected")]
pub struct NotConnectedError;

/// Errors surfaced by [`crate::cloud::hub::HubController`].
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub initialization failed")]
    Initialization(#[source] Option<anyhow::Error>),
    #[error("hub is not initialized")]
    NotInitialized,
    #[error("hub not found on platform")]
    NotFound,
    #[error("hub synchronization failed")]
    Sync(#[source] Option<anyhow::Error>),
    #[error("hub synchronization failed - could not update devices")]
    SyncDevice,
}

/// Errors raised while registering, updating or removing a device on the platform.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("adding device '{0}' to platform failed")]
    Add(String, #[source] Option<anyhow::Error>),
    #[error("updating device '{0}' on platform failed")]
    Update(String, #[source] Option<anyhow::Error>),
    #[error("deleting device '{0}' from platform failed")]
    Delete(String, #[source] Option<anyhow::Error>),
    #[error("device '{0}' not found on platform")]
    NotFound(String),
    #[error("generating device ID prefix failed")]
    IdPrefix,
}

/// Errors raised while subscribing or unsubscribing a device's command topic.
#[derive(Debug, Error)]
pub enum DeviceSessionError {
    #[error("connecting device '{0}' to platform failed")]
    Connect(String, #[source] Option<anyhow::Error>),
    #[error("connecting device '{0}' to platform failed - not allowed")]
    ConnectNotAllowed(String),
    #[error("disconnecting device '{0}' from platform failed")]
    Disconnect(String, #[source] Option<anyhow::Error>),
    #[error(transparent)]
    NotConnected(#[from] NotConnectedError),
}

/// Errors raised while sending a response or an event to the platform.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error(transparent)]
    NotConnected(#[from] NotConnectedError),
    #[error("sending event '{0}' to platform failed")]
    SendEvent(String, #[source] Option<anyhow::Error>),
    #[error("sending response '{0}' to platform failed")]
    SendResponse(String, #[source] Option<anyhow::Error>),
    #[error("sending message to platform failed")]
    SendError(#[source] Option<anyhow::Error>),
}

/// Raised by [`crate::worker::Future::result`] when the future has not completed yet.
#[derive(Debug, Error)]
#[error("future is not done")]
pub struct FutureNotDoneError;

/// Raised by `receive_command` when no command is currently queued.
#[derive(Debug, Error)]
#[error("command queue is empty")]
pub struct CommandQueueEmptyError;

/// Raised by the [`crate::auth::AuthProvider`] contract when no token could be obtained.
#[derive(Debug, Error)]
#[error("could not retrieve access token")]
pub struct NoTokenError;
