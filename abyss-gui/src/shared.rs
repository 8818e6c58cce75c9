//! Shared types crossing the UI / worker-thread boundary.
//!
//! The command and result protocol itself lives in
//! `abyss_spectro_core::acquisition` (`Command`, `EngineEvent`) since it is
//! owned by the engine, not the UI; this module only adds the aliases the
//! screen and app code need plus the transient banner state the UI renders.

use abyss_spectro_core::acquisition::{Command, EngineEvent};
use abyss_spectro_core::SaveRequest;
use crossbeam_channel::{Receiver, Sender};

pub type CommandSender = Sender<Command>;
pub type ResultReceiver = Receiver<EngineEvent>;
pub type SaveSender = Sender<SaveRequest>;

/// A transient, user-dismissable status line shown above the live view
/// (device-unhealthy sentinels, save-queue timeouts).
#[derive(Debug, Clone)]
pub struct StatusBanner {
    pub message: String,
    pub is_error: bool,
}

impl StatusBanner {
    pub fn info(message: impl Into<String>) -> Self {
        Self { message: message.into(), is_error: false }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { message: message.into(), is_error: true }
    }
}
