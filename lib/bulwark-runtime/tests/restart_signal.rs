//! Tests that `SIGUSR2` requests a graceful restart.
//!
//! The signal is delivered to the whole process, so this lives in its own test binary where no other restart
//! coordinator can observe it.

#![cfg(unix)]

use std::time::Duration;

use bulwark_runtime::{
    config::{GracefulRestartConfiguration, RequestConfiguration},
    reclaim::MemoryReclaim,
    registry::RequestRegistry,
    restart::{RestartCoordinator, RestartTrigger},
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn operator_signal_requests_restart() {
    let trigger = RestartTrigger::new();
    let (registry, _) = RequestRegistry::spawn(RequestConfiguration::default(), MemoryReclaim::default(), trigger.clone());
    let _coordinator = RestartCoordinator::new(
        GracefulRestartConfiguration::default(),
        registry,
        trigger.clone(),
        CancellationToken::new(),
    )
    .unwrap();

    kill(Pid::this(), Signal::SIGUSR2).unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), trigger.wait()).await.unwrap();
    assert_eq!(state.reason, "Received SIGUSR2.");

    // Further signals are absorbed by the trigger.
    kill(Pid::this(), Signal::SIGUSR2).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(trigger.current().unwrap(), state);
}
