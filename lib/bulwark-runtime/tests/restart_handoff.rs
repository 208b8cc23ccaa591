//! Tests that the outgoing process waits for its replacement to take over the listener before draining.
//!
//! The replacement announces itself with `SIGUSR1`, which is delivered to the whole process, so this lives in its own
//! test binary.

#![cfg(unix)]

use std::time::Duration;

use bulwark_runtime::{
    config::{GracefulRestartConfiguration, RequestConfiguration},
    reclaim::MemoryReclaim,
    registry::{AdmissionRequest, RequestOutcome, RequestRegistry},
    restart::{handoff::ReplacementCommand, DrainOutcome, RestartCoordinator, RestartPhase, RestartTrigger},
};
use http::{HeaderMap, Method, Version};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn drains_after_replacement_takes_over() {
    let trigger = RestartTrigger::new();
    let (registry, _) = RequestRegistry::spawn(RequestConfiguration::default(), MemoryReclaim::default(), trigger.clone());
    let handle = registry
        .admit(AdmissionRequest {
            method: Method::GET,
            uri: "/long-poll".parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            peer_addr: None,
        })
        .await
        .unwrap();

    let config = GracefulRestartConfiguration {
        graceful_poll_msecs: 10,
        graceful_wait_secs: 30,
    };
    let shutdown = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coordinator = RestartCoordinator::new(config, registry.clone(), trigger.clone(), shutdown.clone())
        .unwrap()
        .with_handoff_command(&listener, ReplacementCommand::new("/bin/true", Vec::<String>::new()))
        .unwrap();

    let mut phases = coordinator.subscribe();
    let started = Instant::now();
    let run = tokio::spawn(coordinator.run());
    trigger.request("operator");

    // Only reached once the replacement was spawned.
    timeout(Duration::from_secs(5), phases.wait_for(|phase| *phase == RestartPhase::Handoff))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*phases.borrow(), RestartPhase::Handoff);
    assert!(!shutdown.is_cancelled());

    kill(Pid::this(), Signal::SIGUSR1).unwrap();
    timeout(Duration::from_secs(5), phases.wait_for(|phase| *phase == RestartPhase::Draining))
        .await
        .unwrap()
        .unwrap();
    assert!(shutdown.is_cancelled());

    registry.retire(&handle, RequestOutcome::default());
    let outcome = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);
    assert_eq!(*phases.borrow(), RestartPhase::Terminal(DrainOutcome::Drained));

    // The handoff signal ended the wait, not the wait limit.
    assert!(started.elapsed() < Duration::from_secs(30));
}
