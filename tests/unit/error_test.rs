//! Tests for error types

use bacnet_iocore::core::{IoError, IocbState, SchedulerError};

#[test]
fn test_not_current_iocb_error() {
    let err = IoError::NotCurrentIocb(12);
    assert_eq!(format!("{}", err), "iocb 12 is not the current iocb");
}

#[test]
fn test_missing_destination_error() {
    let err = IoError::MissingDestination(3);
    assert_eq!(format!("{}", err), "iocb 3 has no destination");
}

#[test]
fn test_timeout_error() {
    assert_eq!(format!("{}", IoError::Timeout), "timeout");
    assert!(IoError::Timeout.is_timeout());
}

#[test]
fn test_aborted_error() {
    let err = IoError::Aborted("link down".to_string());
    assert_eq!(format!("{}", err), "aborted: link down");
}

#[test]
fn test_processing_error_from_anyhow() {
    let err: IoError = anyhow::anyhow!("encode failed").into();
    assert_eq!(format!("{}", err), "processing error: encode failed");
    // clones share the same underlying failure
    let copy = err.clone();
    assert_eq!(copy.to_string(), err.to_string());
}

#[test]
fn test_invalid_transition_error() {
    let err = IoError::InvalidStateTransition {
        id: 4,
        from: IocbState::Aborted,
        to: IocbState::Pending,
    };
    assert_eq!(
        format!("{}", err),
        "invalid state transition for iocb 4: Aborted -> Pending"
    );
}

#[test]
fn test_scheduler_errors() {
    assert_eq!(
        format!("{}", SchedulerError::MissingSchedule(9)),
        "missing schedule for task 9"
    );
    assert_eq!(
        format!("{}", SchedulerError::AlreadyRunning),
        "scheduler already running"
    );
    assert_eq!(
        format!("{}", SchedulerError::DeadlineOverflow(4)),
        "due time for task 4 is out of range"
    );
    assert_eq!(
        format!("{}", SchedulerError::InvalidConfig("bad".into())),
        "invalid configuration: bad"
    );
    let io = std::io::Error::other("no threads");
    assert_eq!(
        format!("{}", SchedulerError::from(io)),
        "failed to spawn dispatch thread: no threads"
    );
}
