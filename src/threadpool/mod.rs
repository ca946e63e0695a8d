//! Thread Pool Module
//!
//! Process-wide executor, scheduler and deadlock monitor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 ThreadPoolManager                        │
//! │                                                          │
//! │   execute()  schedule()  schedule_at_fixed_rate()        │
//! │        │          │              │                       │
//! │        ▼          ▼              ▼                       │
//! │   ┌──────────────────────────────────────────────┐       │
//! │   │          Tokio runtime (blocking pool)       │       │
//! │   └──────────────────────────────────────────────┘       │
//! │                        ▲                                 │
//! │                        │ background task                 │
//! │              ┌─────────┴─────────┐                       │
//! │              │ DeadLockDetector  │                       │
//! │              └───────────────────┘                       │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod deadlock;
pub mod manager;

// Re-export commonly used types
pub use deadlock::{DeadLockDetector, RESTART_EXIT_CODE};
pub use manager::{delay_from_millis, ScheduledTask, ThreadPoolError, ThreadPoolManager};

use std::any::Any;

/// Extracts the message of a caught panic payload.
pub(crate) fn describe_panic(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_panic_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(describe_panic(caught.as_ref()), "static message");

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(describe_panic(caught.as_ref()), "formatted 7");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(describe_panic(caught.as_ref()), "unknown panic payload");
    }
}
