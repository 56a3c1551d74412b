//! 分层事件日志（`tiered::events` 目标）

use std::fmt;

use crate::config::TieredConfig;
use crate::level::{CompLevel, INVOCATION_ENTRY_BCI};
use crate::method::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieredEvent {
    Call,
    Loop,
    Compile,
    RemoveFromQueue,
    UpdateInQueue,
    Reprofile,
    MakeNotEntrant,
}

impl fmt::Display for TieredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TieredEvent::Call => "CALL",
            TieredEvent::Loop => "LOOP",
            TieredEvent::Compile => "COMPILE",
            TieredEvent::RemoveFromQueue => "REMOVE_FROM_QUEUE",
            TieredEvent::UpdateInQueue => "UPDATE_IN_QUEUE",
            TieredEvent::Reprofile => "REPROFILE",
            TieredEvent::MakeNotEntrant => "MAKE_NOT_ENTRANT",
        };
        f.write_str(name)
    }
}

macro_rules! emit {
    ($config:expr, $($rest:tt)*) => {
        if $config.print_tiered_events {
            tracing::info!(target: "tiered::events", $($rest)*);
        } else {
            tracing::trace!(target: "tiered::events", $($rest)*);
        }
    };
}

/// Records one policy or queue event for `method` (and `inlinee`, when the
/// event happened in an inlined scope).
pub(crate) fn print_event(
    config: &TieredConfig,
    event: TieredEvent,
    method: &Method,
    inlinee: &Method,
    bci: i32,
    level: CompLevel,
) {
    if !tracing::enabled!(target: "tiered::events", tracing::Level::TRACE) {
        return;
    }
    let osr_bci = (bci != INVOCATION_ENTRY_BCI).then_some(bci);
    let inlinee = (inlinee.id() != method.id()).then(|| inlinee.name());
    emit!(
        config,
        event = %event,
        method = method.name(),
        inlinee,
        osr_bci,
        %level,
        invocations = method.invocation_count(),
        backedges = method.backedge_count(),
        rate = method.counters().rate(),
        comp_level = %method.comp_level(),
        "tiered event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_core::Config;

    #[test]
    fn test_event_names() {
        assert_eq!(TieredEvent::RemoveFromQueue.to_string(), "REMOVE_FROM_QUEUE");
        assert_eq!(TieredEvent::MakeNotEntrant.to_string(), "MAKE_NOT_ENTRANT");
    }

    #[test]
    fn test_print_event_without_subscriber() {
        let config = TieredConfig {
            print_tiered_events: true,
            ..TieredConfig::defaults()
        };
        let m = Method::builder(1, "A.f()V").build();
        print_event(&config, TieredEvent::Call, &m, &m, INVOCATION_ENTRY_BCI, CompLevel::None);
    }
}
