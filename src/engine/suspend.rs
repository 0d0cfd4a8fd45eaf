//! Suspension reasons and the handler step type.

/// Why a worker is abandoning the current attempt at its work item.
///
/// Suspensions propagate out of handler code as the `Err` arm of [`Step`],
/// so any acquisition that can suspend composes with `?`. The worker loop
/// catches the value, unwinds the cleanup stack, and decides how to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// Another worker holds a needed resource. The suspending worker has
    /// already registered itself on that worker's blocked-on-me set; once
    /// promoted back to the ready queue it re-runs the work item from the
    /// top.
    Blocked,
    /// Re-run the work item immediately, without waiting on anyone — used
    /// after losing a race (e.g. a lookup went stale between suspensions).
    Retry,
    /// Park until a later protocol message installs the next step of a
    /// multistep operation. Cleanup entries detached beforehand (see
    /// [`crate::engine::Ctx::convert_to_multistep`]) survive the park.
    Multistep,
}

/// Result type for handler steps: `Ok` to continue, `Err` to suspend.
pub type Step<T = ()> = Result<T, Suspend>;

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_acquire() -> Step {
        Err(Suspend::Blocked)
    }

    fn handler_body() -> Step {
        blocked_acquire()?;
        unreachable!("suspension must short-circuit the handler");
    }

    #[test]
    fn suspend_propagates_through_question_mark() {
        assert_eq!(handler_body(), Err(Suspend::Blocked));
    }
}
