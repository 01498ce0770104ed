use std::fmt::Display;

/// Session-scoped attempt budget for opening the verification stream.
///
/// Created once per session and owned by the orchestrator. Attempts are
/// never refunded: a session that burned its budget on one open cannot
/// retry on a later one.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts - self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Consume one attempt. Returns `false` once the budget is spent.
    pub fn try_acquire(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Run `op` until it succeeds or the budget runs out. Returns the last
    /// error when every remaining attempt failed, `None` if none were left.
    pub fn run<T, E: Display>(
        &mut self,
        what: &str,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, Option<E>> {
        let mut last_error = None;
        while self.try_acquire() {
            match op() {
                Ok(value) => {
                    tracing::debug!(what, attempt = self.attempts, "attempt succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(
                        what,
                        attempt = self.attempts,
                        remaining = self.remaining(),
                        error = %e,
                        "attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_within_budget() {
        let mut policy = RetryPolicy::new(3);
        let mut calls = 0;
        let result = policy.run("open", || {
            calls += 1;
            if calls < 3 {
                Err("refused")
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
        assert_eq!(policy.attempts(), 3);
        assert!(policy.is_exhausted());
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let mut policy = RetryPolicy::new(2);
        let result: Result<(), _> = policy.run("open", || Err("refused"));
        assert_eq!(result, Err(Some("refused")));
        assert_eq!(policy.remaining(), 0);
    }

    #[test]
    fn test_budget_is_not_refunded() {
        let mut policy = RetryPolicy::new(2);
        let _: Result<(), _> = policy.run("open", || Err("refused"));
        let mut called = false;
        let result: Result<(), Option<&str>> = policy.run("open", || {
            called = true;
            Ok(())
        });
        assert_eq!(result, Err(None));
        assert!(!called);
    }

    #[test]
    fn test_independent_per_session() {
        let mut first = RetryPolicy::new(1);
        assert!(first.try_acquire());
        assert!(!first.try_acquire());
        // A new session starts with a fresh budget
        let mut second = RetryPolicy::new(1);
        assert!(second.try_acquire());
    }

    #[test]
    fn test_zero_is_treated_as_one() {
        let mut policy = RetryPolicy::new(0);
        assert!(policy.try_acquire());
        assert!(!policy.try_acquire());
    }
}
