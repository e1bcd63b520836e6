//! Bounded retry with a fixed pause.

use std::future::Future;
use std::time::Duration;

/// How often, and how patiently, to retry an operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between two attempts.
    pub pause: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts,
            pause,
        }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `between` runs after each failed attempt that will be retried, before
    /// the pause. `on_give_up` runs once with the last error when no attempt
    /// succeeded.
    pub async fn run<T, E, Op, Fut, Between, GiveUp>(
        &self,
        mut op: Op,
        mut between: Between,
        on_give_up: GiveUp,
    ) -> Result<T, E>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Between: FnMut(&E, u32),
        GiveUp: FnOnce(&E),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => {
                    on_give_up(&err);
                    return Err(err);
                }
                Err(err) => {
                    between(&err, attempt);
                    tokio::time::sleep(self.pause).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(6, Duration::from_millis(200))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const FAST: RetryPolicy = RetryPolicy::new(6, Duration::from_millis(1));

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let hooks = Cell::new(0);
        let result: Result<u32, String> = FAST
            .run(
                |attempt| async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                },
                |_, _| hooks.set(hooks.get() + 1),
                |_| panic!("should not give up"),
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(hooks.get(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let gave_up = Cell::new(0);
        let result: Result<(), String> = FAST
            .run(
                |attempt| {
                    calls.set(calls.get() + 1);
                    async move { Err(format!("locked ({attempt})")) }
                },
                |_, _| {},
                |err| {
                    assert_eq!(err, "locked (6)");
                    gave_up.set(gave_up.get() + 1);
                },
            )
            .await;

        assert_eq!(result, Err("locked (6)".to_string()));
        assert_eq!(calls.get(), 6);
        assert_eq!(gave_up.get(), 1);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.pause, Duration::from_millis(200));
    }
}
