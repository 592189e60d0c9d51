use std::thread::sleep;
use std::time::Duration;

/// Retries `f` up to `max_attempts` times, sleeping `interval` between
/// attempts. Returns the first successful result together with the number of
/// attempts consumed, or the last error with the full attempt count.
///
/// `max_attempts` of zero is treated as one attempt.
pub fn retry_with_attempts<F, T, E>(
    max_attempts: usize,
    interval: Duration,
    mut f: F,
) -> (Result<T, E>, usize)
where
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match f() {
            Ok(result) => return (Ok(result), attempt),
            Err(err) => {
                last_err = Some(err);
                if attempt < max_attempts {
                    sleep(interval);
                }
            }
        }
    }
    let err = last_err.expect("some error must exist at this point");
    (Err(err), max_attempts)
}
