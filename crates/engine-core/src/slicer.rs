//! Time-window generation and overload-driven splitting.

use crate::error::SlicerError;
use chrono::{DateTime, TimeDelta, Utc};
use connectors::source::OverloadSignal;
use model::{core::time::truncate_millis, window::TimeWindow};
use std::future::Future;
use tracing::debug;

/// Contiguous half-open windows covering `[since, until)`. Cloning restarts
/// from the clone point.
#[derive(Debug, Clone)]
pub struct Slices {
    cursor: DateTime<Utc>,
    until: DateTime<Utc>,
    step: Option<TimeDelta>,
}

impl Iterator for Slices {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        if self.cursor >= self.until {
            return None;
        }
        let to = match self.step {
            Some(step) => (self.cursor + step).min(self.until),
            None => self.until,
        };
        let window = TimeWindow {
            from: self.cursor,
            to,
        };
        self.cursor = to;
        Some(window)
    }
}

/// Splits `[since, until)` into windows of `step`, the last one possibly
/// shorter. A zero or negative step yields the whole range as one window.
pub fn generate(
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    step: TimeDelta,
) -> Result<Slices, SlicerError> {
    let (since, until) = (truncate_millis(since), truncate_millis(until));
    if since >= until {
        return Err(SlicerError::EmptyRange { since, until });
    }
    // sub-millisecond steps would never advance the cursor
    let step = (step.num_milliseconds() > 0).then(|| TimeDelta::milliseconds(step.num_milliseconds()));
    Ok(Slices {
        cursor: since,
        until,
        step,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    /// Windows at or below this duration are never split further.
    pub min_split: TimeDelta,
    pub max_depth: u32,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            min_split: TimeDelta::seconds(60),
            max_depth: 6,
        }
    }
}

#[derive(Debug)]
pub struct SplitOutcome<T> {
    /// Leaf windows and their results, in temporal order.
    pub leaves: Vec<(TimeWindow, T)>,
    pub splits: u32,
    pub deepest: u32,
}

/// Runs `fetch` over `window`, bisecting on overload until each piece
/// succeeds.
///
/// Halves are processed left before right, so side effects of `fetch` happen
/// in time order. An overload on a window that may not be split further is
/// returned as is; any other error is returned immediately.
pub async fn adaptive_split<T, E, F, Fut>(
    window: TimeWindow,
    policy: &SplitPolicy,
    mut fetch: F,
) -> Result<SplitOutcome<T>, E>
where
    E: OverloadSignal,
    F: FnMut(TimeWindow) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut stack = vec![(window, 0u32)];
    let mut outcome = SplitOutcome {
        leaves: Vec::new(),
        splits: 0,
        deepest: 0,
    };

    while let Some((current, depth)) = stack.pop() {
        outcome.deepest = outcome.deepest.max(depth);
        match fetch(current).await {
            Ok(value) => outcome.leaves.push((current, value)),
            Err(err) if err.is_overload() => {
                if current.duration() <= policy.min_split || depth >= policy.max_depth {
                    return Err(err);
                }
                let Some((left, right)) = current.split() else {
                    return Err(err);
                };
                debug!(window = %current, depth, "Source overloaded, splitting window");
                outcome.splits += 1;
                stack.push((right, depth + 1));
                stack.push((left, depth + 1));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Overloaded,
        Broken,
    }

    impl OverloadSignal for FakeError {
        fn is_overload(&self) -> bool {
            matches!(self, FakeError::Overloaded)
        }
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    fn assert_contiguous(windows: &[TimeWindow], since: DateTime<Utc>, until: DateTime<Utc>) {
        assert_eq!(windows.first().map(|w| w.from), Some(since));
        assert_eq!(windows.last().map(|w| w.to), Some(until));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
            assert!(pair[0].from < pair[0].to);
        }
    }

    #[test]
    fn quarter_hours_cover_the_hour() {
        let slices: Vec<_> = generate(t(0, 0), t(1, 0), TimeDelta::minutes(15))
            .unwrap()
            .collect();
        assert_eq!(slices.len(), 4);
        assert!(slices.iter().all(|w| w.duration() == TimeDelta::minutes(15)));
        assert_contiguous(&slices, t(0, 0), t(1, 0));
    }

    #[test]
    fn last_window_is_clipped() {
        let slices: Vec<_> = generate(t(0, 0), t(0, 50), TimeDelta::minutes(15))
            .unwrap()
            .collect();
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[3].duration(), TimeDelta::minutes(5));
        assert_contiguous(&slices, t(0, 0), t(0, 50));
    }

    #[test]
    fn non_positive_step_yields_one_window() {
        for step in [TimeDelta::zero(), TimeDelta::minutes(-5)] {
            let slices: Vec<_> = generate(t(0, 0), t(1, 0), step).unwrap().collect();
            assert_eq!(slices, vec![TimeWindow::new(t(0, 0), t(1, 0)).unwrap()]);
        }
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(matches!(
            generate(t(1, 0), t(1, 0), TimeDelta::minutes(1)),
            Err(SlicerError::EmptyRange { .. })
        ));
    }

    #[test]
    fn slices_restart_from_a_clone() {
        let mut slices = generate(t(0, 0), t(1, 0), TimeDelta::minutes(20)).unwrap();
        slices.next();
        let rest: Vec<_> = slices.clone().collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(slices.count(), 2);
    }

    #[tokio::test]
    async fn splits_until_pieces_fit() {
        let window = TimeWindow::new(t(0, 0), t(0, 5)).unwrap();
        let policy = SplitPolicy {
            min_split: TimeDelta::seconds(60),
            max_depth: 6,
        };
        let limit = TimeDelta::seconds(90);
        let outcome = adaptive_split(window, &policy, |w| async move {
            if w.duration() > limit {
                Err(FakeError::Overloaded)
            } else {
                Ok(w.duration())
            }
        })
        .await
        .unwrap();

        let leaves: Vec<_> = outcome.leaves.iter().map(|(w, _)| *w).collect();
        assert_contiguous(&leaves, window.from, window.to);
        assert!(leaves.iter().all(|w| w.duration() <= limit));
        assert_eq!(outcome.splits, 3);
        assert_eq!(outcome.deepest, 2);
    }

    #[tokio::test]
    async fn odd_millisecond_windows_keep_exact_coverage() {
        let window = TimeWindow::new(t(0, 0), t(0, 0) + TimeDelta::milliseconds(1001)).unwrap();
        let policy = SplitPolicy {
            min_split: TimeDelta::zero(),
            max_depth: 20,
        };
        let outcome = adaptive_split(window, &policy, |w| async move {
            if w.duration() > TimeDelta::milliseconds(100) {
                Err(FakeError::Overloaded)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        let leaves: Vec<_> = outcome.leaves.iter().map(|(w, _)| *w).collect();
        assert_contiguous(&leaves, window.from, window.to);
    }

    #[tokio::test]
    async fn reraises_overload_at_min_split() {
        let window = TimeWindow::new(t(0, 0), t(0, 5)).unwrap();
        let policy = SplitPolicy {
            min_split: TimeDelta::seconds(60),
            max_depth: 6,
        };
        let mut attempts = Vec::new();
        let err = adaptive_split(window, &policy, |w| {
            attempts.push(w);
            async { Err::<(), _>(FakeError::Overloaded) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, FakeError::Overloaded);
        let last = attempts.last().unwrap();
        assert!(last.duration() <= TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn reraises_overload_at_max_depth() {
        let window = TimeWindow::new(t(0, 0), t(1, 0)).unwrap();
        let policy = SplitPolicy {
            min_split: TimeDelta::zero(),
            max_depth: 2,
        };
        let mut depth_seen = 0usize;
        let err = adaptive_split(window, &policy, |_| {
            depth_seen += 1;
            async { Err::<(), _>(FakeError::Overloaded) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, FakeError::Overloaded);
        // root, left half, left quarter
        assert_eq!(depth_seen, 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_split() {
        let window = TimeWindow::new(t(0, 0), t(1, 0)).unwrap();
        let mut calls = 0;
        let err = adaptive_split(window, &SplitPolicy::default(), |_| {
            calls += 1;
            async { Err::<(), _>(FakeError::Broken) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, FakeError::Broken);
        assert_eq!(calls, 1);
    }
}
