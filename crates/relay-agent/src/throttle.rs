//! Leading-edge throttle with a cooldown window.
//!
//! `offer` accepts a value when nothing is pending and the value differs from
//! the last accepted one. The emit itself runs one window later; offers made
//! meanwhile are dropped, not buffered.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Debug)]
struct ThrottleState {
    last: u32,
    in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    /// `initial` counts as already reported, so offering it again is a no-op.
    pub fn new(window: Duration, initial: u32) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(ThrottleState {
                last: initial,
                in_flight: false,
            })),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn offer<F, Fut>(&self, value: u32, emit: F) -> bool
    where
        F: FnOnce(u32) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.in_flight || st.last == value {
                return false;
            }
            st.in_flight = true;
            st.last = value;
        }

        // Deadline is fixed at offer time, not when the task is first polled.
        let deadline = tokio::time::Instant::now() + self.window;
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            emit(value).await;
            state.lock().unwrap_or_else(|e| e.into_inner()).in_flight = false;
        });
        true
    }

    pub fn last_reported(&self) -> u32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).last
    }
}

pub fn fraction_to_percent(progress: f64) -> u32 {
    if !progress.is_finite() {
        return 0;
    }
    (progress.clamp(0.0, 1.0) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Clone + Fn(u32) -> std::future::Ready<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let emit = move |v: u32| {
            sink.lock().unwrap().push(v);
            std::future::ready(())
        };
        (seen, emit)
    }

    async fn settle() {
        // Let spawned emit tasks observe the advanced clock.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_same_percent_yields_one_emit() {
        let (seen, emit) = recorder();
        let t = Throttle::new(Duration::from_secs(3), 0);

        let accepted = (0..10).filter(|_| t.offer(10, emit.clone())).count();
        assert_eq!(accepted, 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_percent_after_window_is_skipped() {
        let (seen, emit) = recorder();
        let t = Throttle::new(Duration::from_secs(3), 0);

        assert!(t.offer(40, emit.clone()));
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;

        assert!(!t.offer(40, emit.clone()));
        assert_eq!(*seen.lock().unwrap(), vec![40]);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_value_is_not_reemitted() {
        let (seen, emit) = recorder();
        let t = Throttle::new(Duration::from_secs(3), 0);
        assert!(!t.offer(0, emit));
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_percents_emit_at_most_once_per_window() {
        let (seen, emit) = recorder();
        let t = Throttle::new(Duration::from_secs(3), 0);

        // 10 -> 50 -> 90 within one window: only the first is taken.
        assert!(t.offer(10, emit.clone()));
        assert!(!t.offer(50, emit.clone()));
        assert!(!t.offer(90, emit.clone()));
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![10]);

        // Window closed: the next distinct value starts a new one.
        assert!(t.offer(90, emit.clone()));
        assert!(!t.offer(95, emit.clone()));
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![10, 90]);
        assert_eq!(t.last_reported(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_waits_for_the_window() {
        let (seen, emit) = recorder();
        let t = Throttle::new(Duration::from_secs(3), 0);
        t.offer(5, emit);

        tokio::time::advance(Duration::from_millis(2999)).await;
        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn fraction_rounds_and_clamps() {
        assert_eq!(fraction_to_percent(0.004), 0);
        assert_eq!(fraction_to_percent(0.506), 51);
        assert_eq!(fraction_to_percent(1.7), 100);
        assert_eq!(fraction_to_percent(f64::NAN), 0);
    }
}
