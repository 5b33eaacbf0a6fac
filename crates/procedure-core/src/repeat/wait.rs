//! Wait strategies: the delays between repeated attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long to wait before each attempt after the first.
///
/// `delay(k)` is the `k`-th delay, counted from zero.
///
/// Example with `Exponential { period: 1s, max: 20s }`:
/// - k = 0: 1s
/// - k = 1: 2s
/// - k = 4: 16s
/// - k = 5: 20s (capped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// No delay.
    Immediate,

    /// The same delay every time.
    Constant(Duration),

    /// Uniformly random in `min..=max`, drawn per attempt.
    Random { min: Duration, max: Duration },

    /// `initial + increment * k` seconds, never below zero.
    Incrementing { initial: Duration, increment: f64 },

    /// `min(period * 2^k, max)`.
    Exponential { period: Duration, max: Duration },

    /// `min(period * fib(k), max)` with `fib(0) = 0`, `fib(1) = 1`.
    Fibonacci { period: Duration, max: Duration },
}

impl WaitStrategy {
    pub fn delay(&self, k: u32) -> Duration {
        match self {
            WaitStrategy::Immediate => Duration::ZERO,
            WaitStrategy::Constant(delay) => *delay,
            WaitStrategy::Random { min, max } => {
                if min >= max {
                    return *min;
                }
                let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
            WaitStrategy::Incrementing { initial, increment } => {
                let secs = initial.as_secs_f64() + increment * f64::from(k);
                Duration::from_secs_f64(secs.max(0.0))
            }
            WaitStrategy::Exponential { period, max } => {
                let factor = 2f64.powi(k.min(1023) as i32);
                capped(period.as_secs_f64() * factor, *max)
            }
            WaitStrategy::Fibonacci { period, max } => {
                capped(period.as_secs_f64() * fibonacci(k), *max)
            }
        }
    }

    /// The infinite sequence of delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..).map(|k| self.delay(k))
    }
}

fn capped(secs: f64, max: Duration) -> Duration {
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

fn fibonacci(k: u32) -> f64 {
    let (mut a, mut b) = (0f64, 1f64);
    for _ in 0..k {
        (a, b) = (b, a + b);
        if !a.is_finite() {
            break;
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[rstest]
    #[case::exponential(
        WaitStrategy::Exponential { period: Duration::from_secs(1), max: Duration::from_secs(20) },
        secs(&[1, 2, 4, 8, 16, 20, 20])
    )]
    #[case::fibonacci(
        WaitStrategy::Fibonacci { period: Duration::from_secs(1), max: Duration::from_secs(10) },
        secs(&[0, 1, 1, 2, 3, 5, 8, 10, 10])
    )]
    #[case::incrementing(
        WaitStrategy::Incrementing { initial: Duration::from_secs(3), increment: 2.0 },
        secs(&[3, 5, 7, 9])
    )]
    #[case::decrementing_clamps_at_zero(
        WaitStrategy::Incrementing { initial: Duration::from_secs(3), increment: -2.0 },
        vec![Duration::from_secs(3), Duration::from_secs(1), Duration::ZERO, Duration::ZERO]
    )]
    #[case::constant(WaitStrategy::Constant(Duration::from_secs(4)), secs(&[4, 4, 4]))]
    #[case::immediate(WaitStrategy::Immediate, vec![Duration::ZERO; 3])]
    fn delay_sequences(#[case] strategy: WaitStrategy, #[case] expected: Vec<Duration>) {
        let delays: Vec<Duration> = strategy.delays().take(expected.len()).collect();
        assert_eq!(delays, expected);
    }

    #[test]
    fn random_stays_in_range() {
        let strategy = WaitStrategy::Random {
            min: Duration::from_millis(100),
            max: Duration::from_millis(200),
        };
        for delay in strategy.delays().take(50) {
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn large_exponents_saturate_at_max() {
        let strategy = WaitStrategy::Exponential {
            period: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(strategy.delay(5_000), Duration::from_secs(60));
    }
}
