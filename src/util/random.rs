use rand::Rng;
use std::ops::Range;
use std::time::Duration;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn gen_f64_range(range: Range<f64>) -> f64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(range: Range<f64>) -> f64 {
        rand::thread_rng().gen_range(range)
    }
}

/// Randomizes an interval by +/- 10% so that circuits created at the same time do not keep
///  pinging in lockstep
pub fn jittered_interval<R: Random>(interval: Duration) -> Duration {
    interval.mul_f64(R::gen_f64_range(0.9..1.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::low(0.9, 4500)]
    #[case::nominal(1.0, 5000)]
    #[case::high(1.09, 5450)]
    fn test_jittered_interval(#[case] factor: f64, #[case] expected_millis: u64) {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect()
            .withf(|r| r.start == 0.9 && r.end == 1.1)
            .return_const(factor);

        let actual = jittered_interval::<MockRandom>(Duration::from_secs(5));
        assert_eq!(actual.as_millis() as u64, expected_millis);
    }

    #[test]
    fn test_jittered_interval_rng() {
        for _ in 0..100 {
            let actual = jittered_interval::<RngRandom>(Duration::from_secs(5));
            assert!(actual >= Duration::from_millis(4500));
            assert!(actual < Duration::from_millis(5500));
        }
    }
}
