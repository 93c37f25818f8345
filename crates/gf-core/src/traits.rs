//! Core traits for gammafold
//!
//! The fit driver (`gf-inference`) depends only on [`StatDataset`], never on
//! concrete dataset types, so new dataset kinds plug in without touching the
//! optimizer code.

use crate::Result;
use crate::parameter::Parameters;

/// A dataset that can be fitted: it exposes its model parameters and a scalar
/// fit statistic evaluated at the parameters' current values.
pub trait StatDataset: Send + Sync {
    /// Dataset name, used in log messages and results
    fn name(&self) -> &str;

    /// All parameters the statistic depends on (frozen ones included)
    fn parameters(&self) -> Parameters;

    /// Total fit statistic (`-2 ln L` up to a constant) over unmasked bins
    fn stat_sum(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Parameter;

    struct Parabola {
        x: Parameter,
    }

    impl StatDataset for Parabola {
        fn name(&self) -> &str {
            "parabola"
        }

        fn parameters(&self) -> Parameters {
            Parameters::new(vec![self.x.clone()])
        }

        fn stat_sum(&self) -> Result<f64> {
            Ok((self.x.value() - 2.0).powi(2))
        }
    }

    #[test]
    fn test_stat_follows_parameter() {
        let ds = Parabola { x: Parameter::new("x", 0.0) };
        assert_eq!(ds.stat_sum().unwrap(), 4.0);
        ds.parameters().set_values(&[2.0]).unwrap();
        assert_eq!(ds.stat_sum().unwrap(), 0.0);
        assert_eq!(ds.name(), "parabola");
    }
}
