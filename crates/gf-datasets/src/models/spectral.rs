//! Spectral models: differential flux `dN/dE` as a function of true energy.
//!
//! Energies are in TeV and amplitudes in `cm-2 s-1 TeV-1`, so integrals over
//! an energy bin are in `cm-2 s-1`.


use gf_core::{Parameter, Parameters};
use std::fmt::Debug;

/// Capability required by the evaluator from a spectral model
pub trait SpectralModel: Debug + Send + Sync {
    /// Differential flux at `energy`
    fn evaluate(&self, energy: f64) -> f64;

    /// Integral flux between `e_lo` and `e_hi`.
    ///
    /// The default integrates `E * dN/dE` over `ln E` with Simpson's rule on
    /// 32 sub-intervals.
    fn integral(&self, e_lo: f64, e_hi: f64) -> f64 {
        const N: usize = 32;
        let (a, b) = (e_lo.ln(), e_hi.ln());
        let h = (b - a) / N as f64;
        let f = |x: f64| {
            let e = x.exp();
            e * self.evaluate(e)
        };
        let mut sum = f(a) + f(b);
        for i in 1..N {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += w * f(a + i as f64 * h);
        }
        sum * h / 3.0
    }

    /// Model parameters
    fn parameters(&self) -> Parameters;
}

/// `amplitude * (E / reference)^(-index)`
#[derive(Debug, Clone)]
pub struct PowerLaw {
    /// Spectral index
    pub index: Parameter,
    /// Differential flux at `reference` (cm⁻² s⁻¹ TeV⁻¹)
    pub amplitude: Parameter,
    /// Reference energy (TeV), frozen
    pub reference: Parameter,
}

impl PowerLaw {
    /// Power law with a frozen reference energy
    pub fn new(index: f64, amplitude: f64, reference: f64) -> Self {
        Self {
            index: Parameter::new("index", index),
            amplitude: Parameter::new("amplitude", amplitude).with_unit("cm-2 s-1 TeV-1"),
            reference: Parameter::new("reference", reference).with_unit("TeV").with_frozen(true),
        }
    }
}

impl Default for PowerLaw {
    fn default() -> Self {
        Self::new(2.0, 1e-12, 1.0)
    }
}

impl SpectralModel for PowerLaw {
    fn evaluate(&self, energy: f64) -> f64 {
        self.amplitude.value() * (energy / self.reference.value()).powf(-self.index.value())
    }

    fn integral(&self, e_lo: f64, e_hi: f64) -> f64 {
        let (amp, e0, idx) = (self.amplitude.value(), self.reference.value(), self.index.value());
        let g = 1.0 - idx;
        if g.abs() < 1e-10 {
            amp * e0 * (e_hi / e_lo).ln()
        } else {
            amp * e0 / g * ((e_hi / e0).powf(g) - (e_lo / e0).powf(g))
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![self.index.clone(), self.amplitude.clone(), self.reference.clone()])
    }
}

/// `amplitude * (E / reference)^(-alpha - beta ln(E / reference))`
#[derive(Debug, Clone)]
pub struct LogParabola {
    /// Differential flux at `reference` (cm⁻² s⁻¹ TeV⁻¹)
    pub amplitude: Parameter,
    /// Reference energy (TeV), frozen
    pub reference: Parameter,
    /// Index at `reference`
    pub alpha: Parameter,
    /// Curvature
    pub beta: Parameter,
}

impl LogParabola {
    /// Log parabola with a frozen reference energy
    pub fn new(amplitude: f64, reference: f64, alpha: f64, beta: f64) -> Self {
        Self {
            amplitude: Parameter::new("amplitude", amplitude).with_unit("cm-2 s-1 TeV-1"),
            reference: Parameter::new("reference", reference).with_unit("TeV").with_frozen(true),
            alpha: Parameter::new("alpha", alpha),
            beta: Parameter::new("beta", beta),
        }
    }
}

impl SpectralModel for LogParabola {
    fn evaluate(&self, energy: f64) -> f64 {
        let x = energy / self.reference.value();
        let exponent = -self.alpha.value() - self.beta.value() * x.ln();
        self.amplitude.value() * x.powf(exponent)
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.amplitude.clone(),
            self.reference.clone(),
            self.alpha.clone(),
            self.beta.clone(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_power_law_integral_matches_numeric() {
        let pl = PowerLaw::new(2.3, 2e-12, 1.0);
        let analytic = pl.integral(0.5, 3.0);
        // default trait integration on the same model
        #[derive(Debug)]
        struct Numeric<'a>(&'a PowerLaw);
        impl SpectralModel for Numeric<'_> {
            fn evaluate(&self, e: f64) -> f64 {
                self.0.evaluate(e)
            }
            fn parameters(&self) -> Parameters {
                self.0.parameters()
            }
        }
        assert_relative_eq!(Numeric(&pl).integral(0.5, 3.0), analytic, max_relative = 1e-6);

        let flat = PowerLaw::new(1.0, 1.0, 1.0);
        assert_relative_eq!(flat.integral(1.0, std::f64::consts::E), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log_parabola_reduces_to_power_law() {
        let lp = LogParabola::new(1e-12, 1.0, 2.0, 0.0);
        let pl = PowerLaw::new(2.0, 1e-12, 1.0);
        assert_relative_eq!(lp.evaluate(3.7), pl.evaluate(3.7), max_relative = 1e-12);
        assert_relative_eq!(lp.integral(1.0, 10.0), pl.integral(1.0, 10.0), max_relative = 1e-5);
        assert_eq!(lp.parameters().len(), 4);
        assert!(lp.reference.is_frozen());
    }
}
