//! Poisson fit statistics.
//!
//! Both statistics are `-2 ln L` up to a data-only constant chosen so that a
//! perfect prediction gives zero.

/// Predicted counts below this value are clipped before taking logarithms.
pub const TRUNCATION_VALUE: f64 = 1e-25;

/// Cash statistic of one bin: `2 (mu - n + n ln(n / mu))`, `2 mu` for `n = 0`.
#[inline]
pub fn cash(n: f64, mu: f64) -> f64 {
    let mu = mu.max(TRUNCATION_VALUE);
    if n > 0.0 { 2.0 * (mu - n + n * (n / mu).ln()) } else { 2.0 * mu }
}

/// Cash statistic summed over the selected bins
pub fn cash_sum<'a>(
    n: impl IntoIterator<Item = &'a f64>,
    mu: impl IntoIterator<Item = &'a f64>,
    mask: impl IntoIterator<Item = &'a bool>,
) -> f64 {
    n.into_iter()
        .zip(mu)
        .zip(mask)
        .filter(|(_, m)| **m)
        .map(|((&n, &mu), _)| cash(n, mu))
        .sum()
}

/// Profiled background of the on/off likelihood for signal `mu_sig`.
///
/// Maximizes `L(n_on | mu_sig + alpha mu_bkg) L(n_off | mu_bkg)` over `mu_bkg`.
/// With `alpha <= 0` the on region carries no background and the estimate is `n_off`.
pub fn wstat_mu_bkg(n_on: f64, n_off: f64, alpha: f64, mu_sig: f64) -> f64 {
    if alpha <= 0.0 {
        return n_off;
    }
    let c = alpha * (n_on + n_off) - (1.0 + alpha) * mu_sig;
    let d = (c * c + 4.0 * alpha * (alpha + 1.0) * n_off * mu_sig).sqrt();
    let mu_bkg = (c + d) / (2.0 * alpha * (alpha + 1.0));
    mu_bkg.max(0.0)
}

/// WSTAT of one bin with the background profiled out.
///
/// `alpha` is the on/off exposure ratio. Terms with zero counts drop out.
pub fn wstat(n_on: f64, n_off: f64, alpha: f64, mu_sig: f64) -> f64 {
    let mu_bkg = wstat_mu_bkg(n_on, n_off, alpha, mu_sig);
    let mut stat = mu_sig + (1.0 + alpha) * mu_bkg;
    if n_on > 0.0 {
        let mu_on = (mu_sig + alpha * mu_bkg).max(TRUNCATION_VALUE);
        stat += n_on * ((n_on / mu_on).ln() - 1.0);
    }
    if n_off > 0.0 {
        let mu_off = mu_bkg.max(TRUNCATION_VALUE);
        stat += n_off * ((n_off / mu_off).ln() - 1.0);
    }
    2.0 * stat
}

/// Excess counts `n_on - alpha n_off`
#[inline]
pub fn excess(n_on: f64, n_off: f64, alpha: f64) -> f64 {
    n_on - alpha * n_off
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_cash_perfect_prediction() {
        assert_relative_eq!(cash(10.0, 10.0), 0.0, epsilon = 1e-12);
        assert_relative_eq!(cash(0.0, 3.0), 6.0);
        assert!(cash(5.0, 0.0) > 100.0);
        assert_relative_eq!(cash(4.0, 2.0), 2.0 * (2.0 - 4.0 + 4.0 * 2f64.ln()));
    }

    #[test]
    fn test_cash_sum_respects_mask() {
        let n = [1.0, 2.0, 3.0];
        let mu = [2.0, 2.0, 100.0];
        let mask = [true, true, false];
        let expected = cash(1.0, 2.0) + cash(2.0, 2.0);
        assert_relative_eq!(cash_sum(&n, &mu, &mask), expected);
    }

    #[test]
    fn test_wstat_reference_values() {
        // no signal, on/off consistent with alpha: background alone explains the data
        assert_relative_eq!(wstat(10.0, 100.0, 0.1, 0.0), 0.0, epsilon = 1e-9);
        // excess fully explained by the signal
        assert_relative_eq!(wstat(15.0, 100.0, 0.1, 5.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(wstat_mu_bkg(15.0, 100.0, 0.1, 5.0), 100.0, epsilon = 1e-9);
        // empty off region
        let s = wstat(3.0, 0.0, 0.5, 1.0);
        assert!(s.is_finite() && s > 0.0);
        // empty on and off regions
        assert_relative_eq!(wstat(0.0, 0.0, 0.5, 2.0), 4.0, epsilon = 1e-12);
        // no off exposure reduces to Cash
        assert_relative_eq!(wstat(4.0, 7.0, 0.0, 2.0), cash(4.0, 2.0), epsilon = 1e-12);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

        #[test]
        fn test_wstat_is_minimal_at_the_excess(
            n_off in 1u32..200,
            alpha in 0.05f64..1.0,
            extra in 1u32..50,
        ) {
            let n_off = n_off as f64;
            let n_on = (alpha * n_off).round() + extra as f64;
            let best = excess(n_on, n_off, alpha);
            prop_assume!(best > 0.0);
            let at_best = wstat(n_on, n_off, alpha, best);
            prop_assert!(at_best.abs() < 1e-6);
            prop_assert!(wstat(n_on, n_off, alpha, best * 1.5) > at_best);
            prop_assert!(wstat(n_on, n_off, alpha, best * 0.5) > at_best);
        }

        #[test]
        fn test_cash_is_non_negative(n in 0u32..1000, mu in 1e-3f64..1e3) {
            prop_assert!(cash(n as f64, mu) >= -1e-9);
        }
    }
}
