//! Mean opinion score estimate from the E-model R factor.

const R_BASE: f64 = 94.768;
const R_FLOOR: f64 = 6.52;

/// R factor for the given round trip time and jitter (ms) and loss (percent).
pub fn r_factor(rtt: f64, jitter: f64, loss_percent: f64) -> f64 {
    let effective_latency = rtt + 2.0 * jitter + 10.0;
    let r = if effective_latency < 160.0 {
        R_BASE - effective_latency / 40.0
    } else if effective_latency < 1000.0 {
        R_BASE - (effective_latency - 120.0) / 10.0
    } else {
        0.0
    };

    if loss_percent <= r / 2.5 {
        (r - 2.5 * loss_percent).max(R_FLOOR)
    } else {
        0.0
    }
}

pub fn mos_from_r(r: f64) -> f64 {
    if r >= 100.0 {
        4.5
    } else if r > 0.0 {
        1.0 + 0.035 * r + 7e-6 * r * (r - 60.0) * (100.0 - r)
    } else {
        1.0
    }
}

/// `None` when either rtt or jitter is unavailable.
pub fn calculate(rtt: Option<f64>, jitter: Option<f64>, loss_percent: f64) -> Option<f64> {
    let (rtt, jitter) = (rtt?, jitter?);
    Some(mos_from_r(r_factor(rtt, jitter, loss_percent)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn perfect_network_scores_high() {
        let mos = calculate(Some(0.0), Some(0.0), 0.0).unwrap();
        // el = 10, r = 94.518
        assert!(close(mos, 1.0 + 0.035 * 94.518 + 7e-6 * 94.518 * 34.518 * 5.482));
        assert!(mos > 4.3);
    }

    #[test]
    fn long_latency_uses_second_segment() {
        let r = r_factor(200.0, 20.0, 0.0);
        // el = 250
        assert!(close(r, 94.768 - 13.0));
    }

    #[test]
    fn extreme_latency_scores_one() {
        assert!(close(calculate(Some(2000.0), Some(0.0), 0.0).unwrap(), 1.0));
    }

    #[test]
    fn loss_is_floored() {
        // el = 50 → r = 93.518; 36 % loss → 3.518, floored to 6.52
        assert!(close(r_factor(40.0, 0.0, 36.0), R_FLOOR));
        assert!(close(r_factor(40.0, 0.0, 40.0), 0.0));
    }

    #[test]
    fn missing_inputs_yield_none() {
        assert_eq!(calculate(None, Some(1.0), 0.0), None);
        assert_eq!(calculate(Some(1.0), None, 0.0), None);
    }
}
