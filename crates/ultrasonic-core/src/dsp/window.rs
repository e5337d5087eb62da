use crate::config::WindowKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Window coefficients, computed once per (kind, size) and shared.
pub fn coefficients(kind: WindowKind, size: usize) -> Arc<Vec<f32>> {
    static CACHE: OnceLock<Mutex<HashMap<(WindowKind, usize), Arc<Vec<f32>>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = match cache.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    cache
        .entry((kind, size))
        .or_insert_with(|| Arc::new(compute(kind, size)))
        .clone()
}

fn compute(kind: WindowKind, size: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; size];
    let denom = size as f32;
    let tau = 2.0 * std::f32::consts::PI;
    for (i, v) in out.iter_mut().enumerate() {
        let phase = tau * (i as f32) / denom;
        *v = match kind {
            WindowKind::Hann => 0.5 * (1.0 - phase.cos()),
            WindowKind::Hamming => 0.54 - 0.46 * phase.cos(),
            WindowKind::Blackman => 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos(),
            WindowKind::Rectangular => 1.0,
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_returns_shared_coefficients() {
        let a = coefficients(WindowKind::Hann, 1024);
        let b = coefficients(WindowKind::Hann, 1024);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn rectangular_is_unity() {
        let w = coefficients(WindowKind::Rectangular, 64);
        assert!(w.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn hann_starts_at_zero_and_peaks_mid_window() {
        let w = compute(WindowKind::Hann, 256);
        assert!(w[0].abs() < 1e-6);
        assert!((w[128] - 1.0).abs() < 1e-6);
    }
}
