// ===============================
// src/optimizer.rs
// ===============================
//
// Long-only mean-variance weights:
//
//   maximize  w'mu - lambda * w'Sigma w   subject to  sum(w) = 1, w >= 0
//
// Solved with projected gradient ascent; the step is 1/L where L bounds the
// curvature (2 * lambda * max absolute row sum of Sigma), floored at 1e-3.
//
use ndarray::{Array1, Array2, Axis};

#[derive(Debug, Clone)]
pub struct MeanVariance {
    pub risk_aversion: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for MeanVariance {
    fn default() -> Self {
        Self { risk_aversion: 0.5, max_iter: 10_000, tolerance: 1e-12 }
    }
}

/// Column means and sample covariance (n - 1) of a dates x assets matrix.
pub fn mean_and_cov(returns: &Array2<f64>) -> Option<(Array1<f64>, Array2<f64>)> {
    let (n, k) = returns.dim();
    if n < 2 || k == 0 {
        return None;
    }
    let mu = returns.mean_axis(Axis(0))?;
    let centered = returns - &mu;
    let cov = centered.t().dot(&centered) / (n as f64 - 1.0);
    Some((mu, cov))
}

/// Euclidean projection onto the probability simplex.
pub fn project_to_simplex(v: &Array1<f64>) -> Array1<f64> {
    if v.is_empty() {
        return Array1::zeros(0);
    }
    let mut u = v.to_vec();
    u.sort_by(|a, b| b.total_cmp(a));
    let mut cumsum = 0.0;
    let mut theta = 0.0;
    for (j, uj) in u.iter().enumerate() {
        cumsum += uj;
        let t = (cumsum - 1.0) / (j + 1) as f64;
        if uj - t > 0.0 {
            theta = t;
        }
    }
    v.mapv(|x| (x - theta).max(0.0))
}

impl MeanVariance {
    #[cfg(test)]
    pub fn objective(&self, w: &Array1<f64>, mu: &Array1<f64>, cov: &Array2<f64>) -> f64 {
        w.dot(mu) - self.risk_aversion * w.dot(&cov.dot(w))
    }

    /// Optimal weights in the order of `mu`. Empty input gives empty weights.
    pub fn optimize(&self, mu: &Array1<f64>, cov: &Array2<f64>) -> Array1<f64> {
        let k = mu.len();
        if k == 0 {
            return Array1::zeros(0);
        }
        let lambda = self.risk_aversion.max(0.0);
        let row_bound = cov
            .rows()
            .into_iter()
            .map(|row| row.mapv(f64::abs).sum())
            .fold(0.0, f64::max);
        let step = 1.0 / (2.0 * lambda * row_bound).max(1e-3);

        let mut w = Array1::from_elem(k, 1.0 / k as f64);
        for _ in 0..self.max_iter {
            let grad = mu - &(cov.dot(&w) * (2.0 * lambda));
            let next = project_to_simplex(&(&w + &(grad * step)));
            let moved = (&next - &w).mapv(|d| d * d).sum();
            w = next;
            if moved < self.tolerance {
                break;
            }
        }
        w
    }
}
