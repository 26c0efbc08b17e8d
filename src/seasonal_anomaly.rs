//! Robust decomposition of a weekly-seasonal hourly series into a low-rank
//! trend/seasonal component and a sparse residual, via an inexact
//! Augmented Lagrange Multiplier (IALM) iteration over `ndarray` matrices.
//! Replaces the robust PCA call the original implementation made out to R;
//! the singular value decomposition it needs is implemented directly here
//! with a Jacobi eigenvalue solver, since nothing in this stack provides one.

use ndarray::{Array1, Array2};

const SEASONAL_PERIOD: usize = 168;
const MAX_RPCA_ITERS: usize = 60;
const MAX_JACOBI_SWEEPS: usize = 40;
const CONVERGENCE_TOL: f64 = 1e-7;

/// Per-point residual score for `series`, same length as the input. The
/// leading `series.len() % period` samples (discarded from the matrix
/// reshape) are reported as 0. A value `< -10` at a given index signals an
/// unusually low count at that hour relative to the learned baseline.
pub fn detect(series: &[i64], period: usize) -> Vec<f64> {
    let n = series.len();
    if period == 0 || n < period {
        return vec![0.0; n];
    }

    let rows = n / period;
    let discard = n % period;
    if rows == 0 {
        return vec![0.0; n];
    }

    let data: Vec<f64> = series[discard..].iter().map(|&x| x as f64).collect();
    let matrix = Array2::from_shape_vec((rows, period), data).expect("length matches rows*period by construction");

    let residual = rpca_sparse_component(&matrix);

    let mut out = vec![0.0; discard];
    out.extend(residual.iter().copied());
    out
}

/// `detect` specialized to the standard weekly seasonal period.
pub fn detect_weekly(series: &[i64]) -> Vec<f64> {
    detect(series, SEASONAL_PERIOD)
}

fn rpca_sparse_component(d: &Array2<f64>) -> Array1<f64> {
    let (rows, cols) = d.dim();
    let norm_d = frobenius_norm(d);
    if norm_d < f64::EPSILON {
        return Array1::zeros(rows * cols);
    }

    let spectral = spectral_norm(d).max(1e-12);
    let inf_norm = d.iter().copied().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let lambda = 1.0 / (rows.max(cols) as f64).sqrt();
    let j = spectral.max(inf_norm / lambda);

    let mut y = d / j;
    let mut mu = 1.25 / spectral;
    let mu_bar = mu * 1e7;
    let rho = 1.5;

    let mut l = Array2::<f64>::zeros((rows, cols));
    let mut s = Array2::<f64>::zeros((rows, cols));

    for _ in 0..MAX_RPCA_ITERS {
        let target = d - &s + &y / mu;
        let (u, singular_values, vt) = economy_svd(&target);
        let shrunk = singular_values.mapv(|v| soft_threshold(v, 1.0 / mu));
        l = u.dot(&Array2::from_diag(&shrunk)).dot(&vt);

        let s_target = d - &l + &y / mu;
        s = s_target.mapv(|v| soft_threshold(v, lambda / mu));

        let residual = d - &l - &s;
        y = y + &residual * mu;
        mu = (mu * rho).min(mu_bar);

        if frobenius_norm(&residual) / norm_d < CONVERGENCE_TOL {
            break;
        }
    }

    s.into_shape_with_order(rows * cols).expect("row-major flatten of a contiguous matrix")
}

fn soft_threshold(x: f64, tau: f64) -> f64 {
    if x > tau {
        x - tau
    } else if x < -tau {
        x + tau
    } else {
        0.0
    }
}

fn frobenius_norm(m: &Array2<f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Largest singular value of `m`, via power iteration on `M^T M`.
fn spectral_norm(m: &Array2<f64>) -> f64 {
    let mtm = m.t().dot(m);
    let n = mtm.nrows();
    if n == 0 {
        return 0.0;
    }
    let mut v = Array1::<f64>::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut eigenvalue = 0.0;
    for _ in 0..100 {
        let mv = mtm.dot(&v);
        let norm = mv.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm < 1e-15 {
            return 0.0;
        }
        v = mv / norm;
        eigenvalue = v.dot(&mtm.dot(&v));
    }
    eigenvalue.max(0.0).sqrt()
}

/// Economy SVD: returns `(U, singular_values, V^T)` with `U: rows x k`,
/// `singular_values: k`, `V^T: k x cols`, `k = min(rows, cols)`.
///
/// Computed from the eigendecomposition of whichever Gram matrix is
/// smaller (`M M^T` or `M^T M`), via Jacobi rotation — the cheapest SVD
/// route available without a dedicated linear-algebra crate, and accurate
/// enough for the low iteration counts RPCA needs here.
fn economy_svd(m: &Array2<f64>) -> (Array2<f64>, Array1<f64>, Array2<f64>) {
    let (rows, cols) = m.dim();
    if rows <= cols {
        let gram = m.dot(&m.t());
        let (u, eigenvalues) = jacobi_eigen_symmetric(&gram);
        let (u, singular_values) = sort_and_clamp(u, eigenvalues);
        let vt = pseudo_invert_other_side(m, &u, &singular_values, true);
        (u, singular_values, vt)
    } else {
        let gram = m.t().dot(m);
        let (v, eigenvalues) = jacobi_eigen_symmetric(&gram);
        let (v, singular_values) = sort_and_clamp(v, eigenvalues);
        let u = pseudo_invert_other_side(m, &v, &singular_values, false);
        (u, singular_values, v.t().to_owned())
    }
}

fn sort_and_clamp(vectors: Array2<f64>, eigenvalues: Array1<f64>) -> (Array2<f64>, Array1<f64>) {
    let n = eigenvalues.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigenvalues[b].partial_cmp(&eigenvalues[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut sorted_vectors = Array2::<f64>::zeros((vectors.nrows(), n));
    let mut sorted_values = Array1::<f64>::zeros(n);
    for (new_idx, &old_idx) in order.iter().enumerate() {
        sorted_vectors.column_mut(new_idx).assign(&vectors.column(old_idx));
        sorted_values[new_idx] = eigenvalues[old_idx].max(0.0).sqrt();
    }
    (sorted_vectors, sorted_values)
}

/// Given `M`, the eigenvectors computed from one side's Gram matrix, and
/// the singular values, recovers the other side's singular vectors as
/// `M^T U / s` (or `M V / s`), zeroing columns whose singular value is
/// numerically zero rather than dividing by it.
fn pseudo_invert_other_side(m: &Array2<f64>, known: &Array2<f64>, singular_values: &Array1<f64>, known_is_u: bool) -> Array2<f64> {
    let projected = if known_is_u { m.t().dot(known) } else { m.dot(known) };
    let mut out = projected;
    for (mut col, &s) in out.columns_mut().into_iter().zip(singular_values.iter()) {
        if s > 1e-12 {
            col /= s;
        } else {
            col.fill(0.0);
        }
    }
    if known_is_u {
        out.t().to_owned()
    } else {
        out
    }
}

/// Jacobi eigenvalue algorithm for a symmetric matrix. Returns
/// `(eigenvectors, eigenvalues)`, eigenvectors as columns, unsorted.
fn jacobi_eigen_symmetric(a: &Array2<f64>) -> (Array2<f64>, Array1<f64>) {
    let n = a.nrows();
    let mut a = a.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..MAX_JACOBI_SWEEPS {
        let off_diag: f64 = (0..n)
            .flat_map(|p| (0..n).map(move |q| (p, q)))
            .filter(|&(p, q)| p != q)
            .map(|(p, q)| a[[p, q]].abs())
            .sum();
        if off_diag < 1e-10 {
            break;
        }

        for p in 0..n.saturating_sub(1) {
            for q in (p + 1)..n {
                if a[[p, q]].abs() < 1e-14 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for i in 0..n {
                    let aip = a[[i, p]];
                    let aiq = a[[i, q]];
                    a[[i, p]] = c * aip - s * aiq;
                    a[[i, q]] = s * aip + c * aiq;
                }
                for i in 0..n {
                    let api = a[[p, i]];
                    let aqi = a[[q, i]];
                    a[[p, i]] = c * api - s * aqi;
                    a[[q, i]] = s * api + c * aqi;
                }
                for i in 0..n {
                    let vip = v[[i, p]];
                    let viq = v[[i, q]];
                    v[[i, p]] = c * vip - s * viq;
                    v[[i, q]] = s * vip + c * viq;
                }
            }
        }
    }

    let eigenvalues = Array1::from_iter((0..n).map(|i| a[[i, i]]));
    (v, eigenvalues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_has_no_residual() {
        let series = vec![50_i64; SEASONAL_PERIOD * 3];
        let scores = detect_weekly(&series);
        assert!(scores.iter().all(|s| s.abs() < 1.0), "{scores:?}");
    }

    #[test]
    fn shorter_than_one_period_is_all_zero() {
        let series = vec![10_i64; SEASONAL_PERIOD - 1];
        let scores = detect_weekly(&series);
        assert_eq!(scores, vec![0.0; series.len()]);
    }

    #[test]
    fn sudden_drop_after_stable_baseline_is_flagged() {
        let mut series = vec![100_i64; SEASONAL_PERIOD * 2];
        let last = series.len() - 1;
        series[last] = 1;
        let scores = detect_weekly(&series);
        assert!(scores[last] < -10.0, "expected a strong negative residual, got {}", scores[last]);
    }

    #[test]
    fn gentle_dip_within_two_orders_of_magnitude_stays_quiet() {
        let mut series: Vec<i64> = (0..SEASONAL_PERIOD * 2).map(|_| 100_i64).collect();
        let last = series.len() - 1;
        series[last] = 95;
        let scores = detect_weekly(&series);
        assert!(scores[last] > -10.0, "small dip should not be flagged, got {}", scores[last]);
    }
}
